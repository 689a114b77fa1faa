//! # Contacts and the Local Origin
//!
//! A [`Contact`] is how the overlay refers to a participant: an identifier
//! plus a transport endpoint. The identifier may be absent for bootstrap
//! seeds that are known only by address; it is learned from the seed's first
//! reply.
//!
//! [`Origin`] is the local participant. A single process may carry several
//! independent identities over one transport; each identity gets its own
//! routing table keyed by the origin address they all share.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DhtError;
use crate::id::NodeId;

/// A transport-level endpoint, built from a "host:port" string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(SocketAddr);

impl Address {
    /// Resolve a "host:port" string; the first resolved address wins.
    pub fn new(s: &str) -> Result<Self, DhtError> {
        let addr = s
            .to_socket_addrs()
            .map_err(|_| DhtError::InvalidAddress)
            .and_then(|mut addrs| addrs.next().ok_or(DhtError::InvalidAddress))?;
        Ok(Self(addr))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for Address {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A participant in the overlay: identifier plus endpoint.
///
/// `id` is `None` only for bootstrap seeds that have not yet replied.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Option<NodeId>,
    pub address: Address,
}

impl Contact {
    pub fn new(id: NodeId, address: Address) -> Self {
        Self {
            id: Some(id),
            address,
        }
    }

    /// A seed contact known only by address.
    pub fn seed(address: Address) -> Self {
        Self { id: None, address }
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{:?}@{}", id, self.address),
            None => write!(f, "?@{}", self.address),
        }
    }
}

/// The local participant: one shared address, one or more identities.
#[derive(Clone, Debug)]
pub struct Origin {
    ids: Vec<NodeId>,
    address: Address,
}

impl Origin {
    /// `ids` must be non-empty; the first entry is the default identity.
    pub fn new(ids: Vec<NodeId>, address: Address) -> Self {
        assert!(!ids.is_empty(), "origin requires at least one identity");
        Self { ids, address }
    }

    /// Single-identity origin with a freshly generated identifier.
    pub fn random(address: Address) -> Self {
        Self::new(vec![NodeId::random()], address)
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// The contact for identity `index`.
    ///
    /// Panics on out-of-range indices; identity indices only originate from
    /// routing contexts this process built itself.
    pub fn contact(&self, index: usize) -> Contact {
        Contact::new(self.ids[index], self.address)
    }

    /// Position of `id` among our identities, if it is one of ours.
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.ids.iter().position(|own| own == id)
    }
}
