//! # kadmesh — Kademlia-Style DHT Overlay
//!
//! kadmesh lets participating nodes locate one another by opaque
//! identifier, store and retrieve content-addressed values, and invoke
//! remote procedures on peers:
//!
//! - **Routing**: 160 k-buckets per identity with XOR-distance ordering and
//!   ping-based eviction of stale peers
//! - **Lookups**: α-parallel closest-first iteration for find-node,
//!   find-value, store, and bootstrap
//! - **Storage**: content-addressed values with density-scaled expiration
//!   and periodic replication
//! - **RPC**: named procedures registered at construction, invokable across
//!   the overlay
//! - **Multi-identity**: one transport, several independent identities,
//!   each with its own routing table
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `dht` | The engine: lookups, dispatch, timers, public operations |
//! | `id` | 160-bit identifiers, XOR metric, base58 boundary encoding |
//! | `contact` | Addresses, contacts, the multi-identity origin |
//! | `routing` | k-buckets, per-identity hash tables, route sets |
//! | `storage` | Content-addressed local store with deadlines |
//! | `messages` | Wire frames and the bounded bincode codec |
//! | `pending` | Request/response correlation futures |
//! | `transport` | Transport trait and the UDP datagram implementation |
//! | `resolver` | Public-address resolution seam |
//! | `rpc` | Named remote-procedure registry |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kadmesh::{Dht, DhtConfig, MemoryStorage, Origin, RpcRegistry, UdpTransport};
//!
//! # async fn run() -> Result<(), kadmesh::DhtError> {
//! let config = DhtConfig::default();
//! let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await?);
//! let origin = Origin::random(transport.local_address());
//! let storage = Arc::new(MemoryStorage::new(config.replicate_time));
//! let dht = Dht::new(storage, origin, transport, RpcRegistry::default(), config);
//!
//! let node = dht.clone();
//! tokio::spawn(async move { node.listen().await });
//! dht.bootstrap().await?;
//!
//! let ctx = dht.default_context();
//! let key = dht.store(&ctx, b"hello".to_vec()).await?;
//! assert!(dht.get(&ctx, &key).await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod contact;
pub mod dht;
pub mod error;
pub mod id;
pub mod messages;
pub mod pending;
pub mod resolver;
pub mod routing;
pub mod rpc;
pub mod storage;
pub mod transport;

pub use contact::{Address, Contact, Origin};
pub use dht::{Dht, DhtConfig, RoutingContext};
pub use error::{DhtError, TransportError};
pub use id::{NodeId, ID_BITS, ID_LENGTH};
pub use resolver::{AddressResolver, ExactResolver};
pub use routing::{MAX_CONTACTS, PARALLEL_CALLS};
pub use rpc::{RemoteProcedure, RpcRegistry};
pub use storage::{key_for, Key, MemoryStorage, Storage};
pub use transport::{Transport, UdpTransport};
