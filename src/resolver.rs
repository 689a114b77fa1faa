//! Public-address resolution seam.
//!
//! The engine advertises whatever address the resolver returns for the
//! bound socket. [`ExactResolver`] advertises the bound address as-is; a
//! STUN-backed implementation can be injected through the same trait.

use async_trait::async_trait;

use crate::contact::Address;
use crate::error::DhtError;

#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// The publicly reachable address for a socket bound at `local`.
    async fn resolve(&self, local: Address) -> Result<Address, DhtError>;
}

/// Advertises the bound address unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactResolver;

#[async_trait]
impl AddressResolver for ExactResolver {
    async fn resolve(&self, local: Address) -> Result<Address, DhtError> {
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_resolver_is_identity() {
        let local = Address::new("127.0.0.1:4100").unwrap();
        let resolved = ExactResolver.resolve(local).await.unwrap();
        assert_eq!(resolved, local);
    }
}
