//! # Remote Procedure Registry
//!
//! User code registers named procedures at construction; the dispatcher
//! invokes them for inbound RPC requests and `remote_procedure_call`
//! invokes them directly when the target is the local node. Handlers
//! receive the calling peer and the raw argument list.

use std::collections::HashMap;
use std::sync::Arc;

use crate::contact::Contact;
use crate::error::DhtError;

/// A registered procedure: `(sender, args) -> result bytes`.
pub type RemoteProcedure =
    Arc<dyn Fn(&Contact, &[Vec<u8>]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Name-keyed procedure table.
#[derive(Clone, Default)]
pub struct RpcRegistry {
    methods: HashMap<String, RemoteProcedure>,
}

impl RpcRegistry {
    pub fn new(methods: HashMap<String, RemoteProcedure>) -> Self {
        Self { methods }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Contact, &[Vec<u8>]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(handler));
    }

    /// Invoke `method`. Unknown names and handler failures surface as
    /// [`DhtError::Handler`] with the message the caller will see.
    pub fn invoke(
        &self,
        sender: &Contact,
        method: &str,
        args: &[Vec<u8>],
    ) -> Result<Vec<u8>, DhtError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| DhtError::Handler(format!("unknown method: {method}")))?;
        handler(sender, args).map_err(|e| DhtError::Handler(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Address;
    use crate::id::{NodeId, ID_LENGTH};

    fn caller() -> Contact {
        Contact::new(
            NodeId::from_bytes([1; ID_LENGTH]),
            Address::new("127.0.0.1:4001").unwrap(),
        )
    }

    #[test]
    fn invokes_registered_handler_with_args() {
        let mut registry = RpcRegistry::default();
        registry.register("join", |_sender, args| {
            Ok(args.join(&b' ').to_vec())
        });

        let result = registry
            .invoke(&caller(), "join", &[b"x".to_vec(), b"y".to_vec()])
            .unwrap();
        assert_eq!(result, b"x y");
    }

    #[test]
    fn unknown_method_is_a_handler_error() {
        let registry = RpcRegistry::default();
        let err = registry.invoke(&caller(), "missing", &[]).unwrap_err();
        assert!(matches!(err, DhtError::Handler(msg) if msg.contains("missing")));
    }

    #[test]
    fn handler_failures_carry_their_message() {
        let mut registry = RpcRegistry::default();
        registry.register("fail", |_sender, _args| anyhow::bail!("no can do"));

        let err = registry.invoke(&caller(), "fail", &[]).unwrap_err();
        assert!(matches!(err, DhtError::Handler(msg) if msg.contains("no can do")));
    }
}
