//! Error types for the DHT engine.
//!
//! Foreground operations surface these to the caller; background loops
//! (dispatcher, timers, replication) log failures and continue.

use thiserror::Error;

/// Errors returned by DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Key failed base58 decoding or is not `ID_LENGTH` bytes long.
    #[error("invalid key")]
    InvalidKey,

    /// An endpoint string did not resolve to a usable address.
    #[error("invalid address")]
    InvalidAddress,

    /// The lookup target could not be located in the network.
    #[error("node not found")]
    NodeNotFound,

    /// No response arrived within the configured timeout.
    #[error("timeout")]
    Timeout,

    /// A response future resolved without a message.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// A remote procedure handler reported failure.
    #[error("{0}")]
    Handler(String),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    /// The transport has been stopped and no longer accepts traffic.
    #[error("transport stopped")]
    Stopped,
}
