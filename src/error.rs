//! Crate-level error type.

use thiserror::Error;

/// Result alias for fallible meshtris operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the launcher. Everything here is fatal at startup;
/// runtime failures inside a session are handled by the peer core instead
/// (teardown, back to matchmaking).
#[derive(Debug, Error)]
pub enum Error {
    /// Socket setup failed (multicast join, UDP bind).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The RPC listener could not be published.
    #[error(transparent)]
    Rpc(#[from] crate::rpc::RpcError),

    /// Unusable launch arguments.
    #[error("invalid configuration: {0}")]
    Config(String),
}
