//! RPC error types.

use thiserror::Error;
use weft_core::{CallError, PortError};

#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection was closed locally; no envelope was sent.
    #[error("connection is closed")]
    Closed,
    /// The handshake could not complete (torn down, or the setup hook
    /// failed). An unvalidated peer never produces this: those messages
    /// are dropped without a reply.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The dotted path names no method in the peer's directory.
    #[error("no such remote method: {0}")]
    UnknownMethod(String),
    /// The remote method threw; the payload is its serialized snapshot.
    #[error("remote method failed: {0}")]
    Remote(CallError),
    #[error(transparent)]
    Port(#[from] PortError),
}

/// Lets a method body `?` a nested remote call; the remote's own error
/// passes through unchanged, engine failures become error-shaped values.
impl From<RpcError> for CallError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(e) => e,
            other => CallError::new("RpcError", other.to_string()),
        }
    }
}
