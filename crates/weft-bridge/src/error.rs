//! Bridge error types.

use thiserror::Error;
use weft_core::{PortError, TabId};

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The relay already holds this tab id on the channel; the connect is
    /// fatal (the *prior* holder is the one that gets evicted on a
    /// colliding handshake, so a fresh connect failing this way raced a
    /// reconnection of itself).
    #[error("duplicate tab id: {0}")]
    DuplicateTabId(TabId),
    /// The relay refused the handshake for another reason.
    #[error("relay rejected handshake: {0}")]
    Rejected(String),
    /// The relay could not be reached, or went away mid-exchange.
    #[error("relay unavailable: {0}")]
    Relay(String),
    #[error("bridge is closed")]
    Closed,
    #[error(transparent)]
    Port(#[from] PortError),
}
