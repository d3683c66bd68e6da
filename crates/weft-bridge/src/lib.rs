//! The cross-context bridge.
//!
//! N peers bind to a named channel on a shared relay, each publishing the
//! same schema. Calling a method through the bridge runs it locally,
//! returns the local outcome to the caller, and fans the invocation out so
//! every *other* peer re-executes the identical body against its own state.
//! Relayed invocations never reply; their purpose is to reproduce state,
//! not to exchange results.

mod client;
mod error;
mod link;

pub use client::{connect_bridge, Bridge, BridgeOptions, RelayTarget, TabProxy};
pub use error::BridgeError;
