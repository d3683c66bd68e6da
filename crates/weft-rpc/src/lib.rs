//! Host/guest RPC over a single port.
//!
//! Each side publishes a schema; after a three-step handshake each holds a
//! [`Remote`] proxy for the other's methods. Many calls may be in flight at
//! once over one connection; correlation is by per-call identifier, not
//! arrival order. See the crate-level docs of `weft-core` for the value
//! model and envelope grammar.

mod connect;
mod connection;
mod dispatch;
mod error;
mod pending;
mod remote;

pub use connect::{connect_guest, connect_host, spawn_worker, Frame, Guest, GuestOptions, SetupHook, Worker};
pub use connection::Connection;
pub use error::RpcError;
pub use remote::Remote;
