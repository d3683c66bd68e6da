//! Core primitives for the weft messaging fabric.
//!
//! This crate provides the protocol building blocks. The RPC engine, the
//! bridge client, and the relay daemon live in their own crates; this one
//! owns what they all share: the value model that crosses endpoints, the
//! envelope grammar, schema decomposition, identifiers, and the port
//! transport.

mod envelope;
mod identity;
mod origin;
mod path;
mod port;
mod schema;
mod transfer;
mod value;

pub use envelope::{Body, BridgeEnvelope, BridgeErrorCode, CallError, RpcEnvelope};
pub use identity::{CallId, Cid, TabId};
pub use origin::{normalize_origin, origin_matches, OriginError};
pub use path::{path_get, path_set};
pub use port::{Delivery, EndpointId, Family, ListenerId, Port, PortError, PortSender, SendOptions};
pub use schema::{decompose, Method, MethodDirectory, MethodFuture, Peer, PeerCaller, Schema};
pub use transfer::{take_transferables, transferable, wrap_transfer};
pub use value::{Buffer, Value};
