//! Protocol envelopes.
//!
//! Two tag namespaces ride the fabric: RPC envelopes between the two ends
//! of a connection, and bridge envelopes between peers and the relay. Both
//! are tagged records; functions never appear in envelope bodies. Unknown
//! tags deserialize to the `Unknown` variant and are ignored by every
//! dispatcher.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{CallId, Cid, TabId};
use crate::value::Value;

/// A serialized exception: the own-property snapshot of whatever the remote
/// method failed with. Travels in `rpc_reject` and bridge broadcast
/// envelopes, and is handed back to callers as an error value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Any extra fields the error carried.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl CallError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            fields: BTreeMap::new(),
        }
    }

    /// A generic error with the default name.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for CallError {}

/// Envelopes exchanged between the two ends of an RPC connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcEnvelope {
    /// Guest opens a connection: its fresh `cid`, method directory, and
    /// residual schema.
    HandshakeRequest {
        cid: Cid,
        method_names: Vec<String>,
        schema: Value,
    },
    /// Host answers with the same `cid` and its own directory; the guest
    /// echoes one more reply so the host can signal readiness.
    HandshakeReply {
        cid: Cid,
        method_names: Vec<String>,
        schema: Value,
    },
    RpcRequest {
        cid: Cid,
        call_id: CallId,
        call_name: String,
        args: Vec<Value>,
    },
    RpcResolve {
        cid: Cid,
        call_id: CallId,
        call_name: String,
        result: Value,
    },
    RpcReject {
        cid: Cid,
        call_id: CallId,
        call_name: String,
        error: CallError,
    },
    #[serde(other)]
    Unknown,
}

/// Error codes a relay may answer a bridge handshake with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeErrorCode {
    DuplicateTabId,
    InvalidPayload,
    UnknownError,
}

/// Envelopes exchanged between bridge peers and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEnvelope {
    BridgeHandshake {
        tab_id: TabId,
        method_names: Vec<String>,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
    BridgeHandshakeAck {
        tab_id: TabId,
        channel: String,
        shared_state: BTreeMap<String, Value>,
    },
    BridgeHandshakeError {
        code: BridgeErrorCode,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    BridgeBroadcast {
        sender_tab_id: TabId,
        channel: String,
        method_name: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CallError>,
    },
    BridgeRelay {
        sender_tab_id: TabId,
        method_name: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_error: Option<CallError>,
    },
    BridgeDirectMessage {
        sender_tab_id: TabId,
        target_tab_id: TabId,
        channel: String,
        method_name: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CallError>,
    },
    BridgeDisconnect {
        tab_id: TabId,
        channel: String,
    },
    BridgeGetTabs {
        channel: String,
        requesting_tab_id: TabId,
    },
    BridgeTabsResponse {
        tab_ids: Vec<TabId>,
        channel: String,
    },
    BridgeGetState {
        channel: String,
    },
    BridgeStateResponse {
        state: BTreeMap<String, Value>,
    },
    BridgeSetState {
        channel: String,
        key: String,
        value: Value,
    },
    BridgeStateUpdate {
        key: String,
        value: Value,
    },
    #[serde(other)]
    Unknown,
}

/// What a port delivery carries: one envelope from either namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Rpc(RpcEnvelope),
    Bridge(BridgeEnvelope),
}

impl Body {
    pub fn as_rpc(&self) -> Option<&RpcEnvelope> {
        match self {
            Body::Rpc(env) => Some(env),
            _ => None,
        }
    }

    pub fn as_bridge(&self) -> Option<&BridgeEnvelope> {
        match self {
            Body::Bridge(env) => Some(env),
            _ => None,
        }
    }
}

impl From<RpcEnvelope> for Body {
    fn from(env: RpcEnvelope) -> Self {
        Body::Rpc(env)
    }
}

impl From<BridgeEnvelope> for Body {
    fn from(env: BridgeEnvelope) -> Self {
        Body::Bridge(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_envelope_wire_shape() {
        let env = RpcEnvelope::RpcRequest {
            cid: Cid::from("c0000000001"),
            call_id: CallId::from("k0000000001"),
            call_name: "math.add".to_string(),
            args: vec![Value::from(1i64), Value::from(2i64)],
        };
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"rpc_request\""));
        assert!(text.contains("\"call_name\":\"math.add\""));

        let back: RpcEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn unknown_tags_are_tolerated() {
        let env: RpcEnvelope = serde_json::from_str(r#"{"type":"not_a_thing","x":1}"#).unwrap();
        assert_eq!(env, RpcEnvelope::Unknown);

        let env: BridgeEnvelope = serde_json::from_str(r#"{"type":"mystery"}"#).unwrap();
        assert_eq!(env, BridgeEnvelope::Unknown);
    }

    #[test]
    fn bridge_error_code_wire_shape() {
        let env = BridgeEnvelope::BridgeHandshakeError {
            code: BridgeErrorCode::DuplicateTabId,
            error: "tab id already registered".to_string(),
            tab_id: Some(TabId::from("t")),
            channel: None,
        };
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"code\":\"DUPLICATE_TAB_ID\""));
    }

    #[test]
    fn call_error_round_trips_extra_fields() {
        let err = CallError::new("TypeError", "boom")
            .with_stack("at line 1")
            .with_field("status", Value::from(502i64));
        let text = serde_json::to_string(&err).unwrap();
        let back: CallError = serde_json::from_str(&text).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.fields.get("status"), Some(&Value::from(502i64)));
    }
}
