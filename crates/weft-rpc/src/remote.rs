//! The remote proxy.
//!
//! Built from the peer's method directory and residual schema during the
//! handshake. Calls serialize into `rpc_request` envelopes and resolve by
//! `call_id` correlation; the peer's non-method configuration survives as
//! readable data on the proxy.

use std::sync::{Arc, Weak};

use tokio::sync::oneshot;
use weft_core::{
    path_set, take_transferables, Body, CallError, CallId, Cid, MethodFuture, PeerCaller,
    RpcEnvelope, Value,
};

use crate::connection::ConnState;
use crate::error::RpcError;
use crate::pending::PendingCall;

/// Marker written into [`Remote::snapshot`] at every method path.
const METHOD_MARKER: &str = "[remote method]";

struct RemoteInner {
    cid: Cid,
    state: Arc<ConnState>,
    methods: Vec<String>,
    schema: Value,
}

/// Proxy for the peer's schema. Cheap to clone.
#[derive(Clone)]
pub struct Remote {
    inner: Arc<RemoteInner>,
}

pub(crate) struct RemoteWeak(Weak<RemoteInner>);

impl RemoteWeak {
    pub fn upgrade(&self) -> Option<Remote> {
        self.0.upgrade().map(|inner| Remote { inner })
    }
}

impl Remote {
    pub(crate) fn new(state: Arc<ConnState>, cid: Cid, methods: Vec<String>, schema: Value) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                cid,
                state,
                methods,
                schema,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> RemoteWeak {
        RemoteWeak(Arc::downgrade(&self.inner))
    }

    /// Dotted paths of every remote method, in directory order.
    pub fn methods(&self) -> &[String] {
        &self.inner.methods
    }

    /// The peer's residual configuration data.
    pub fn schema(&self) -> &Value {
        &self.inner.schema
    }

    /// Configuration data at a dotted path.
    pub fn data(&self, path: &str) -> Option<&Value> {
        weft_core::path_get(&self.inner.schema, path)
    }

    /// Materialise the proxy tree: the residual schema with a marker at
    /// every method path. Numeric path segments create array slots.
    pub fn snapshot(&self) -> Value {
        let mut tree = self.inner.schema.clone();
        for path in &self.inner.methods {
            path_set(&mut tree, path, Value::from(METHOD_MARKER));
        }
        tree
    }

    /// Invoke a remote method and await its result.
    ///
    /// A fresh `call_id` correlates the response; responses may arrive in
    /// any order. Transfer-tagged values in `args` are moved, not copied.
    pub async fn call(&self, path: &str, mut args: Vec<Value>) -> Result<Value, RpcError> {
        let state = &self.inner.state;
        if state.is_closed() {
            return Err(RpcError::Closed);
        }
        if !self.inner.methods.iter().any(|m| m == path) {
            return Err(RpcError::UnknownMethod(path.to_string()));
        }

        let call_id = CallId::fresh();
        let (tx, rx) = oneshot::channel();

        let listener = {
            let weak = Arc::downgrade(state);
            let cid = self.inner.cid.clone();
            let call_id = call_id.clone();
            let call_name = path.to_string();
            state.port.on(move |delivery| {
                let outcome = match delivery.data() {
                    Body::Rpc(RpcEnvelope::RpcResolve {
                        cid: c,
                        call_id: k,
                        call_name: n,
                        result,
                    }) if *c == cid && *k == call_id && *n == call_name => Ok(result.clone()),
                    Body::Rpc(RpcEnvelope::RpcReject {
                        cid: c,
                        call_id: k,
                        call_name: n,
                        error,
                    }) if *c == cid && *k == call_id && *n == call_name => Err(error.clone()),
                    _ => return,
                };
                let Some(state) = weak.upgrade() else { return };
                // First matching response wins; the entry and its listener
                // go away together.
                if let Some(call) = state.pending.take(&call_id) {
                    state.port.off(call.listener);
                    let _ = call.tx.send(outcome);
                }
            })
        };
        state.pending.insert(call_id.clone(), PendingCall { tx, listener });

        let mut transfer = Vec::new();
        for arg in &mut args {
            transfer.extend(take_transferables(arg));
        }
        let request = RpcEnvelope::RpcRequest {
            cid: self.inner.cid.clone(),
            call_id: call_id.clone(),
            call_name: path.to_string(),
            args,
        };
        if let Err(err) = state.send(request, transfer) {
            if let Some(call) = state.pending.take(&call_id) {
                state.port.off(call.listener);
            }
            return Err(err);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(RpcError::Remote(error)),
            // The sender only disappears once the connection itself is
            // gone; while it merely closed, parked entries keep us pending.
            Err(_) => Err(RpcError::Closed),
        }
    }
}

impl PeerCaller for Remote {
    fn call(&self, path: &str, args: Vec<Value>) -> MethodFuture {
        let remote = self.clone();
        let path = path.to_string();
        Box::pin(async move {
            remote
                .call(&path, args)
                .await
                .map_err(CallError::from)
        })
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("cid", &self.inner.cid)
            .field("methods", &self.inner.methods)
            .finish()
    }
}
