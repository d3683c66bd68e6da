//! Connection establishment.
//!
//! The guest opens: it mints the `cid`, sends `handshake_request`, and the
//! host replies with the same `cid` and its own directory. A final reply
//! echoed by the guest tells the host both sides are registered. Frame
//! hosts validate the sender's endpoint identity and origin before acting;
//! anything else is dropped without a reply, so a connect against a hostile
//! sender simply never resolves.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use weft_core::{
    decompose, origin_matches, Body, Cid, EndpointId, Port, RpcEnvelope, Schema, Value,
};

use crate::connection::{ConnState, Connection};
use crate::dispatch::register_servers;
use crate::error::RpcError;
use crate::remote::Remote;

/// A spawned worker context: the host-side port plus the task handle that
/// `close()` aborts.
pub struct Worker {
    pub(crate) port: Port,
    pub(crate) handle: JoinHandle<()>,
}

/// Spawn a worker task. The body receives the worker-side port and usually
/// calls [`connect_guest`] on it.
pub fn spawn_worker<F, Fut>(body: F) -> Worker
where
    F: FnOnce(Port) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (host_side, worker_side) = Port::pair();
    let handle = tokio::spawn(body(worker_side));
    Worker {
        port: host_side,
        handle,
    }
}

/// A document-frame guest: a window-family port plus what the host expects
/// of the far end. Handshakes from any other source or origin are ignored.
pub struct Frame {
    pub(crate) port: Port,
    pub(crate) expected_origin: String,
    pub(crate) expected_source: EndpointId,
}

impl Frame {
    /// Open a frame under a host. Returns the host's frame handle and the
    /// guest's window port.
    pub fn open(host_origin: impl Into<String>, frame_origin: impl Into<String>) -> (Frame, Port) {
        let frame_origin = frame_origin.into();
        let (host_port, guest_port) = Port::window_pair(host_origin, frame_origin.clone());
        let frame = Frame {
            port: host_port,
            expected_origin: frame_origin,
            expected_source: guest_port.id(),
        };
        (frame, guest_port)
    }

    /// Override the origin this frame is expected to speak from. Compared
    /// normalised, so `https://a.example:443` and `https://a.example` name
    /// the same origin.
    pub fn expect_origin(mut self, origin: impl Into<String>) -> Frame {
        self.expected_origin = origin.into();
        self
    }

    /// The host-side window port; exposed so tests can aim foreign senders
    /// at it.
    pub fn host_port(&self) -> &Port {
        &self.port
    }
}

/// The kinds of guest a host can connect.
pub enum Guest {
    Worker(Worker),
    Frame(Frame),
    SharedWorker(Port),
}

impl From<Worker> for Guest {
    fn from(w: Worker) -> Self {
        Guest::Worker(w)
    }
}

impl From<Frame> for Guest {
    fn from(f: Frame) -> Self {
        Guest::Frame(f)
    }
}

impl From<Port> for Guest {
    fn from(p: Port) -> Self {
        Guest::SharedWorker(p)
    }
}

/// Hook run on the guest after its proxy is ready and before the final
/// handshake echo; lets the guest preload state over RPC while the host is
/// still waiting to resolve.
pub type SetupHook =
    Box<dyn FnOnce(Remote) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send>> + Send>;

#[derive(Default)]
pub struct GuestOptions {
    /// Origin to address the host as; required when the guest port is
    /// window-family.
    pub target_origin: Option<String>,
    pub on_connection_setup: Option<SetupHook>,
}

impl GuestOptions {
    pub fn target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = Some(origin.into());
        self
    }

    pub fn on_connection_setup<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(Remote) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.on_connection_setup = Some(Box::new(move |remote| Box::pin(hook(remote))));
        self
    }
}

/// Connect as the guest on an existing port.
pub async fn connect_guest(
    port: Port,
    schema: Schema,
    options: GuestOptions,
) -> Result<Connection, RpcError> {
    let cid = Cid::fresh();
    let (directory, residual) = decompose(schema);
    let state = ConnState::new(port, options.target_origin);
    let _ = state.cid.set(cid.clone());

    let (reply_tx, reply_rx) = oneshot::channel::<(Vec<String>, Value)>();
    let reply_slot = Arc::new(Mutex::new(Some(reply_tx)));
    let listener = {
        let cid = cid.clone();
        let reply_slot = reply_slot.clone();
        state.port.on(move |delivery| {
            let Body::Rpc(RpcEnvelope::HandshakeReply {
                cid: c,
                method_names,
                schema,
            }) = delivery.data()
            else {
                return;
            };
            // Replies for any other cid are rejected.
            if *c != cid {
                return;
            }
            if let Some(tx) = reply_slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send((method_names.clone(), schema.clone()));
            }
        })
    };
    state.track(listener);

    state.send(
        RpcEnvelope::HandshakeRequest {
            cid: cid.clone(),
            method_names: directory.paths(),
            schema: residual.clone(),
        },
        Vec::new(),
    )?;

    let (host_methods, host_schema) = reply_rx
        .await
        .map_err(|_| RpcError::Handshake("torn down before the host replied".to_string()))?;

    let remote = Remote::new(state.clone(), cid.clone(), host_methods, host_schema);
    register_servers(&state, &cid, &directory, &remote);

    if let Some(setup) = options.on_connection_setup {
        setup(remote.clone()).await?;
    }

    state.send(
        RpcEnvelope::HandshakeReply {
            cid: cid.clone(),
            method_names: directory.paths(),
            schema: residual,
        },
        Vec::new(),
    )?;

    Ok(Connection::assemble(state, cid, remote))
}

/// Connect as the host over a guest context.
pub async fn connect_host(guest: impl Into<Guest>, schema: Schema) -> Result<Connection, RpcError> {
    let (port, validation, worker, target_origin) = match guest.into() {
        Guest::Worker(w) => (w.port, None, Some(w.handle), None),
        Guest::Frame(f) => (
            f.port,
            Some((f.expected_source, f.expected_origin.clone())),
            None,
            Some(f.expected_origin),
        ),
        Guest::SharedWorker(p) => (p, None, None, None),
    };

    let (directory, residual) = decompose(schema);
    let state = ConnState::new(port, target_origin);
    *state.worker.lock().unwrap_or_else(|e| e.into_inner()) = worker;

    let (request_tx, request_rx) = oneshot::channel::<(Cid, Vec<String>, Value)>();
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let request_slot = Arc::new(Mutex::new(Some(request_tx)));
    let ready_slot = Arc::new(Mutex::new(Some(ready_tx)));
    let accepted: Arc<Mutex<Option<Cid>>> = Arc::new(Mutex::new(None));

    let listener = {
        let request_slot = request_slot.clone();
        let ready_slot = ready_slot.clone();
        let accepted = accepted.clone();
        state.port.on(move |delivery| match delivery.data() {
            Body::Rpc(RpcEnvelope::HandshakeRequest {
                cid,
                method_names,
                schema,
            }) => {
                if let Some((source, origin)) = &validation {
                    let source_ok = delivery.source() == Some(*source);
                    let origin_ok = delivery
                        .origin()
                        .is_some_and(|o| origin_matches(origin, o));
                    if !source_ok || !origin_ok {
                        tracing::debug!("dropping handshake from unvalidated endpoint");
                        return;
                    }
                }
                let mut accepted = accepted.lock().unwrap_or_else(|e| e.into_inner());
                if accepted.is_some() {
                    return;
                }
                if let Some(tx) = request_slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    *accepted = Some(cid.clone());
                    let _ = tx.send((cid.clone(), method_names.clone(), schema.clone()));
                }
            }
            Body::Rpc(RpcEnvelope::HandshakeReply { cid, .. }) => {
                // The guest's final echo; echoes for unknown cids are
                // rejected.
                if accepted.lock().unwrap_or_else(|e| e.into_inner()).as_ref() == Some(cid) {
                    if let Some(tx) = ready_slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                        let _ = tx.send(());
                    }
                }
            }
            _ => {}
        })
    };
    state.track(listener);

    let (cid, guest_methods, guest_schema) = request_rx
        .await
        .map_err(|_| RpcError::Handshake("torn down before a guest arrived".to_string()))?;
    let _ = state.cid.set(cid.clone());

    let remote = Remote::new(state.clone(), cid.clone(), guest_methods, guest_schema);
    register_servers(&state, &cid, &directory, &remote);

    state.send(
        RpcEnvelope::HandshakeReply {
            cid: cid.clone(),
            method_names: directory.paths(),
            schema: residual,
        },
        Vec::new(),
    )?;

    ready_rx
        .await
        .map_err(|_| RpcError::Handshake("torn down before the guest confirmed".to_string()))?;

    Ok(Connection::assemble(state, cid, remote))
}
