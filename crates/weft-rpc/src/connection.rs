//! Connection state and teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::task::JoinHandle;
use weft_core::{Body, Buffer, Cid, ListenerId, Port, RpcEnvelope, SendOptions};

use crate::error::RpcError;
use crate::pending::PendingCalls;
use crate::remote::Remote;

/// Shared state behind a connection: the port, the listeners this
/// connection owns, and the pending-call table. Every listener registered
/// through [`ConnState::track`] is removed again on close; that list is the
/// scoped-acquisition discipline the teardown contract requires.
pub(crate) struct ConnState {
    pub cid: OnceLock<Cid>,
    pub port: Port,
    pub target_origin: Option<String>,
    pub registrations: Mutex<Vec<ListenerId>>,
    pub pending: PendingCalls,
    pub worker: Mutex<Option<JoinHandle<()>>>,
    pub closed: AtomicBool,
}

impl ConnState {
    pub fn new(port: Port, target_origin: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            cid: OnceLock::new(),
            port,
            target_origin,
            registrations: Mutex::new(Vec::new()),
            pending: PendingCalls::default(),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn track(&self, listener: ListenerId) {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, envelope: RpcEnvelope, transfer: Vec<Buffer>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let options = SendOptions {
            target_origin: self.target_origin.clone(),
            transfer,
        };
        self.port.send(Body::Rpc(envelope), options)?;
        Ok(())
    }
}

/// An established RPC connection.
pub struct Connection {
    cid: Cid,
    remote: Remote,
    state: Arc<ConnState>,
}

impl Connection {
    pub(crate) fn assemble(state: Arc<ConnState>, cid: Cid, remote: Remote) -> Self {
        Self { cid, remote, state }
    }

    /// The connection identifier carried on every envelope.
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// The proxy for the peer's schema.
    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// Tear the connection down: every listener it attached is removed,
    /// the pending-call table is dropped, and an owned worker is aborted.
    ///
    /// Idempotent. Calls still in flight are left unresolved; callers that
    /// need a bound must race their own timeout.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<ListenerId> = self
            .state
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for listener in listeners {
            self.state.port.off(listener);
        }
        for listener in self.state.pending.park_all() {
            self.state.port.off(listener);
        }
        if let Some(worker) = self
            .state
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            worker.abort();
        }
    }
}
