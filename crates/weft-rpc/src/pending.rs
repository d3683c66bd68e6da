//! The pending-call table.
//!
//! One entry per in-flight invocation, keyed by `call_id`. The first
//! matching response takes the entry out; a response with no entry is
//! ignored. On `close()` live entries are parked rather than dropped so
//! outstanding call futures stay pending instead of resolving with a
//! cancellation the protocol never promised.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use weft_core::{CallError, CallId, ListenerId, Value};

pub(crate) struct PendingCall {
    pub tx: oneshot::Sender<Result<Value, CallError>>,
    pub listener: ListenerId,
}

#[derive(Default)]
struct Table {
    live: HashMap<CallId, PendingCall>,
    parked: Vec<PendingCall>,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    inner: Mutex<Table>,
}

impl PendingCalls {
    pub fn insert(&self, call_id: CallId, call: PendingCall) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .live
            .insert(call_id, call);
    }

    /// Take the entry for a response; `None` means already answered or
    /// never ours.
    pub fn take(&self, call_id: &CallId) -> Option<PendingCall> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .live
            .remove(call_id)
    }

    /// Park every live entry, returning the listeners to detach.
    pub fn park_all(&self) -> Vec<ListenerId> {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut listeners = Vec::new();
        let drained: Vec<PendingCall> = table.live.drain().map(|(_, call)| call).collect();
        for call in drained {
            listeners.push(call.listener);
            table.parked.push(call);
        }
        listeners
    }
}
