//! The bridge client.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, oneshot, watch};
use weft_core::{
    decompose, BridgeEnvelope, BridgeErrorCode, CallError, MethodDirectory, Peer, Port, Schema,
    TabId, Value,
};
use weft_relay::Relay;

use crate::error::BridgeError;
use crate::link::{PortLink, RelayLink, WsLink};

/// How to reach the relay.
pub enum RelayTarget {
    /// A port obtained from `Relay::attach` on an in-process relay.
    Local(Port),
    /// A standalone relay daemon, e.g. `ws://127.0.0.1:9777`.
    Url(String),
}

#[derive(Default)]
pub struct BridgeOptions {
    /// Defaults to a private in-process relay, the embedded fallback for
    /// contexts that share nothing yet.
    pub relay: Option<RelayTarget>,
    /// Channel name; `"default"` when omitted.
    pub channel: Option<String>,
    /// Peer identity; freshly minted when omitted.
    pub tab_id: Option<TabId>,
}

impl BridgeOptions {
    pub fn relay(mut self, target: RelayTarget) -> Self {
        self.relay = Some(target);
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn tab_id(mut self, tab_id: impl Into<TabId>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }
}

type AckResult = Result<BTreeMap<String, Value>, (BridgeErrorCode, String)>;

#[derive(Default)]
struct Waiters {
    ack: Option<oneshot::Sender<AckResult>>,
    tabs: VecDeque<oneshot::Sender<Vec<TabId>>>,
    state: VecDeque<oneshot::Sender<BTreeMap<String, Value>>>,
}

struct BridgeInner {
    tab_id: TabId,
    channel: String,
    directory: MethodDirectory,
    link: Arc<dyn RelayLink>,
    dispatcher: AtomicU64,
    waiters: Mutex<Waiters>,
    shared: Mutex<BTreeMap<String, Value>>,
    state_tx: broadcast::Sender<(String, Value)>,
    evicted_tx: watch::Sender<Option<String>>,
    closed: AtomicBool,
    // Keeps a private relay alive for the default-target case.
    _relay: Option<Relay>,
}

impl BridgeInner {
    fn dispatch(&self, envelope: &BridgeEnvelope) {
        match envelope {
            BridgeEnvelope::BridgeHandshakeAck {
                tab_id,
                channel,
                shared_state,
            } => {
                if *tab_id != self.tab_id || *channel != self.channel {
                    return;
                }
                *self.shared.lock().unwrap_or_else(|e| e.into_inner()) = shared_state.clone();
                if let Some(tx) = self
                    .waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .ack
                    .take()
                {
                    let _ = tx.send(Ok(shared_state.clone()));
                }
            }

            BridgeEnvelope::BridgeHandshakeError { code, error, .. } => {
                let ack = self
                    .waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .ack
                    .take();
                match ack {
                    // Still connecting: fatal connect failure.
                    Some(tx) => {
                        let _ = tx.send(Err((*code, error.clone())));
                    }
                    // Established: another peer took our identity and the
                    // relay evicted us.
                    None => {
                        self.closed.store(true, Ordering::SeqCst);
                        let _ = self.evicted_tx.send(Some(error.clone()));
                    }
                }
            }

            BridgeEnvelope::BridgeRelay {
                sender_tab_id,
                method_name,
                args,
                ..
            } => {
                let Some(method) = self.directory.get(method_name) else {
                    tracing::warn!(method = %method_name, "relayed invocation for unknown method");
                    return;
                };
                let method = method.clone();
                let args = args.clone();
                let method_name = method_name.clone();
                let sender = sender_tab_id.clone();
                // Relayed invocations reproduce state and never reply;
                // failures are logged and swallowed.
                tokio::spawn(async move {
                    if let Err(e) = method(args, Peer::detached()).await {
                        tracing::warn!(
                            method = %method_name,
                            sender = %sender,
                            error = %e,
                            "relayed invocation failed"
                        );
                    }
                });
            }

            BridgeEnvelope::BridgeTabsResponse { tab_ids, channel } => {
                if *channel != self.channel {
                    return;
                }
                if let Some(tx) = self
                    .waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .tabs
                    .pop_front()
                {
                    let _ = tx.send(tab_ids.clone());
                }
            }

            BridgeEnvelope::BridgeStateResponse { state } => {
                if let Some(tx) = self
                    .waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .state
                    .pop_front()
                {
                    let _ = tx.send(state.clone());
                }
            }

            BridgeEnvelope::BridgeStateUpdate { key, value } => {
                self.shared
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.clone(), value.clone());
                let _ = self.state_tx.send((key.clone(), value.clone()));
            }

            _ => {}
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A peer's membership in a bridge channel.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

/// Bind to a channel on the relay and publish a schema.
pub async fn connect_bridge(schema: Schema, options: BridgeOptions) -> Result<Bridge, BridgeError> {
    let tab_id = options.tab_id.unwrap_or_else(TabId::fresh);
    let channel = options.channel.unwrap_or_else(|| "default".to_string());
    let (directory, residual) = decompose(schema);

    let mut private_relay = None;
    let link: Arc<dyn RelayLink> = match options.relay {
        Some(RelayTarget::Local(port)) => Arc::new(PortLink::new(port)),
        Some(RelayTarget::Url(url)) => Arc::new(WsLink::connect(&url).await?),
        None => {
            let relay = Relay::new();
            let port = relay.attach();
            private_relay = Some(relay);
            Arc::new(PortLink::new(port))
        }
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    let (evicted_tx, _) = watch::channel(None);
    let (state_tx, _) = broadcast::channel(64);

    let inner = Arc::new(BridgeInner {
        tab_id: tab_id.clone(),
        channel: channel.clone(),
        directory: directory.clone(),
        link: link.clone(),
        dispatcher: AtomicU64::new(0),
        waiters: Mutex::new(Waiters {
            ack: Some(ack_tx),
            ..Waiters::default()
        }),
        shared: Mutex::new(BTreeMap::new()),
        state_tx,
        evicted_tx,
        closed: AtomicBool::new(false),
        _relay: private_relay,
    });

    let dispatcher = {
        let weak = Arc::downgrade(&inner);
        link.on(Arc::new(move |envelope: &BridgeEnvelope| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(envelope);
            }
        }))
    };
    inner.dispatcher.store(dispatcher, Ordering::SeqCst);

    let seed = match &residual {
        Value::Map(entries) if !entries.is_empty() => Some(residual.clone()),
        _ => None,
    };
    link.send(BridgeEnvelope::BridgeHandshake {
        tab_id: tab_id.clone(),
        method_names: directory.paths(),
        channel,
        schema: seed,
    })
    .await?;

    match ack_rx.await {
        Ok(Ok(_snapshot)) => Ok(Bridge { inner }),
        Ok(Err((BridgeErrorCode::DuplicateTabId, _))) => Err(BridgeError::DuplicateTabId(tab_id)),
        Ok(Err((_, error))) => Err(BridgeError::Rejected(error)),
        Err(_) => Err(BridgeError::Relay(
            "relay went away before acknowledging".to_string(),
        )),
    }
}

impl Bridge {
    pub fn tab_id(&self) -> &TabId {
        &self.inner.tab_id
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Dotted paths of the published methods.
    pub fn methods(&self) -> Vec<String> {
        self.inner.directory.paths()
    }

    /// Invoke a method: runs it locally, returns the local outcome, and
    /// broadcasts the invocation (with the captured result or error) so
    /// every other peer on the channel re-executes it. The caller never
    /// receives its own relay.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(CallError::new("RpcError", "bridge is closed"));
        }
        let body = inner
            .directory
            .get(method)
            .ok_or_else(|| CallError::new("ReferenceError", format!("no such method: {method}")))?
            .clone();

        let outcome = body(args.clone(), Peer::detached()).await;

        let envelope = BridgeEnvelope::BridgeBroadcast {
            sender_tab_id: inner.tab_id.clone(),
            channel: inner.channel.clone(),
            method_name: method.to_string(),
            args,
            result: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().cloned(),
        };
        if let Err(e) = inner.link.send(envelope).await {
            tracing::warn!(error = %e, "failed to publish broadcast");
        }

        outcome
    }

    /// A proxy whose invocations go to one peer instead of the channel.
    pub fn to_tab(&self, target: impl Into<TabId>) -> TabProxy {
        TabProxy {
            inner: self.inner.clone(),
            target: target.into(),
        }
    }

    /// Ask the relay who is on the channel.
    pub async fn connected_tabs(&self) -> Result<Vec<TabId>, BridgeError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BridgeError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        inner
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tabs
            .push_back(tx);
        inner
            .link
            .send(BridgeEnvelope::BridgeGetTabs {
                channel: inner.channel.clone(),
                requesting_tab_id: inner.tab_id.clone(),
            })
            .await?;
        rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Fetch the relay's shared-state snapshot. State operations are
    /// relay-internal unless a consumer opts in through this surface.
    pub async fn shared_state(&self) -> Result<BTreeMap<String, Value>, BridgeError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BridgeError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        inner
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .push_back(tx);
        inner
            .link
            .send(BridgeEnvelope::BridgeGetState {
                channel: inner.channel.clone(),
            })
            .await?;
        rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Write one shared-state key; the relay fans the update out to every
    /// peer of the channel, this one included.
    pub async fn set_shared(&self, key: impl Into<String>, value: Value) -> Result<(), BridgeError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BridgeError::Closed);
        }
        inner
            .link
            .send(BridgeEnvelope::BridgeSetState {
                channel: inner.channel.clone(),
                key: key.into(),
                value,
            })
            .await
    }

    /// The last shared-state snapshot this peer has seen.
    pub fn cached_shared(&self) -> BTreeMap<String, Value> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Subscribe to shared-state updates.
    pub fn state_updates(&self) -> broadcast::Receiver<(String, Value)> {
        self.inner.state_tx.subscribe()
    }

    /// Resolves when the relay evicts this peer (duplicate identity).
    pub async fn wait_evicted(&self) -> String {
        let mut rx = self.inner.evicted_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "bridge dropped".to_string();
            }
        }
    }

    /// Leave the channel and close the relay link. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = inner
            .link
            .send(BridgeEnvelope::BridgeDisconnect {
                tab_id: inner.tab_id.clone(),
                channel: inner.channel.clone(),
            })
            .await;
        inner.link.off(inner.dispatcher.load(Ordering::SeqCst));
        inner.link.close();
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("tab_id", &self.inner.tab_id)
            .field("channel", &self.inner.channel)
            .finish()
    }
}

/// Peer-targeted proxy returned by [`Bridge::to_tab`]: invocations run
/// locally and go to exactly one peer as a direct message.
pub struct TabProxy {
    inner: Arc<BridgeInner>,
    target: TabId,
}

impl TabProxy {
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(CallError::new("RpcError", "bridge is closed"));
        }
        let body = inner
            .directory
            .get(method)
            .ok_or_else(|| CallError::new("ReferenceError", format!("no such method: {method}")))?
            .clone();

        let outcome = body(args.clone(), Peer::detached()).await;

        let envelope = BridgeEnvelope::BridgeDirectMessage {
            sender_tab_id: inner.tab_id.clone(),
            target_tab_id: self.target.clone(),
            channel: inner.channel.clone(),
            method_name: method.to_string(),
            args,
            result: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().cloned(),
        };
        if let Err(e) = inner.link.send(envelope).await {
            tracing::warn!(error = %e, "failed to send direct message");
        }

        outcome
    }
}
