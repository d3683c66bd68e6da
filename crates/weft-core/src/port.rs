//! The port transport.
//!
//! A `Port` is one end of a duplex message channel between two contexts.
//! Three families cover the underlying channel kinds:
//!
//! - **Window**: deliveries carry the sender's origin and endpoint
//!   identity, and every send must name a target origin; mismatching
//!   deliveries are dropped at the receiving end.
//! - **Port**: bare worker-style endpoints; transfer lists ride beside
//!   the body.
//! - **Emitter**: event-emitter style endpoints; handlers still receive a
//!   normalised [`Delivery`], and the transfer list is accepted as a send
//!   option.
//!
//! Listeners are registered with [`Port::on`] and removed with
//! [`Port::off`]; deliveries arriving before the first listener are
//! buffered and flushed on registration, so a guest may speak before its
//! host has finished wiring up.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::envelope::Body;
use crate::origin::origin_matches;
use crate::value::Buffer;

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// Identity of one endpoint, used for window source validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

impl EndpointId {
    fn fresh() -> Self {
        Self(NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Which channel family an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Window,
    Port,
    Emitter,
}

/// Options for a single send.
#[derive(Default)]
pub struct SendOptions {
    /// Required for window-family sends; `"*"` delivers to any origin.
    pub target_origin: Option<String>,
    /// Buffers already moved out of the payload by the transfer pass.
    pub transfer: Vec<Buffer>,
}

impl SendOptions {
    pub fn to_origin(origin: impl Into<String>) -> Self {
        Self {
            target_origin: Some(origin.into()),
            transfer: Vec::new(),
        }
    }
}

/// One inbound message event.
#[derive(Clone)]
pub struct Delivery {
    body: Body,
    origin: Option<String>,
    source: Option<EndpointId>,
    transfer: Vec<Buffer>,
    target_origin: Option<String>,
}

impl Delivery {
    /// The message body: the event's data, whatever the family.
    pub fn data(&self) -> &Body {
        &self.body
    }

    /// Sender origin; present on window-family deliveries.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Sender endpoint identity; present on window-family deliveries.
    pub fn source(&self) -> Option<EndpointId> {
        self.source
    }

    pub fn transfer(&self) -> &[Buffer] {
        &self.transfer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("endpoint is closed")]
    Closed,
    #[error("window sends require a target origin")]
    MissingTargetOrigin,
}

type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

#[derive(Default)]
struct Registry {
    handlers: BTreeMap<u64, Handler>,
    backlog: VecDeque<Delivery>,
}

struct PortInner {
    id: EndpointId,
    family: Family,
    origin: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
    registry: Mutex<Registry>,
    next_listener: AtomicU64,
    /// Shared with the peer as its `peer_closed`, so a close is observed
    /// by the other end's very next send.
    closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// One end of a duplex channel. Cheap to clone; all clones share the
/// endpoint.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    /// A worker-style pair of connected endpoints.
    pub fn pair() -> (Port, Port) {
        Self::connected(Family::Port, None, None)
    }

    /// A window-style pair with fixed origins.
    pub fn window_pair(origin_a: impl Into<String>, origin_b: impl Into<String>) -> (Port, Port) {
        Self::connected(Family::Window, Some(origin_a.into()), Some(origin_b.into()))
    }

    /// An emitter-style pair of connected endpoints.
    pub fn emitter_pair() -> (Port, Port) {
        Self::connected(Family::Emitter, None, None)
    }

    fn connected(family: Family, origin_a: Option<String>, origin_b: Option<String>) -> (Port, Port) {
        let (tx_to_a, rx_a) = mpsc::unbounded_channel();
        let (tx_to_b, rx_b) = mpsc::unbounded_channel();
        let flag_a = Arc::new(AtomicBool::new(false));
        let flag_b = Arc::new(AtomicBool::new(false));
        let a = Self::build(family, origin_a, tx_to_b, rx_a, flag_a.clone(), flag_b.clone());
        let b = Self::build(family, origin_b, tx_to_a, rx_b, flag_b, flag_a);
        (a, b)
    }

    fn build(
        family: Family,
        origin: Option<String>,
        tx: mpsc::UnboundedSender<Delivery>,
        rx: mpsc::UnboundedReceiver<Delivery>,
        closed: Arc<AtomicBool>,
        peer_closed: Arc<AtomicBool>,
    ) -> Port {
        let inner = Arc::new(PortInner {
            id: EndpointId::fresh(),
            family,
            origin,
            tx,
            registry: Mutex::new(Registry::default()),
            next_listener: AtomicU64::new(1),
            closed,
            peer_closed,
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(Self::pump(Arc::downgrade(&inner), rx));
        *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
        Port { inner }
    }

    async fn pump(inner: Weak<PortInner>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            if let (Some(own), Some(target)) = (&inner.origin, &delivery.target_origin) {
                if target != "*" && !origin_matches(target, own) {
                    tracing::debug!(target_origin = %target, "dropping delivery for another origin");
                    continue;
                }
            }
            let (batch, handlers) = {
                let mut registry = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
                if registry.handlers.is_empty() {
                    registry.backlog.push_back(delivery);
                    continue;
                }
                let mut batch: Vec<Delivery> = registry.backlog.drain(..).collect();
                batch.push(delivery);
                let handlers: Vec<Handler> = registry.handlers.values().cloned().collect();
                (batch, handlers)
            };
            for delivery in &batch {
                for handler in &handlers {
                    handler(delivery);
                }
            }
        }
    }

    /// Send a body to the peer endpoint.
    pub fn send(&self, body: impl Into<Body>, options: SendOptions) -> Result<(), PortError> {
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.peer_closed.load(Ordering::SeqCst)
        {
            return Err(PortError::Closed);
        }
        if self.inner.family == Family::Window && options.target_origin.is_none() {
            return Err(PortError::MissingTargetOrigin);
        }
        let windowed = self.inner.family == Family::Window;
        let delivery = Delivery {
            body: body.into(),
            origin: if windowed { self.inner.origin.clone() } else { None },
            source: windowed.then_some(self.inner.id),
            transfer: options.transfer,
            target_origin: options.target_origin,
        };
        self.inner.tx.send(delivery).map_err(|_| PortError::Closed)
    }

    /// Register a listener; buffered deliveries are flushed to it.
    pub fn on(&self, handler: impl Fn(&Delivery) + Send + Sync + 'static) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (batch, handlers) = {
            let mut registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.handlers.insert(id, Arc::new(handler));
            let batch: Vec<Delivery> = registry.backlog.drain(..).collect();
            let handlers: Vec<Handler> = registry.handlers.values().cloned().collect();
            (batch, handlers)
        };
        for delivery in &batch {
            for handler in &handlers {
                handler(delivery);
            }
        }
        ListenerId(id)
    }

    /// Remove a listener registered with [`Port::on`].
    pub fn off(&self, listener: ListenerId) {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handlers
            .remove(&listener.0);
    }

    /// Number of listeners currently attached. Test support.
    pub fn listener_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handlers
            .len()
    }

    /// Close this end. The peer's sends fail afterwards. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            pump.abort();
        }
        let mut registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.handlers.clear();
        registry.backlog.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    pub fn family(&self) -> Family {
        self.inner.family
    }

    /// This endpoint's own origin (window family).
    pub fn origin(&self) -> Option<&str> {
        self.inner.origin.as_deref()
    }

    /// A sender a *foreign* window can use to post into this endpoint,
    /// stamped with the foreign window's origin and a fresh identity. This
    /// is how any window reference can be posted to; receivers validate
    /// origin and source themselves.
    pub fn entry_from(&self, origin: impl Into<String>) -> PortSender {
        PortSender {
            tx: self.inner.tx.clone(),
            origin: origin.into(),
            source: EndpointId::fresh(),
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.inner.id)
            .field("family", &self.inner.family)
            .field("origin", &self.inner.origin)
            .finish()
    }
}

/// Posting handle held by a foreign window; see [`Port::entry_from`].
pub struct PortSender {
    tx: mpsc::UnboundedSender<Delivery>,
    origin: String,
    source: EndpointId,
}

impl PortSender {
    pub fn post(&self, body: impl Into<Body>, target_origin: impl Into<String>) -> Result<(), PortError> {
        let delivery = Delivery {
            body: body.into(),
            origin: Some(self.origin.clone()),
            source: Some(self.source),
            transfer: Vec::new(),
            target_origin: Some(target_origin.into()),
        };
        self.tx.send(delivery).map_err(|_| PortError::Closed)
    }

    pub fn source(&self) -> EndpointId {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{BridgeEnvelope, RpcEnvelope};
    use crate::identity::Cid;
    use crate::value::Value;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    fn ping() -> Body {
        Body::Rpc(RpcEnvelope::HandshakeRequest {
            cid: Cid::from("ping"),
            method_names: vec![],
            schema: Value::Null,
        })
    }

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (a, b) = Port::pair();
        let got_a = Arc::new(AtomicUsize::new(0));
        let got_b = Arc::new(AtomicUsize::new(0));

        {
            let got = got_a.clone();
            a.on(move |_| {
                got.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let got = got_b.clone();
            b.on(move |_| {
                got.fetch_add(1, Ordering::SeqCst);
            });
        }

        a.send(ping(), SendOptions::default()).unwrap();
        b.send(ping(), SendOptions::default()).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(got_a.load(Ordering::SeqCst), 1);
        assert_eq!(got_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deliveries_before_first_listener_are_buffered() {
        let (a, b) = Port::pair();
        a.send(ping(), SendOptions::default()).unwrap();
        sleep(Duration::from_millis(10)).await;

        let got = Arc::new(AtomicUsize::new(0));
        {
            let got = got.clone();
            b.on(move |_| {
                got.fetch_add(1, Ordering::SeqCst);
            });
        }
        sleep(Duration::from_millis(10)).await;
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn window_deliveries_carry_origin_and_source() {
        let (a, b) = Port::window_pair("https://a.example", "https://b.example");
        let seen: Arc<Mutex<Option<(Option<String>, Option<EndpointId>)>>> =
            Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            b.on(move |d| {
                *seen.lock().unwrap() = Some((d.origin().map(String::from), d.source()));
            });
        }

        a.send(ping(), SendOptions::to_origin("https://b.example"))
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        let got = seen.lock().unwrap().clone().unwrap();
        assert_eq!(got.0.as_deref(), Some("https://a.example"));
        assert_eq!(got.1, Some(a.id()));
    }

    #[tokio::test]
    async fn window_send_requires_target_origin() {
        let (a, _b) = Port::window_pair("https://a.example", "https://b.example");
        assert_eq!(
            a.send(ping(), SendOptions::default()),
            Err(PortError::MissingTargetOrigin)
        );
    }

    #[tokio::test]
    async fn mismatched_target_origin_is_dropped() {
        let (a, b) = Port::window_pair("https://a.example", "https://b.example");
        let got = Arc::new(AtomicUsize::new(0));
        {
            let got = got.clone();
            b.on(move |_| {
                got.fetch_add(1, Ordering::SeqCst);
            });
        }

        a.send(ping(), SendOptions::to_origin("https://elsewhere.example"))
            .unwrap();
        a.send(ping(), SendOptions::to_origin("*")).unwrap();
        a.send(ping(), SendOptions::to_origin("https://b.example:443"))
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        // The wildcard and the default-port-normalised sends arrive.
        assert_eq!(got.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn off_removes_and_close_is_idempotent() {
        let (a, b) = Port::pair();
        let got = Arc::new(AtomicUsize::new(0));
        let listener = {
            let got = got.clone();
            b.on(move |_| {
                got.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(b.listener_count(), 1);
        b.off(listener);
        assert_eq!(b.listener_count(), 0);

        a.send(ping(), SendOptions::default()).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(got.load(Ordering::SeqCst), 0);

        b.close();
        b.close();
        assert!(b.is_closed());
        assert_eq!(a.send(ping(), SendOptions::default()), Err(PortError::Closed));
    }

    #[tokio::test]
    async fn emitter_pair_accepts_transfer_option() {
        let (a, b) = Port::emitter_pair();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            b.on(move |d| {
                seen.store(d.transfer().len(), Ordering::SeqCst);
            });
        }
        a.send(
            Body::Bridge(BridgeEnvelope::BridgeGetState {
                channel: "c".into(),
            }),
            SendOptions {
                target_origin: None,
                transfer: vec![Buffer::from_vec(vec![1])],
            },
        )
        .unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
