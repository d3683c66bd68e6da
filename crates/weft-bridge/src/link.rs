//! The link between a bridge client and its relay.
//!
//! Two concrete links behind one object-safe trait: an in-process port
//! (shared-worker style) and a WebSocket to a standalone relay daemon.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use weft_core::{Body, BridgeEnvelope, ListenerId, Port, SendOptions};

use crate::error::BridgeError;

pub(crate) type LinkHandler = Arc<dyn Fn(&BridgeEnvelope) + Send + Sync>;

#[async_trait]
pub(crate) trait RelayLink: Send + Sync {
    async fn send(&self, envelope: BridgeEnvelope) -> Result<(), BridgeError>;
    fn on(&self, handler: LinkHandler) -> u64;
    fn off(&self, id: u64);
    fn close(&self);
}

/// In-process link over a port obtained from `Relay::attach`.
pub(crate) struct PortLink {
    port: Port,
    listeners: Mutex<BTreeMap<u64, ListenerId>>,
    next: AtomicU64,
}

impl PortLink {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            listeners: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RelayLink for PortLink {
    async fn send(&self, envelope: BridgeEnvelope) -> Result<(), BridgeError> {
        self.port.send(Body::Bridge(envelope), SendOptions::default())?;
        Ok(())
    }

    fn on(&self, handler: LinkHandler) -> u64 {
        let listener = self.port.on(move |delivery| {
            if let Body::Bridge(envelope) = delivery.data() {
                handler(envelope);
            }
        });
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        id
    }

    fn off(&self, id: u64) {
        if let Some(listener) = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
        {
            self.port.off(listener);
        }
    }

    fn close(&self) {
        self.port.close();
    }
}

/// WebSocket link to a standalone relay daemon; JSON text frames.
pub(crate) struct WsLink {
    tx: mpsc::UnboundedSender<BridgeEnvelope>,
    listeners: Arc<Mutex<BTreeMap<u64, LinkHandler>>>,
    next: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsLink {
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Relay(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<BridgeEnvelope>();
        let listeners: Arc<Mutex<BTreeMap<u64, LinkHandler>>> = Arc::default();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unserializable envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader = {
            let listeners = listeners.clone();
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::debug!(error = %e, "relay socket error");
                            break;
                        }
                    };
                    let Message::Text(text) = msg else { continue };
                    let envelope = match serde_json::from_str::<BridgeEnvelope>(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring malformed envelope");
                            continue;
                        }
                    };
                    let handlers: Vec<LinkHandler> = listeners
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .values()
                        .cloned()
                        .collect();
                    for handler in handlers {
                        handler(&envelope);
                    }
                }
            })
        };

        Ok(Self {
            tx,
            listeners,
            next: AtomicU64::new(1),
            tasks: Mutex::new(vec![writer, reader]),
        })
    }
}

#[async_trait]
impl RelayLink for WsLink {
    async fn send(&self, envelope: BridgeEnvelope) -> Result<(), BridgeError> {
        self.tx
            .send(envelope)
            .map_err(|_| BridgeError::Relay("relay socket is gone".to_string()))
    }

    fn on(&self, handler: LinkHandler) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handler);
        id
    }

    fn off(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn close(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}
