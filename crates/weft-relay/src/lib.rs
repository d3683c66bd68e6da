//! The bridge relay daemon.
//!
//! One long-lived process shared by every peer of every channel. The relay
//! owns the per-channel peer directories and shared-state maps, routes
//! broadcasts and direct messages, evicts duplicate identities, and deletes
//! channels the moment their last peer leaves. It never interprets method
//! arguments, results, errors, or state values: routing and key/value
//! storage only.
//!
//! Peers attach two ways: in-process over a port ([`Relay::attach`]), or
//! across processes over a WebSocket ([`Relay::serve`]), one dispatcher per
//! connection either way.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use weft_core::{Body, BridgeEnvelope, BridgeErrorCode, Port, SendOptions, TabId, Value};

#[derive(Default)]
struct ChannelState {
    peers: BTreeMap<TabId, PeerRecord>,
    shared_state: BTreeMap<String, Value>,
}

struct PeerRecord {
    endpoint: PeerEndpoint,
    #[allow(dead_code)]
    method_names: Vec<String>,
}

/// Where a peer's envelopes go: an in-process port or a socket writer.
#[derive(Clone)]
enum PeerEndpoint {
    Local(Port),
    Socket(mpsc::UnboundedSender<SocketCommand>),
}

enum SocketCommand {
    Deliver(BridgeEnvelope),
    Close,
}

impl PeerEndpoint {
    fn deliver(&self, envelope: BridgeEnvelope) -> Result<(), String> {
        match self {
            PeerEndpoint::Local(port) => port
                .send(Body::Bridge(envelope), SendOptions::default())
                .map_err(|e| e.to_string()),
            PeerEndpoint::Socket(tx) => tx
                .send(SocketCommand::Deliver(envelope))
                .map_err(|_| "socket writer gone".to_string()),
        }
    }

    fn close(&self) {
        match self {
            PeerEndpoint::Local(port) => port.close(),
            PeerEndpoint::Socket(tx) => {
                let _ = tx.send(SocketCommand::Close);
            }
        }
    }

    fn same(&self, other: &PeerEndpoint) -> bool {
        match (self, other) {
            (PeerEndpoint::Local(a), PeerEndpoint::Local(b)) => a.id() == b.id(),
            (PeerEndpoint::Socket(a), PeerEndpoint::Socket(b)) => a.same_channel(b),
            _ => false,
        }
    }
}

#[derive(Default)]
struct RelayState {
    channels: Mutex<HashMap<String, ChannelState>>,
}

/// Handle to a relay. Cheap to clone; all clones share the directory.
#[derive(Clone, Default)]
pub struct Relay {
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an in-process peer. Returns the peer's end of the port; the
    /// relay keeps the other end and dispatches every bridge envelope
    /// arriving on it.
    pub fn attach(&self) -> Port {
        let (peer_side, relay_side) = Port::pair();
        let state = self.state.clone();
        let endpoint = PeerEndpoint::Local(relay_side.clone());
        relay_side.on(move |delivery| {
            if let Body::Bridge(envelope) = delivery.data() {
                handle_envelope(&state, &endpoint, envelope.clone());
            }
        });
        peer_side
    }

    /// Serve peers over WebSocket, one dispatcher per connection.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::debug!(%addr, "relay connection");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_socket(state, stream).await {
                    tracing::debug!(error = %e, "relay connection ended");
                }
            });
        }
    }

    /// Bind and serve in the background; returns the bound address.
    pub async fn bind(&self, addr: &str) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let relay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.serve(listener).await {
                tracing::warn!(error = %e, "relay server stopped");
            }
        });
        Ok(local)
    }

    /// Number of live channels. Channels are created lazily and deleted
    /// when their last peer leaves.
    pub fn channel_count(&self) -> usize {
        self.state
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Current tab ids of a channel, in directory order.
    pub fn tabs_in(&self, channel: &str) -> Vec<TabId> {
        self.state
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .map(|ch| ch.peers.keys().cloned().collect())
            .unwrap_or_default()
    }
}

async fn handle_socket(state: Arc<RelayState>, stream: TcpStream) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();
    let endpoint = PeerEndpoint::Socket(tx);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket error");
                        break;
                    }
                    None => break,
                };
                if let Message::Text(text) = msg {
                    match serde_json::from_str::<BridgeEnvelope>(&text) {
                        Ok(envelope) => handle_envelope(&state, &endpoint, envelope),
                        Err(e) => tracing::warn!(error = %e, "ignoring malformed envelope"),
                    }
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(SocketCommand::Deliver(envelope)) => {
                        let text = serde_json::to_string(&envelope)?;
                        sink.send(Message::Text(text)).await?;
                    }
                    Some(SocketCommand::Close) | None => break,
                }
            }
        }
    }

    // A socket going away takes its peers with it.
    cleanup_endpoint(&state, &endpoint);
    Ok(())
}

/// Remove every peer registered on a dead endpoint; delete emptied channels.
fn cleanup_endpoint(state: &Arc<RelayState>, endpoint: &PeerEndpoint) {
    let mut channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
    channels.retain(|name, ch| {
        ch.peers.retain(|tab_id, record| {
            let keep = !record.endpoint.same(endpoint);
            if !keep {
                tracing::debug!(%tab_id, channel = %name, "peer endpoint gone");
            }
            keep
        });
        !ch.peers.is_empty()
    });
}

/// The dispatcher: one envelope in, routing actions out. Runs without
/// awaiting; every outbound send is a queue push.
fn handle_envelope(state: &Arc<RelayState>, from: &PeerEndpoint, envelope: BridgeEnvelope) {
    match envelope {
        BridgeEnvelope::BridgeHandshake {
            tab_id,
            method_names,
            channel,
            schema,
        } => {
            if tab_id.as_str().is_empty() || channel.is_empty() {
                let _ = from.deliver(BridgeEnvelope::BridgeHandshakeError {
                    code: BridgeErrorCode::InvalidPayload,
                    error: "handshake requires a tab id and a channel".to_string(),
                    tab_id: Some(tab_id),
                    channel: Some(channel),
                });
                return;
            }

            let snapshot = {
                let mut channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
                let ch = channels.entry(channel.clone()).or_default();

                if let Some(prior) = ch.peers.remove(&tab_id) {
                    tracing::info!(%tab_id, %channel, "evicting duplicate tab id");
                    let _ = prior.endpoint.deliver(BridgeEnvelope::BridgeHandshakeError {
                        code: BridgeErrorCode::DuplicateTabId,
                        error: format!("tab id {tab_id} joined {channel} again"),
                        tab_id: Some(tab_id.clone()),
                        channel: Some(channel.clone()),
                    });
                    prior.endpoint.close();
                }

                if ch.peers.is_empty() && ch.shared_state.is_empty() {
                    if let Some(Value::Map(seed)) = schema {
                        ch.shared_state = seed;
                    }
                }

                ch.peers.insert(
                    tab_id.clone(),
                    PeerRecord {
                        endpoint: from.clone(),
                        method_names,
                    },
                );
                tracing::info!(%tab_id, %channel, peers = ch.peers.len(), "peer joined");
                ch.shared_state.clone()
            };

            let _ = from.deliver(BridgeEnvelope::BridgeHandshakeAck {
                tab_id,
                channel,
                shared_state: snapshot,
            });
        }

        BridgeEnvelope::BridgeBroadcast {
            sender_tab_id,
            channel,
            method_name,
            args,
            result,
            error,
        } => {
            let targets = {
                let channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
                let Some(ch) = channels.get(&channel) else {
                    tracing::debug!(%channel, "broadcast for unknown channel");
                    return;
                };
                ch.peers
                    .iter()
                    .filter(|(tab_id, _)| **tab_id != sender_tab_id)
                    .map(|(tab_id, record)| (tab_id.clone(), record.endpoint.clone()))
                    .collect::<Vec<_>>()
            };
            for (tab_id, peer) in targets {
                let relayed = BridgeEnvelope::BridgeRelay {
                    sender_tab_id: sender_tab_id.clone(),
                    method_name: method_name.clone(),
                    args: args.clone(),
                    sender_result: result.clone(),
                    sender_error: error.clone(),
                };
                if let Err(e) = peer.deliver(relayed) {
                    tracing::warn!(%tab_id, error = %e, "skipping unreachable peer");
                }
            }
        }

        BridgeEnvelope::BridgeDirectMessage {
            sender_tab_id,
            target_tab_id,
            channel,
            method_name,
            args,
            result,
            error,
        } => {
            let target = {
                let channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
                channels
                    .get(&channel)
                    .and_then(|ch| ch.peers.get(&target_tab_id))
                    .map(|record| record.endpoint.clone())
            };
            let Some(peer) = target else {
                tracing::warn!(%target_tab_id, %channel, "direct message for unknown destination");
                return;
            };
            let _ = peer
                .deliver(BridgeEnvelope::BridgeRelay {
                    sender_tab_id,
                    method_name,
                    args,
                    sender_result: result,
                    sender_error: error,
                })
                .map_err(|e| tracing::warn!(error = %e, "direct message delivery failed"));
        }

        BridgeEnvelope::BridgeGetTabs {
            channel,
            requesting_tab_id: _,
        } => {
            let tab_ids = {
                let channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
                channels
                    .get(&channel)
                    .map(|ch| ch.peers.keys().cloned().collect())
                    .unwrap_or_default()
            };
            let _ = from.deliver(BridgeEnvelope::BridgeTabsResponse { tab_ids, channel });
        }

        BridgeEnvelope::BridgeGetState { channel } => {
            let snapshot = {
                let channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
                channels
                    .get(&channel)
                    .map(|ch| ch.shared_state.clone())
                    .unwrap_or_default()
            };
            let _ = from.deliver(BridgeEnvelope::BridgeStateResponse { state: snapshot });
        }

        BridgeEnvelope::BridgeSetState {
            channel,
            key,
            value,
        } => {
            let targets = {
                let mut channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
                let Some(ch) = channels.get_mut(&channel) else {
                    tracing::debug!(%channel, "state write for unknown channel");
                    return;
                };
                ch.shared_state.insert(key.clone(), value.clone());
                ch.peers
                    .values()
                    .map(|record| record.endpoint.clone())
                    .collect::<Vec<_>>()
            };
            for peer in targets {
                let _ = peer.deliver(BridgeEnvelope::BridgeStateUpdate {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        BridgeEnvelope::BridgeDisconnect { tab_id, channel } => {
            let mut channels = state.channels.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ch) = channels.get_mut(&channel) {
                ch.peers.remove(&tab_id);
                tracing::info!(%tab_id, %channel, "peer left");
                if ch.peers.is_empty() {
                    channels.remove(&channel);
                    tracing::debug!(%channel, "channel deleted");
                }
            }
        }

        // Replies, relays, and unknown tags are never meaningful inbound.
        _ => {}
    }
}
