//! Replicated chat over the bridge.
//!
//! Three "tabs" join one channel on a shared relay. Every post runs locally
//! on the sender and is re-executed by every other tab, so each keeps an
//! identical replica of the conversation without any of them ever reading
//! another's state.
//!
//! Run it:
//!   cargo run -p bridge-chat

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use weft_bridge::{connect_bridge, Bridge, BridgeOptions, RelayTarget};
use weft_core::{Schema, Value};
use weft_relay::Relay;

type Log = Arc<Mutex<Vec<String>>>;

fn chat_schema(log: Log) -> Schema {
    Schema::map([
        (
            "post",
            Schema::method(move |args: Vec<Value>, _peer| {
                let log = log.clone();
                async move {
                    let from = args.first().and_then(Value::as_str).unwrap_or("?");
                    let text = args.get(1).and_then(Value::as_str).unwrap_or("");
                    log.lock().unwrap().push(format!("{from}: {text}"));
                    Ok(Value::Null)
                }
            }),
        ),
        ("topic", Schema::data("weft")),
    ])
}

async fn join(relay: &Relay, name: &str, log: Log) -> anyhow::Result<Bridge> {
    let bridge = connect_bridge(
        chat_schema(log),
        BridgeOptions::default()
            .relay(RelayTarget::Local(relay.attach()))
            .channel("lobby")
            .tab_id(name),
    )
    .await?;
    tracing::info!("{} joined #{}", name, bridge.channel());
    Ok(bridge)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bridge_chat=info".parse()?))
        .init();

    let relay = Relay::new();

    let logs: Vec<Log> = (0..3).map(|_| Log::default()).collect();
    let alice = join(&relay, "alice", logs[0].clone()).await?;
    let bob = join(&relay, "bob", logs[1].clone()).await?;
    let carol = join(&relay, "carol", logs[2].clone()).await?;

    let tabs = alice.connected_tabs().await?;
    tracing::info!("connected tabs: {:?}", tabs);

    alice
        .call("post", vec![Value::from("alice"), Value::from("hello, everyone")])
        .await
        .ok();
    bob.call("post", vec![Value::from("bob"), Value::from("hi alice")])
        .await
        .ok();
    // A whisper: runs on carol only (and on bob locally).
    bob.to_tab("carol")
        .call("post", vec![Value::from("bob"), Value::from("psst, carol")])
        .await
        .ok();

    // Let the relays flush.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (name, log) in ["alice", "bob", "carol"].iter().zip(&logs) {
        let log = log.lock().unwrap();
        tracing::info!("{}'s replica ({} lines):", name, log.len());
        for line in log.iter() {
            tracing::info!("  {line}");
        }
    }

    alice.close().await;
    bob.close().await;
    carol.close().await;
    Ok(())
}
