//! Bridge scenarios: broadcast fan-out, duplicate-identity eviction, direct
//! messages, tab listing, shared state, and the WebSocket relay face.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout};
use weft_bridge::{connect_bridge, BridgeError, BridgeOptions, RelayTarget};
use weft_core::{CallError, Schema, TabId, Value};
use weft_relay::Relay;

type Counter = Arc<Mutex<i64>>;

fn counter_schema(state: Counter) -> Schema {
    Schema::map([(
        "inc",
        Schema::method(move |args: Vec<Value>, _peer| {
            let state = state.clone();
            async move {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                let mut state = state.lock().unwrap();
                *state += n;
                Ok(Value::from(*state))
            }
        }),
    )])
}

fn local(relay: &Relay) -> RelayTarget {
    RelayTarget::Local(relay.attach())
}

#[tokio::test]
async fn broadcast_fans_out_to_everyone_but_the_sender() {
    let relay = Relay::new();
    let (sa, sb, sc): (Counter, Counter, Counter) = Default::default();

    let a = connect_bridge(
        counter_schema(sa.clone()),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("x")
            .tab_id("A"),
    )
    .await
    .unwrap();
    let _b = connect_bridge(
        counter_schema(sb.clone()),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("x")
            .tab_id("B"),
    )
    .await
    .unwrap();
    let _c = connect_bridge(
        counter_schema(sc.clone()),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("x")
            .tab_id("C"),
    )
    .await
    .unwrap();

    let out = a.call("inc", vec![Value::from(5i64)]).await.unwrap();
    assert_eq!(out.as_i64(), Some(5));

    sleep(Duration::from_millis(50)).await;

    // Everyone re-executed once; A only ran its local invocation. A relay
    // echo would have doubled it.
    assert_eq!(*sa.lock().unwrap(), 5);
    assert_eq!(*sb.lock().unwrap(), 5);
    assert_eq!(*sc.lock().unwrap(), 5);
}

#[tokio::test]
async fn duplicate_tab_id_evicts_the_prior_holder() {
    let relay = Relay::new();
    let s1: Counter = Default::default();
    let s2: Counter = Default::default();

    let p1 = connect_bridge(
        counter_schema(s1),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("y")
            .tab_id("t"),
    )
    .await
    .unwrap();

    let p2 = connect_bridge(
        counter_schema(s2),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("y")
            .tab_id("t"),
    )
    .await
    .unwrap();

    let reason = timeout(Duration::from_secs(1), p1.wait_evicted())
        .await
        .expect("p1 should be evicted");
    assert!(reason.contains("t"));

    // The evicted side is unusable; the new holder owns the identity.
    assert!(p1.call("inc", vec![Value::from(1i64)]).await.is_err());
    let tabs = p2.connected_tabs().await.unwrap();
    assert_eq!(tabs, vec![TabId::from("t")]);
}

#[tokio::test]
async fn invalid_handshake_is_a_fatal_connect_failure() {
    // A fresh handshake never fails on duplicates (the prior holder is
    // evicted instead), so exercise the client-side error path directly
    // through an invalid handshake.
    let relay = Relay::new();
    let err = connect_bridge(
        Schema::empty(),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("")
            .tab_id("t"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BridgeError::Rejected(_)));
}

#[tokio::test]
async fn direct_message_reaches_one_peer_only() {
    let relay = Relay::new();
    let (sa, sb, sc): (Counter, Counter, Counter) = Default::default();

    let a = connect_bridge(
        counter_schema(sa.clone()),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("d")
            .tab_id("A"),
    )
    .await
    .unwrap();
    let _b = connect_bridge(
        counter_schema(sb.clone()),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("d")
            .tab_id("B"),
    )
    .await
    .unwrap();
    let _c = connect_bridge(
        counter_schema(sc.clone()),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("d")
            .tab_id("C"),
    )
    .await
    .unwrap();

    a.to_tab("B").call("inc", vec![Value::from(7i64)]).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(*sa.lock().unwrap(), 7);
    assert_eq!(*sb.lock().unwrap(), 7);
    assert_eq!(*sc.lock().unwrap(), 0);

    // Direct message to nobody: dropped by the relay, no error surfaced.
    a.to_tab("Z").call("inc", vec![Value::from(1i64)]).await.unwrap();
}

#[tokio::test]
async fn connected_tabs_lists_the_channel() {
    let relay = Relay::new();
    let mut peers = Vec::new();
    for name in ["A", "B", "C"] {
        let state: Counter = Default::default();
        peers.push(
            connect_bridge(
                counter_schema(state),
                BridgeOptions::default()
                    .relay(local(&relay))
                    .channel("t")
                    .tab_id(name),
            )
            .await
            .unwrap(),
        );
    }

    let tabs = peers[0].connected_tabs().await.unwrap();
    assert_eq!(
        tabs,
        vec![TabId::from("A"), TabId::from("B"), TabId::from("C")]
    );
}

#[tokio::test]
async fn first_peer_seeds_shared_state_and_updates_fan_out() {
    let relay = Relay::new();
    let s1: Counter = Default::default();

    let seeded = Schema::map([
        (
            "inc",
            Schema::method(move |args: Vec<Value>, _peer| {
                let state = s1.clone();
                async move {
                    let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                    let mut state = state.lock().unwrap();
                    *state += n;
                    Ok(Value::from(*state))
                }
            }),
        ),
        ("theme", Schema::data("dark")),
    ]);

    let p1 = connect_bridge(
        seeded,
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("s")
            .tab_id("one"),
    )
    .await
    .unwrap();

    let s2: Counter = Default::default();
    let p2 = connect_bridge(
        counter_schema(s2),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("s")
            .tab_id("two"),
    )
    .await
    .unwrap();

    // The ack snapshot carried the seed to the second peer.
    assert_eq!(p2.cached_shared().get("theme"), Some(&Value::from("dark")));
    let state = p2.shared_state().await.unwrap();
    assert_eq!(state.get("theme"), Some(&Value::from("dark")));

    let mut updates = p1.state_updates();
    p2.set_shared("theme", Value::from("light")).await.unwrap();

    let (key, value) = timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((key.as_str(), value), ("theme", Value::from("light")));
    assert_eq!(p1.cached_shared().get("theme"), Some(&Value::from("light")));
}

#[tokio::test]
async fn channels_are_deleted_when_the_last_peer_leaves() {
    let relay = Relay::new();
    let (sa, sb): (Counter, Counter) = Default::default();

    let a = connect_bridge(
        counter_schema(sa),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("gone")
            .tab_id("A"),
    )
    .await
    .unwrap();
    let b = connect_bridge(
        counter_schema(sb),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("gone")
            .tab_id("B"),
    )
    .await
    .unwrap();
    assert_eq!(relay.channel_count(), 1);

    a.close().await;
    a.close().await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(relay.channel_count(), 1);

    b.close().await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(relay.channel_count(), 0);
}

#[tokio::test]
async fn failed_local_invocation_still_broadcasts_and_is_swallowed_by_peers() {
    let relay = Relay::new();
    let sb: Counter = Default::default();

    let failing = Schema::map([
        (
            "fail",
            Schema::method(|_args: Vec<Value>, _peer| async move {
                Err::<Value, CallError>(CallError::new("RangeError", "nope"))
            }),
        ),
        (
            "inc",
            Schema::method(|_args: Vec<Value>, _peer| async move { Ok(Value::from(0i64)) }),
        ),
    ]);
    let peer_schema = Schema::map([
        (
            "fail",
            Schema::method(|_args: Vec<Value>, _peer| async move {
                Err::<Value, CallError>(CallError::new("RangeError", "nope"))
            }),
        ),
        (
            "inc",
            Schema::method(move |args: Vec<Value>, _peer| {
                let state = sb.clone();
                async move {
                    *state.lock().unwrap() += args.first().and_then(Value::as_i64).unwrap_or(0);
                    Ok(Value::Null)
                }
            }),
        ),
    ]);

    let a = connect_bridge(
        failing,
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("e")
            .tab_id("A"),
    )
    .await
    .unwrap();
    let b = connect_bridge(
        peer_schema,
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("e")
            .tab_id("B"),
    )
    .await
    .unwrap();

    let err = a.call("fail", vec![]).await.unwrap_err();
    assert_eq!(err.name, "RangeError");
    sleep(Duration::from_millis(50)).await;

    // B swallowed the relayed failure and keeps working.
    let tabs = b.connected_tabs().await.unwrap();
    assert_eq!(tabs.len(), 2);
}

#[tokio::test]
async fn websocket_peers_mix_with_local_peers() {
    let relay = Relay::new();
    let addr = relay.bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}");

    let (sa, sb): (Counter, Counter) = Default::default();

    let a = connect_bridge(
        counter_schema(sa.clone()),
        BridgeOptions::default()
            .relay(RelayTarget::Url(url))
            .channel("w")
            .tab_id("A"),
    )
    .await
    .unwrap();
    let b = connect_bridge(
        counter_schema(sb.clone()),
        BridgeOptions::default()
            .relay(local(&relay))
            .channel("w")
            .tab_id("B"),
    )
    .await
    .unwrap();

    a.call("inc", vec![Value::from(3i64)]).await.unwrap();
    b.call("inc", vec![Value::from(4i64)]).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(*sa.lock().unwrap(), 7);
    assert_eq!(*sb.lock().unwrap(), 7);

    let tabs = a.connected_tabs().await.unwrap();
    assert_eq!(tabs, vec![TabId::from("A"), TabId::from("B")]);

    a.close().await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.tabs_in("w"), vec![TabId::from("B")]);
}

#[tokio::test]
async fn default_options_spawn_a_private_relay() {
    let state: Counter = Default::default();
    let solo = connect_bridge(counter_schema(state.clone()), BridgeOptions::default())
        .await
        .unwrap();
    assert_eq!(solo.channel(), "default");

    let out = solo.call("inc", vec![Value::from(2i64)]).await.unwrap();
    assert_eq!(out.as_i64(), Some(2));
    assert_eq!(*state.lock().unwrap(), 2);
}
