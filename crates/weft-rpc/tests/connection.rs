//! End-to-end connection tests: handshake, concurrent calls, transferables,
//! frame validation, and teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout};
use weft_core::{
    transferable, Body, Buffer, Cid, Port, RpcEnvelope, Schema, Value,
};
use weft_rpc::{connect_guest, connect_host, spawn_worker, Frame, GuestOptions, RpcError};

fn math_host_schema() -> Schema {
    Schema::map([
        (
            "double",
            Schema::method(|args: Vec<Value>, peer| async move {
                let n = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                let bias = peer.call("bias", vec![]).await?;
                Ok(Value::from(n * 2.0 + bias.as_f64().unwrap_or(0.0)))
            }),
        ),
        ("version", Schema::data("1.0")),
    ])
}

fn bias_guest_schema() -> Schema {
    Schema::map([(
        "bias",
        Schema::method(|_args: Vec<Value>, _peer| async move { Ok(Value::from(1.0)) }),
    )])
}

#[tokio::test]
async fn bidirectional_rpc_with_trailing_peer() {
    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port, math_host_schema()),
        connect_guest(guest_port, bias_guest_schema(), GuestOptions::default()),
    );
    let host = host.unwrap();
    let guest = guest.unwrap();

    assert_eq!(host.cid(), guest.cid());

    let out = guest
        .remote()
        .call("double", vec![Value::from(5.0)])
        .await
        .unwrap();
    assert_eq!(out.as_f64(), Some(11.0));

    // The host's non-method data survives on the proxy.
    assert_eq!(guest.remote().data("version"), Some(&Value::from("1.0")));
}

#[tokio::test]
async fn concurrent_calls_resolve_by_call_id() {
    let slow = Schema::map([(
        "slow",
        Schema::method(|args: Vec<Value>, _peer| async move {
            let ms = args.first().and_then(Value::as_i64).unwrap_or(0);
            sleep(Duration::from_millis(ms as u64)).await;
            Ok(Value::from(ms))
        }),
    )]);

    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port, slow),
        connect_guest(guest_port, Schema::empty(), GuestOptions::default()),
    );
    let _host = host.unwrap();
    let guest = guest.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let remote = guest.remote().clone();
        let order = order.clone();
        tokio::spawn(async move {
            let v = remote.call("slow", vec![Value::from(50i64)]).await.unwrap();
            order.lock().unwrap().push(v.as_i64().unwrap());
        })
    };
    let second = {
        let remote = guest.remote().clone();
        let order = order.clone();
        tokio::spawn(async move {
            let v = remote.call("slow", vec![Value::from(10i64)]).await.unwrap();
            order.lock().unwrap().push(v.as_i64().unwrap());
        })
    };
    first.await.unwrap();
    second.await.unwrap();

    // Each call resolved to its own input, shorter one first.
    assert_eq!(*order.lock().unwrap(), vec![10, 50]);
}

#[tokio::test]
async fn transferred_buffer_detaches_the_source() {
    let take = Schema::map([(
        "take",
        Schema::method(|args: Vec<Value>, _peer| async move {
            let len = args
                .first()
                .and_then(Value::as_buffer)
                .map_or(0, |b| b.byte_len());
            Ok(Value::from(len as i64))
        }),
    )]);

    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port, Schema::empty()),
        connect_guest(guest_port, take, GuestOptions::default()),
    );
    let host = host.unwrap();
    let _guest = guest.unwrap();

    let buf = Buffer::from_vec(vec![0; 1024]);
    let out = host
        .remote()
        .call("take", vec![transferable(buf.clone())])
        .await
        .unwrap();

    assert_eq!(out.as_i64(), Some(1024));
    assert!(buf.is_detached());
    assert_eq!(buf.byte_len(), 0);
}

#[tokio::test]
async fn frame_host_ignores_wrong_origin() {
    let (frame, _guest_port) = Frame::open("https://host.example", "https://a.example");
    let evil = frame.host_port().entry_from("https://evil.example");

    let connect = connect_host(frame, Schema::empty());
    tokio::pin!(connect);

    evil.post(
        Body::Rpc(RpcEnvelope::HandshakeRequest {
            cid: Cid::fresh(),
            method_names: vec![],
            schema: Value::empty_map(),
        }),
        "https://host.example",
    )
    .unwrap();

    // No completion and no error: the message is dropped silently.
    assert!(timeout(Duration::from_millis(100), &mut connect).await.is_err());
}

#[tokio::test]
async fn frame_handshake_succeeds_with_matching_origin() {
    let (frame, guest_port) = Frame::open("https://host.example", "https://a.example");
    // Default port, suppressed under normalisation.
    let frame = frame.expect_origin("https://a.example:443");

    let guest_options = GuestOptions::default().target_origin("https://host.example");
    let (host, guest) = tokio::join!(
        connect_host(frame, math_host_schema()),
        connect_guest(guest_port, bias_guest_schema(), guest_options),
    );
    let _host = host.unwrap();
    let guest = guest.unwrap();

    let out = guest
        .remote()
        .call("double", vec![Value::from(2.0)])
        .await
        .unwrap();
    assert_eq!(out.as_f64(), Some(5.0));
}

#[tokio::test]
async fn worker_guest_round_trip_and_termination() {
    let worker = spawn_worker(|port| async move {
        let conn = connect_guest(
            port,
            Schema::map([(
                "hello",
                Schema::method(|_args: Vec<Value>, _peer| async move {
                    Ok(Value::from("from the worker"))
                }),
            )]),
            GuestOptions::default(),
        )
        .await
        .expect("worker connect");
        // Keep serving until the host tears the connection down.
        std::future::pending::<()>().await;
        drop(conn);
    });

    let host = connect_host(worker, Schema::empty()).await.unwrap();
    let out = host.remote().call("hello", vec![]).await.unwrap();
    assert_eq!(out.as_str(), Some("from the worker"));

    host.close();
    host.close();
}

#[tokio::test]
async fn setup_hook_runs_before_the_host_resolves() {
    let host_schema = Schema::map([(
        "greeting",
        Schema::method(|_args: Vec<Value>, _peer| async move { Ok(Value::from("hi")) }),
    )]);

    let preloaded: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let guest_options = {
        let preloaded = preloaded.clone();
        GuestOptions::default().on_connection_setup(move |remote| async move {
            let v = remote.call("greeting", vec![]).await?;
            *preloaded.lock().unwrap() = v.as_str().map(String::from);
            Ok(())
        })
    };

    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port, host_schema),
        connect_guest(guest_port, Schema::empty(), guest_options),
    );
    host.unwrap();
    guest.unwrap();

    // The host only resolves after the guest's echo, which follows the hook.
    assert_eq!(preloaded.lock().unwrap().as_deref(), Some("hi"));
}

#[tokio::test]
async fn close_restores_listener_counts_and_rejects_new_calls() {
    let (host_port, guest_port) = Port::pair();
    let host_baseline = host_port.listener_count();
    let guest_baseline = guest_port.listener_count();

    let (host, guest) = tokio::join!(
        connect_host(host_port.clone(), math_host_schema()),
        connect_guest(guest_port.clone(), bias_guest_schema(), GuestOptions::default()),
    );
    let host = host.unwrap();
    let guest = guest.unwrap();

    assert!(host_port.listener_count() > host_baseline);
    assert!(guest_port.listener_count() > guest_baseline);

    guest.close();
    guest.close();
    host.close();

    assert_eq!(host_port.listener_count(), host_baseline);
    assert_eq!(guest_port.listener_count(), guest_baseline);

    match guest.remote().call("double", vec![Value::from(1.0)]).await {
        Err(RpcError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
}

#[tokio::test]
async fn close_leaves_in_flight_calls_pending() {
    let slow = Schema::map([(
        "slow",
        Schema::method(|_args: Vec<Value>, _peer| async move {
            sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }),
    )]);

    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port, slow),
        connect_guest(guest_port, Schema::empty(), GuestOptions::default()),
    );
    let _host = host.unwrap();
    let guest = guest.unwrap();

    let remote = guest.remote().clone();
    let call = tokio::spawn(async move { remote.call("slow", vec![]).await });
    sleep(Duration::from_millis(20)).await;

    guest.close();

    // The outstanding promise is neither resolved nor rejected.
    let mut call = call;
    assert!(timeout(Duration::from_millis(100), &mut call).await.is_err());
    call.abort();
}

#[tokio::test]
async fn stray_and_unknown_envelopes_are_ignored() {
    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port.clone(), math_host_schema()),
        connect_guest(guest_port.clone(), bias_guest_schema(), GuestOptions::default()),
    );
    let _host = host.unwrap();
    let guest = guest.unwrap();

    // A response nobody asked for, and an unknown tag.
    guest_port
        .send(
            Body::Rpc(RpcEnvelope::RpcResolve {
                cid: guest.cid().clone(),
                call_id: "nobody".into(),
                call_name: "double".into(),
                result: Value::Null,
            }),
            Default::default(),
        )
        .unwrap();
    guest_port
        .send(Body::Rpc(RpcEnvelope::Unknown), Default::default())
        .unwrap();

    let out = guest
        .remote()
        .call("double", vec![Value::from(3.0)])
        .await
        .unwrap();
    assert_eq!(out.as_f64(), Some(7.0));
}

#[tokio::test]
async fn remote_exceptions_come_back_as_their_own_property_snapshot() {
    let schema = Schema::map([(
        "explode",
        Schema::method(|_args: Vec<Value>, _peer| async move {
            Err::<Value, _>(
                weft_core::CallError::new("RangeError", "out of range")
                    .with_stack("explode@remote:1")
                    .with_field("status", Value::from(416i64)),
            )
        }),
    )]);

    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port, schema),
        connect_guest(guest_port, Schema::empty(), GuestOptions::default()),
    );
    let _host = host.unwrap();
    let guest = guest.unwrap();

    match guest.remote().call("explode", vec![]).await {
        Err(RpcError::Remote(error)) => {
            assert_eq!(error.name, "RangeError");
            assert_eq!(error.message, "out of range");
            assert_eq!(error.stack.as_deref(), Some("explode@remote:1"));
            assert_eq!(error.fields.get("status"), Some(&Value::from(416i64)));
        }
        other => panic!("expected a remote rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn snapshot_materialises_method_markers_over_residual_data() {
    let (host_port, guest_port) = Port::pair();
    let (host, guest) = tokio::join!(
        connect_host(host_port, math_host_schema()),
        connect_guest(guest_port, Schema::empty(), GuestOptions::default()),
    );
    let _host = host.unwrap();
    let guest = guest.unwrap();

    let tree = guest.remote().snapshot();
    assert_eq!(
        weft_core::path_get(&tree, "double").and_then(Value::as_str),
        Some("[remote method]")
    );
    assert_eq!(tree.get("version"), Some(&Value::from("1.0")));
    assert_eq!(guest.remote().methods(), &["double".to_string()]);
}
