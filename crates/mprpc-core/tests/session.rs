use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mprpc_core::{
    encode_message, ClientInfo, ConnectionState, ErrorCode, HandlerOutcome, RpcError, RpcMessage,
    RpcSession, SessionConfig, Transport, Value,
};
use mprpc_testkit::{init_tracing, session_with_peer, MemTransportFactory, MockPeer};
use serde::Deserialize;

async fn mem_session(config: SessionConfig) -> (Arc<RpcSession>, MockPeer) {
    session_with_peer::<MemTransportFactory>(config)
        .await
        .expect("session setup failed")
}

fn unstarted() -> (Arc<RpcSession>, MockPeer) {
    init_tracing();
    let (a, b) = Transport::mem_pair();
    (
        Arc::new(RpcSession::with_config(a, SessionConfig::default())),
        MockPeer::new(b),
    )
}

#[tokio::test]
async fn calls_before_start_are_refused() {
    let (session, _peer) = unstarted();
    assert_eq!(session.state(), ConnectionState::Connecting);

    let err = session.call("early", vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FailedPrecondition));

    assert!(session.start().is_some());
    assert!(session.start().is_none(), "second start must be a no-op");
    assert_eq!(session.state(), ConnectionState::Open);
    session.detach().await;
}

#[tokio::test]
async fn empty_method_name_is_rejected() {
    let (session, _peer) = mem_session(SessionConfig::default()).await;
    let err = session.call("", vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
    let err = session.notify("", vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
}

#[tokio::test]
async fn state_moves_forward_to_detached() {
    let (session, _peer) = unstarted();
    let mut states = session.subscribe_state();

    session.start();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Open);

    session.detach().await;
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Detached);
    assert_eq!(session.close_reason().as_deref(), Some("session detached"));

    // Detaching an unstarted session works too, and it can never start.
    let (other, _peer) = unstarted();
    other.detach().await;
    assert!(other.start().is_none());
    assert_eq!(other.state(), ConnectionState::Detached);
}

#[tokio::test]
async fn notify_reaches_the_peer() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    session
        .notify("nvim_command", vec![Value::from("echo 'hi'")])
        .await
        .unwrap();
    let args = peer.expect_notification("nvim_command").await.unwrap();
    assert_eq!(args, vec![Value::from("echo 'hi'")]);
}

#[tokio::test]
async fn request_ids_are_unique_and_increasing() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.call("tick", vec![]).await }
        });
        let (id, _) = peer.expect_request("tick").await.unwrap();
        peer.respond(id, Value::Nil).await.unwrap();
        call.await.unwrap().unwrap();
        seen.push(id);
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
}

#[derive(Debug, Deserialize, PartialEq)]
struct Cursor {
    row: i64,
    col: i64,
}

#[tokio::test]
async fn call_as_deserializes_the_result() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;

    let call = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .call_as::<(i64, i64)>("nvim_win_get_cursor", vec![Value::from(0)])
                .await
        }
    });
    let (id, _) = peer.expect_request("nvim_win_get_cursor").await.unwrap();
    peer.respond(id, Value::Array(vec![Value::from(3), Value::from(14)]))
        .await
        .unwrap();
    assert_eq!(call.await.unwrap().unwrap(), (3, 14));

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.call_as::<Cursor>("cursor", vec![]).await }
    });
    let (id, _) = peer.expect_request("cursor").await.unwrap();
    peer.respond(id, Value::from("not a cursor")).await.unwrap();
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Decode(_)), "{err:?}");
}

#[tokio::test]
async fn message_split_across_chunks_is_reassembled() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    session.on_request("ping", |_args| async { Ok(Value::from("pong")) });

    let bytes = encode_message(RpcMessage::Request {
        id: 11,
        method: "ping".into(),
        args: vec![Value::from("x".repeat(40))],
    })
    .unwrap();
    for byte in bytes.iter() {
        peer.send_raw(&[*byte]).await.unwrap();
    }

    let (id, error, result) = peer.expect_response().await.unwrap();
    assert_eq!((id, error, result), (11, None, Value::from("pong")));
}

#[tokio::test]
async fn several_messages_in_one_chunk_are_all_routed() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    let seen = Arc::new(AtomicUsize::new(0));
    session.on_notification("bump", {
        let seen = seen.clone();
        move |_args| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    session.on_request("ping", |_args| async { Ok(Value::from("pong")) });

    let mut chunk = Vec::new();
    for _ in 0..3 {
        chunk.extend_from_slice(
            &encode_message(RpcMessage::Notification {
                method: "bump".into(),
                args: vec![],
            })
            .unwrap(),
        );
    }
    chunk.extend_from_slice(
        &encode_message(RpcMessage::Request {
            id: 1,
            method: "ping".into(),
            args: vec![],
        })
        .unwrap(),
    );
    peer.send_raw(&chunk).await.unwrap();

    let (id, error, _) = peer.expect_response().await.unwrap();
    assert_eq!((id, error), (1, None));

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("notifications were not delivered");
}

#[tokio::test]
async fn malformed_bytes_detach_the_session() {
    init_tracing();
    let (a, b) = Transport::mem_pair();
    let session = Arc::new(RpcSession::with_config(a, SessionConfig::default()));
    let run = session.start().unwrap();
    let mut peer = MockPeer::new(b);

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.call("pending", vec![]).await }
    });
    peer.expect_request("pending").await.unwrap();

    // 0xc1 is never valid MessagePack.
    peer.send_raw(&[0xc1]).await.unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_connection_error(), "{err:?}");
    assert!(matches!(run.await.unwrap(), Err(RpcError::Decode(_))));
    assert_eq!(session.state(), ConnectionState::Detached);
    assert!(session
        .close_reason()
        .is_some_and(|reason| reason.starts_with("protocol error")));
}

#[tokio::test]
async fn unknown_message_kind_detaches_the_session() {
    init_tracing();
    let (a, b) = Transport::mem_pair();
    let session = Arc::new(RpcSession::with_config(a, SessionConfig::default()));
    let run = session.start().unwrap();
    let peer = MockPeer::new(b);

    peer.send_value(&Value::Array(vec![Value::from(5), Value::from(1), Value::Nil]))
        .await
        .unwrap();

    assert!(matches!(run.await.unwrap(), Err(RpcError::Decode(_))));
    let err = session.call("after", vec![]).await.unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn unroutable_response_is_ignored() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    session.on_request("ping", |_args| async { Ok(Value::from("pong")) });

    peer.respond(9999, Value::from("stray")).await.unwrap();

    let reply = peer.round_trip(1, "ping", vec![]).await.unwrap();
    assert_eq!(reply, Ok(Value::from("pong")));
    assert_eq!(session.state(), ConnectionState::Open);
}

#[tokio::test]
async fn max_pending_refuses_new_calls() {
    let config = SessionConfig::default().with_max_pending(2);
    let (session, mut peer) = mem_session(config).await;

    let calls: Vec<_> = (0..2)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.call("slow", vec![]).await })
        })
        .collect();
    let (first, _) = peer.expect_request("slow").await.unwrap();
    peer.expect_request("slow").await.unwrap();

    let err = session.call("third", vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ResourceExhausted));

    peer.respond(first, Value::Nil).await.unwrap();
    // One slot is free again once the first call has its response.
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.pending_request_ids().len() > 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let retry = tokio::spawn({
        let session = session.clone();
        async move { session.call("third", vec![]).await }
    });
    let (id, _) = peer.expect_request("third").await.unwrap();
    peer.respond(id, Value::from(3)).await.unwrap();
    assert_eq!(retry.await.unwrap().unwrap(), Value::from(3));

    session.detach().await;
    let mut answered = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(value) => {
                assert_eq!(value, Value::Nil);
                answered += 1;
            }
            Err(e) => assert!(e.is_connection_error(), "{e:?}"),
        }
    }
    assert_eq!(answered, 1);
}

#[tokio::test]
async fn dropped_call_frees_its_slot() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;

    let timed_out =
        tokio::time::timeout(Duration::from_millis(20), session.call("forgotten", vec![])).await;
    assert!(timed_out.is_err());
    let (id, _) = peer.expect_request("forgotten").await.unwrap();
    assert!(session.pending_request_ids().is_empty());

    // The late response has nowhere to go and is dropped.
    peer.respond(id, Value::Nil).await.unwrap();
    session.on_request("ping", |_args| async { Ok(Value::Nil) });
    assert_eq!(peer.round_trip(1, "ping", vec![]).await.unwrap(), Ok(Value::Nil));
}

#[tokio::test]
async fn request_handlers_replace_and_remove() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;

    session.on_request("version", |_args| async { Ok(Value::from(1)) });
    session.on_request("version", |_args| async { Ok(Value::from(2)) });
    assert_eq!(
        peer.round_trip(1, "version", vec![]).await.unwrap(),
        Ok(Value::from(2))
    );

    assert!(session.remove_request_handler("version"));
    assert!(!session.remove_request_handler("version"));
    assert_eq!(
        peer.round_trip(2, "version", vec![]).await.unwrap(),
        Err("unknown method: version".to_owned())
    );
}

#[tokio::test]
async fn panicking_request_handler_still_answers() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    session.on_request("crash", |_args| async {
        let fail = true;
        if fail {
            panic!("handler blew up");
        }
        Ok(Value::Nil)
    });
    session.on_request("ping", |_args| async { Ok(Value::from("pong")) });

    let reply = peer.round_trip(1, "crash", vec![]).await.unwrap();
    let message = reply.unwrap_err();
    assert!(message.contains("handler blew up"), "{message}");

    assert_eq!(
        peer.round_trip(2, "ping", vec![]).await.unwrap(),
        Ok(Value::from("pong"))
    );
}

#[tokio::test]
async fn slow_request_handler_does_not_block_reading() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    session.on_request("wait", move |_args| {
        let release_rx = release_rx.clone();
        async move {
            if let Some(rx) = release_rx.lock().await.take() {
                let _ = rx.await;
            }
            Ok(Value::from("released"))
        }
    });
    session.on_request("ping", |_args| async { Ok(Value::from("pong")) });

    peer.request(1, "wait", vec![]).await.unwrap();
    // Answered while "wait" is still running.
    assert_eq!(
        peer.round_trip(2, "ping", vec![]).await.unwrap(),
        Ok(Value::from("pong"))
    );

    release_tx.send(()).unwrap();
    let (id, error, result) = peer.expect_response().await.unwrap();
    assert_eq!((id, error, result), (1, None, Value::from("released")));
}

#[tokio::test]
async fn notifications_without_handlers_are_dropped() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    session.on_request("sync", |_args| async { Ok(Value::Nil) });

    peer.notify("redraw", vec![Value::from("early")]).await.unwrap();
    // Everything sent before the sync response has been routed.
    peer.round_trip(1, "sync", vec![]).await.unwrap().unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    session.on_notification("redraw", move |args| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(args);
        }
    });
    peer.notify("redraw", vec![Value::from("late")]).await.unwrap();

    let args = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(args, vec![Value::from("late")]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn handler_added_later_skips_notifications_already_received() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    session.on_request("sync", |_args| async { Ok(Value::Nil) });

    // The first handler holds the queue until the test releases it.
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    session.on_notification("event", {
        let gate = gate.clone();
        move |args| {
            let gate = gate.clone();
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(args);
                gate.acquire().await.unwrap().forget();
            }
        }
    });

    peer.notify("event", vec![Value::from(1)]).await.unwrap();
    peer.notify("event", vec![Value::from(2)]).await.unwrap();
    peer.round_trip(1, "sync", vec![]).await.unwrap().unwrap();

    let (late_tx, mut late_rx) = tokio::sync::mpsc::unbounded_channel();
    session.on_notification("event", move |args| {
        let late_tx = late_tx.clone();
        async move {
            let _ = late_tx.send(args);
        }
    });
    gate.add_permits(3);
    peer.notify("event", vec![Value::from(3)]).await.unwrap();

    let first_late = tokio::time::timeout(Duration::from_secs(5), late_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_late, vec![Value::from(3)]);
    assert!(late_rx.try_recv().is_err());

    for n in 1..=3 {
        assert_eq!(seen_rx.recv().await.unwrap(), vec![Value::from(n)]);
    }
}

#[tokio::test]
async fn notification_handler_can_remove_itself() {
    let (session, peer) = mem_session(SessionConfig::default()).await;
    let once_calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    session.on_notification("event", {
        let once_calls = once_calls.clone();
        move |_args| {
            let once_calls = once_calls.clone();
            async move {
                once_calls.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Remove
            }
        }
    });
    let every = session.on_notification("event", move |args| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(args);
        }
    });

    for n in 0..3 {
        peer.notify("event", vec![Value::from(n)]).await.unwrap();
    }
    for n in 0..3 {
        let args = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(args, vec![Value::from(n)]);
    }
    assert_eq!(once_calls.load(Ordering::SeqCst), 1);

    assert!(session.remove_notification_handler("event", every));
    assert!(!session.remove_notification_handler("event", every));
}

#[tokio::test]
async fn failed_bootstrap_is_not_cached() {
    let (session, mut peer) = mem_session(SessionConfig::default()).await;
    let method = session.config().api_info_method.clone();

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.channel_id().await }
    });
    let (id, _) = peer.expect_request(&method).await.unwrap();
    peer.respond_error(id, "not ready").await.unwrap();
    assert!(matches!(first.await.unwrap(), Err(RpcError::Remote(_))));

    let second = tokio::spawn({
        let session = session.clone();
        async move { session.api_info().await.map(|info| info.channel_id) }
    });
    let (id, _) = peer.expect_request(&method).await.unwrap();
    peer.respond(id, Value::Array(vec![Value::from(3), Value::Nil]))
        .await
        .unwrap();
    assert_eq!(second.await.unwrap().unwrap(), 3);
}

#[tokio::test]
async fn client_info_is_announced_on_start() {
    let info = ClientInfo::new("mprpc-test");
    let config = SessionConfig::default().with_client_info(info);
    let method = config.client_info_method.clone();

    init_tracing();
    let (a, b) = Transport::mem_pair();
    let session = Arc::new(RpcSession::with_config(a, config));
    session.on_request("ping", |_args| async { Ok(Value::from("pong")) });
    session.start().unwrap();
    let mut peer = MockPeer::new(b);

    let (id, args) = peer.expect_request(&method).await.unwrap();
    assert_eq!(args.len(), 5);
    assert_eq!(args[0], Value::from("mprpc-test"));
    assert_eq!(args[2], Value::from("remote"));
    let methods = args[3].as_map().expect("method table");
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].0, Value::from("ping"));
    peer.respond(id, Value::Nil).await.unwrap();

    assert_eq!(session.state(), ConnectionState::Open);
    session.detach().await;
}

#[tokio::test]
async fn peer_close_wakes_closed_waiters() {
    let (session, peer) = mem_session(SessionConfig::default()).await;
    let waiter = tokio::spawn({
        let session = session.clone();
        async move { session.closed().await }
    });

    peer.close().await;
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.close_reason().as_deref(), Some("connection closed"));
}
