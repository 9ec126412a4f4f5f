//! mprpc-testkit: Shared session scenarios for mprpc transports.
//!
//! Provides a `TransportFactory` trait, a scripted [`MockPeer`], and test
//! scenarios that every transport must pass.
//!
//! # Usage
//!
//! Each transport implements `TransportFactory` and runs the shared tests:
//!
//! ```ignore
//! use mprpc_testkit::{TransportFactory, TestError};
//!
//! struct MyTransportFactory;
//!
//! impl TransportFactory for MyTransportFactory {
//!     fn connect_pair(
//!     ) -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send {
//!         async { /* create connected pair */ }
//!     }
//! }
//!
//! #[tokio::test]
//! async fn my_transport_echo() {
//!     mprpc_testkit::run_echo::<MyTransportFactory>().await;
//! }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mprpc_core::{
    DecodeError, ErrorCode, RpcError, RpcSession, SessionConfig, Transport, TransportError, Value,
};

pub mod bidirectional;
mod peer;

pub use peer::{MockPeer, RECV_TIMEOUT};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Transport creation failed.
    Setup(String),
    /// RPC call failed.
    Rpc(RpcError),
    Transport(TransportError),
    /// The session sent bytes the peer could not decode.
    Decode(DecodeError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Rpc(e) => write!(f, "RPC error: {}", e),
            TestError::Transport(e) => write!(f, "transport error: {}", e),
            TestError::Decode(e) => write!(f, "decode error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        TestError::Rpc(e)
    }
}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        TestError::Transport(e)
    }
}

impl From<DecodeError> for TestError {
    fn from(e: DecodeError) -> Self {
        TestError::Decode(e)
    }
}

/// Factory trait for creating transport pairs for testing.
pub trait TransportFactory: Send + Sync + 'static {
    /// Create a connected pair of transports.
    ///
    /// Returns (session_side, peer_side): bytes written on one side are read
    /// on the other.
    fn connect_pair() -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send;
}

/// In-process channel pair that keeps write boundaries.
pub struct MemTransportFactory;

impl TransportFactory for MemTransportFactory {
    fn connect_pair() -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send {
        async { Ok(Transport::mem_pair()) }
    }
}

/// Byte-stream pair over an in-memory duplex pipe.
pub struct StreamTransportFactory;

impl TransportFactory for StreamTransportFactory {
    fn connect_pair() -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send {
        async { Ok(Transport::stream_pair()) }
    }
}

static TRACING_INIT: AtomicBool = AtomicBool::new(false);

/// Install a fmt subscriber once per test binary, filtered by `RUST_LOG`.
pub fn init_tracing() {
    if TRACING_INIT
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// A started session on one end of `F`'s pair and a mock peer on the other.
pub async fn session_with_peer<F: TransportFactory>(
    config: SessionConfig,
) -> Result<(Arc<RpcSession>, MockPeer), TestError> {
    init_tracing();
    let (session_transport, peer_transport) = F::connect_pair().await?;
    let session = Arc::new(RpcSession::with_config(session_transport, config));
    session
        .start()
        .ok_or_else(|| TestError::Setup("session did not start".into()))?;
    Ok((session, MockPeer::new(peer_transport)))
}

fn expect_connection_error(result: Result<Value, RpcError>, what: &str) -> Result<(), TestError> {
    match result {
        Err(e) if e.is_connection_error() => Ok(()),
        other => Err(TestError::Assertion(format!(
            "{what}: expected a connection error, got {other:?}"
        ))),
    }
}

async fn join_call(
    handle: tokio::task::JoinHandle<Result<Value, RpcError>>,
) -> Result<Result<Value, RpcError>, TestError> {
    handle
        .await
        .map_err(|e| TestError::Setup(format!("call task panicked: {}", e)))
}

// ============================================================================
// Call scenarios
// ============================================================================

/// One call, answered with its own arguments.
pub async fn run_echo<F: TransportFactory>() {
    let result = run_echo_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_echo failed: {}", e);
    }
}

async fn run_echo_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (session, mut peer) = session_with_peer::<F>(SessionConfig::default()).await?;

    let call = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .call("echo", vec![Value::from("hello"), Value::from(42)])
                .await
        }
    });

    let (id, args) = peer.expect_request("echo").await?;
    peer.respond(id, Value::Array(args)).await?;

    let result = join_call(call).await??;
    let expected = Value::Array(vec![Value::from("hello"), Value::from(42)]);
    if result != expected {
        return Err(TestError::Assertion(format!(
            "expected {expected}, got {result}"
        )));
    }

    session.detach().await;
    Ok(())
}

/// Several calls in flight, answered in reverse order; each caller gets the
/// response carrying its own id.
pub async fn run_out_of_order_responses<F: TransportFactory>() {
    let result = run_out_of_order_responses_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_out_of_order_responses failed: {}", e);
    }
}

async fn run_out_of_order_responses_inner<F: TransportFactory>() -> Result<(), TestError> {
    const CALLS: i64 = 8;
    let (session, mut peer) = session_with_peer::<F>(SessionConfig::default()).await?;

    let mut calls = Vec::new();
    for n in 0..CALLS {
        let session = session.clone();
        calls.push((
            n,
            tokio::spawn(async move { session.call("square", vec![Value::from(n)]).await }),
        ));
    }

    let mut requests = Vec::new();
    let mut ids = HashSet::new();
    for _ in 0..CALLS {
        let (id, args) = peer.expect_request("square").await?;
        if !ids.insert(id) {
            return Err(TestError::Assertion(format!("request id {id} reused")));
        }
        requests.push((id, args));
    }

    for (id, args) in requests.into_iter().rev() {
        let n = args.first().and_then(Value::as_i64).unwrap_or_default();
        peer.respond(id, Value::from(n * n)).await?;
    }

    for (n, call) in calls {
        let result = join_call(call).await??;
        if result.as_i64() != Some(n * n) {
            return Err(TestError::Assertion(format!(
                "square({n}): expected {}, got {result}",
                n * n
            )));
        }
    }

    session.detach().await;
    Ok(())
}

/// A response with a non-nil error fails only that call.
pub async fn run_remote_error<F: TransportFactory>() {
    let result = run_remote_error_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_remote_error failed: {}", e);
    }
}

async fn run_remote_error_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (session, mut peer) = session_with_peer::<F>(SessionConfig::default()).await?;

    let failing = tokio::spawn({
        let session = session.clone();
        async move { session.call("explode", vec![]).await }
    });
    let (id, _) = peer.expect_request("explode").await?;
    // Error as [code, message], the way editor hosts send it.
    peer.send_value(&Value::Array(vec![
        Value::from(1),
        Value::from(id),
        Value::Array(vec![Value::from(0), Value::from("boom")]),
        Value::Nil,
    ]))
    .await?;

    match join_call(failing).await? {
        Err(RpcError::Remote(message)) if message == "boom" => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected remote error \"boom\", got {other:?}"
            )));
        }
    }

    // The session is still usable.
    let next = tokio::spawn({
        let session = session.clone();
        async move { session.call("fine", vec![]).await }
    });
    let (id, _) = peer.expect_request("fine").await?;
    peer.respond(id, Value::Boolean(true)).await?;
    if join_call(next).await?? != Value::Boolean(true) {
        return Err(TestError::Assertion("follow-up call failed".into()));
    }

    session.detach().await;
    Ok(())
}

// ============================================================================
// Teardown scenarios
// ============================================================================

/// Detaching fails every pending call, closes the transport, and makes later
/// calls fail without touching the wire.
pub async fn run_detach_fails_pending<F: TransportFactory>() {
    let result = run_detach_fails_pending_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_detach_fails_pending failed: {}", e);
    }
}

async fn run_detach_fails_pending_inner<F: TransportFactory>() -> Result<(), TestError> {
    const CALLS: usize = 4;
    let (session, mut peer) = session_with_peer::<F>(SessionConfig::default()).await?;

    let calls: Vec<_> = (0..CALLS)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.call("never_answered", vec![]).await })
        })
        .collect();
    for _ in 0..CALLS {
        peer.expect_request("never_answered").await?;
    }
    if session.pending_request_ids().len() != CALLS {
        return Err(TestError::Assertion(format!(
            "expected {CALLS} pending calls, got {:?}",
            session.pending_request_ids()
        )));
    }

    session.detach().await;

    for call in calls {
        expect_connection_error(join_call(call).await?, "pending call")?;
    }
    if !session.pending_request_ids().is_empty() {
        return Err(TestError::Assertion("pending table not empty".into()));
    }

    expect_connection_error(session.call("late", vec![]).await, "call after detach")?;
    if session.notify("late", vec![]).await.is_ok() {
        return Err(TestError::Assertion("notify after detach succeeded".into()));
    }

    // Idempotent.
    session.detach().await;

    peer.expect_closed().await
}

/// The peer hanging up fails every pending call.
pub async fn run_peer_close_fails_pending<F: TransportFactory>() {
    let result = run_peer_close_fails_pending_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_peer_close_fails_pending failed: {}", e);
    }
}

async fn run_peer_close_fails_pending_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (session, mut peer) = session_with_peer::<F>(SessionConfig::default()).await?;

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.call("hang", vec![]).await }
    });
    peer.expect_request("hang").await?;
    peer.close().await;

    expect_connection_error(join_call(call).await?, "pending call")?;
    tokio::time::timeout(RECV_TIMEOUT, session.closed())
        .await
        .map_err(|_| TestError::Assertion("session never detached".into()))?;

    match session.call("late", vec![]).await {
        Err(e) if e.is_connection_error() => Ok(()),
        other => Err(TestError::Assertion(format!(
            "expected a connection error after peer close, got {other:?}"
        ))),
    }
}

/// Detaching while the peer has stopped reading resolves every call, both
/// those waiting for a response and those stuck writing their request.
pub async fn run_detach_unblocks_blocked_writers<F: TransportFactory>() {
    let result = run_detach_unblocks_blocked_writers_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_detach_unblocks_blocked_writers failed: {}", e);
    }
}

async fn run_detach_unblocks_blocked_writers_inner<F: TransportFactory>() -> Result<(), TestError> {
    const CALLS: usize = 100;
    let (session, peer) = session_with_peer::<F>(SessionConfig::default()).await?;
    let payload = Value::from("x".repeat(4096));

    let calls: Vec<_> = (0..CALLS)
        .map(|_| {
            let session = session.clone();
            let args = vec![payload.clone()];
            tokio::spawn(async move { session.call("bulk", args).await })
        })
        .collect();

    // Let the writes back up behind the peer, which never reads.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    session.detach().await;

    for call in calls {
        let result = tokio::time::timeout(RECV_TIMEOUT, join_call(call))
            .await
            .map_err(|_| TestError::Assertion("call still pending after detach".into()))??;
        expect_connection_error(result, "call blocked behind a stalled peer")?;
    }
    if !session.pending_request_ids().is_empty() {
        return Err(TestError::Assertion("pending table not empty".into()));
    }

    drop(peer);
    Ok(())
}

// ============================================================================
// Incoming traffic scenarios
// ============================================================================

/// Requests from the peer: registered handlers answer, unknown methods get
/// an error response, and handler failures become error responses.
pub async fn run_incoming_requests<F: TransportFactory>() {
    let result = run_incoming_requests_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_incoming_requests failed: {}", e);
    }
}

async fn run_incoming_requests_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (session, mut peer) = session_with_peer::<F>(SessionConfig::default()).await?;

    session.on_request("add", |args| async move {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok(Value::from(sum))
    });
    session.on_request("reject", |_args| async move {
        Err(RpcError::status(ErrorCode::InvalidArgument, "bad input"))
    });

    let sum = peer
        .round_trip(1, "add", vec![Value::from(2), Value::from(3)])
        .await?;
    if sum != Ok(Value::from(5)) {
        return Err(TestError::Assertion(format!("add: got {sum:?}")));
    }

    let rejected = peer.round_trip(2, "reject", vec![]).await?;
    if rejected != Err("bad input".to_owned()) {
        return Err(TestError::Assertion(format!("reject: got {rejected:?}")));
    }

    let unknown = peer.round_trip(3, "missing", vec![]).await?;
    if unknown != Err("unknown method: missing".to_owned()) {
        return Err(TestError::Assertion(format!("missing: got {unknown:?}")));
    }

    session.detach().await;
    Ok(())
}

/// Notifications for one name reach every handler, in arrival order.
pub async fn run_notification_order<F: TransportFactory>() {
    let result = run_notification_order_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_notification_order failed: {}", e);
    }
}

async fn run_notification_order_inner<F: TransportFactory>() -> Result<(), TestError> {
    const COUNT: i64 = 20;
    let (session, peer) = session_with_peer::<F>(SessionConfig::default()).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for tag in ["first", "second"] {
        let tx = tx.clone();
        session.on_notification("redraw", move |args| {
            let tx = tx.clone();
            async move {
                let n = args.first().and_then(Value::as_i64).unwrap_or(-1);
                let _ = tx.send((tag, n));
            }
        });
    }
    drop(tx);

    for n in 0..COUNT {
        peer.notify("redraw", vec![Value::from(n)]).await?;
    }

    for n in 0..COUNT {
        for tag in ["first", "second"] {
            let got = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
                .await
                .map_err(|_| TestError::Assertion("notification never delivered".into()))?;
            if got != Some((tag, n)) {
                return Err(TestError::Assertion(format!(
                    "expected ({tag}, {n}), got {got:?}"
                )));
            }
        }
    }

    session.detach().await;
    Ok(())
}

// ============================================================================
// Bootstrap scenarios
// ============================================================================

/// Concurrent first `channel_id` callers share one bootstrap call; later
/// callers use the cached value.
pub async fn run_channel_id_bootstrap<F: TransportFactory>() {
    let result = run_channel_id_bootstrap_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_channel_id_bootstrap failed: {}", e);
    }
}

async fn run_channel_id_bootstrap_inner<F: TransportFactory>() -> Result<(), TestError> {
    const CALLERS: usize = 5;
    let config = SessionConfig::default();
    let api_info_method = config.api_info_method.clone();
    let (session, mut peer) = session_with_peer::<F>(config).await?;

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.channel_id().await })
        })
        .collect();

    let (id, _) = peer.expect_request(&api_info_method).await?;
    peer.respond(
        id,
        Value::Array(vec![
            Value::from(7),
            Value::Map(vec![(Value::from("functions"), Value::Array(vec![]))]),
        ]),
    )
    .await?;

    for caller in callers {
        let channel = caller
            .await
            .map_err(|e| TestError::Setup(format!("caller panicked: {}", e)))??;
        if channel != 7 {
            return Err(TestError::Assertion(format!("expected channel 7, got {channel}")));
        }
    }

    if session.channel_id().await? != 7 {
        return Err(TestError::Assertion("cached channel id changed".into()));
    }

    // The next thing on the wire is this call, not a second bootstrap.
    let next = tokio::spawn({
        let session = session.clone();
        async move { session.call("after_bootstrap", vec![]).await }
    });
    let (id, _) = peer.expect_request("after_bootstrap").await?;
    peer.respond(id, Value::Nil).await?;
    join_call(next).await??;

    session.detach().await;
    Ok(())
}
