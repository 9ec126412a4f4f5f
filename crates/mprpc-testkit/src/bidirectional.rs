//! Bidirectional RPC test harness.
//!
//! Two sessions on either end of one transport pair, each answering the
//! other's requests. Covers the callback pattern where a request handler
//! calls back into the peer before it can answer.
//!
//! # Usage
//!
//! ```ignore
//! use mprpc_testkit::bidirectional::{run_bidirectional_scenario, BidirectionalScenario};
//!
//! #[tokio::test]
//! async fn test_bidirectional() {
//!     run_bidirectional_scenario::<MemTransportFactory>(BidirectionalScenario::NestedCallback)
//!         .await;
//! }
//! ```

use std::sync::Arc;

use mprpc_core::{ErrorCode, RpcError, RpcSession, SessionConfig, Value};

use crate::{init_tracing, TestError, TransportFactory};

/// Scenarios for bidirectional RPC testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidirectionalScenario {
    /// Simple echo: A calls B, B echoes back.
    SimpleEcho,

    /// A calls B, B calls A during processing (nested callback).
    NestedCallback,

    /// Multiple nested calls: A calls B, B calls A multiple times.
    MultipleNestedCallbacks,

    /// A and B call each other at the same time.
    CrossCalls,
}

/// Run a bidirectional RPC scenario.
pub async fn run_bidirectional_scenario<F: TransportFactory>(scenario: BidirectionalScenario) {
    let result = match scenario {
        BidirectionalScenario::SimpleEcho => run_simple_echo::<F>().await,
        BidirectionalScenario::NestedCallback => run_nested_callback::<F>().await,
        BidirectionalScenario::MultipleNestedCallbacks => run_multiple_nested::<F>().await,
        BidirectionalScenario::CrossCalls => run_cross_calls::<F>().await,
    };

    if let Err(e) = result {
        panic!("bidirectional scenario {:?} failed: {}", scenario, e);
    }
}

/// Two sessions joined by `F`. Neither is started yet, so handlers can be
/// registered first.
pub async fn session_pair<F: TransportFactory>(
) -> Result<(Arc<RpcSession>, Arc<RpcSession>), TestError> {
    init_tracing();
    let (transport_a, transport_b) = F::connect_pair().await?;
    Ok((
        Arc::new(RpcSession::with_config(transport_a, SessionConfig::default())),
        Arc::new(RpcSession::with_config(transport_b, SessionConfig::default())),
    ))
}

fn start_both(a: &Arc<RpcSession>, b: &Arc<RpcSession>) -> Result<(), TestError> {
    for session in [a, b] {
        session
            .start()
            .ok_or_else(|| TestError::Setup("session did not start".into()))?;
    }
    Ok(())
}

fn text(value: &Value) -> Result<String, TestError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| TestError::Assertion(format!("expected a string, got {value}")))
}

// ============================================================================
// Scenario: Simple Echo
// ============================================================================

async fn run_simple_echo<F: TransportFactory>() -> Result<(), TestError> {
    let (session_a, session_b) = session_pair::<F>().await?;

    session_b.on_request("echo", |args| async move { Ok(Value::Array(args)) });
    start_both(&session_a, &session_b)?;

    let response = session_a.call("echo", vec![Value::from("hello")]).await?;
    if response != Value::Array(vec![Value::from("hello")]) {
        return Err(TestError::Assertion(format!(
            "expected echo [\"hello\"], got {response}"
        )));
    }

    // Cleanup
    session_a.detach().await;
    session_b.detach().await;
    Ok(())
}

// ============================================================================
// Scenario: Nested Callback
// ============================================================================

async fn run_nested_callback<F: TransportFactory>() -> Result<(), TestError> {
    let (session_a, session_b) = session_pair::<F>().await?;

    // A provides "get_prefix"
    session_a.on_request("get_prefix", |_args| async { Ok(Value::from("PREFIX:")) });

    // B provides "format": calls A's get_prefix, then appends the input
    let session_b_for_handler = session_b.clone();
    session_b.on_request("format", move |args| {
        let session = session_b_for_handler.clone();
        async move {
            let prefix = session.call("get_prefix", vec![]).await.map_err(|e| {
                RpcError::status(ErrorCode::Internal, format!("callback failed: {e}"))
            })?;
            let input = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::from(format!(
                "{}{}",
                prefix.as_str().unwrap_or_default(),
                input
            )))
        }
    });

    start_both(&session_a, &session_b)?;

    let response = session_a.call("format", vec![Value::from("test")]).await?;
    if text(&response)? != "PREFIX:test" {
        return Err(TestError::Assertion(format!(
            "expected 'PREFIX:test', got {response}"
        )));
    }

    // Cleanup
    session_a.detach().await;
    session_b.detach().await;
    Ok(())
}

// ============================================================================
// Scenario: Multiple Nested Callbacks
// ============================================================================

async fn run_multiple_nested<F: TransportFactory>() -> Result<(), TestError> {
    let (session_a, session_b) = session_pair::<F>().await?;

    // A provides "double"
    session_a.on_request("double", |args| async move {
        let n = args.first().and_then(Value::as_i64).ok_or_else(|| {
            RpcError::status(ErrorCode::InvalidArgument, "expected an integer")
        })?;
        Ok(Value::from(n * 2))
    });

    // B provides "sum_doubled": doubles each argument by calling A
    let session_b_for_handler = session_b.clone();
    session_b.on_request("sum_doubled", move |args| {
        let session = session_b_for_handler.clone();
        async move {
            let mut total = 0;
            for arg in args {
                let doubled = session.call("double", vec![arg]).await?;
                total += doubled.as_i64().unwrap_or_default();
            }
            Ok(Value::from(total))
        }
    });

    start_both(&session_a, &session_b)?;

    let args = (1..=5).map(Value::from).collect();
    let response = session_a.call("sum_doubled", args).await?;
    if response.as_i64() != Some(30) {
        return Err(TestError::Assertion(format!("expected 30, got {response}")));
    }

    // Cleanup
    session_a.detach().await;
    session_b.detach().await;
    Ok(())
}

// ============================================================================
// Scenario: Cross Calls
// ============================================================================

async fn run_cross_calls<F: TransportFactory>() -> Result<(), TestError> {
    let (session_a, session_b) = session_pair::<F>().await?;

    session_a.on_request("whoami", |_args| async { Ok(Value::from("a")) });
    session_b.on_request("whoami", |_args| async { Ok(Value::from("b")) });
    start_both(&session_a, &session_b)?;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let (caller, expected) = if i % 2 == 0 {
            (session_a.clone(), "b")
        } else {
            (session_b.clone(), "a")
        };
        tasks.push(tokio::spawn(async move {
            let got = caller.call("whoami", vec![]).await?;
            Ok::<_, TestError>((got, expected))
        }));
    }

    for task in tasks {
        let (got, expected) = task
            .await
            .map_err(|e| TestError::Setup(format!("caller panicked: {}", e)))??;
        if text(&got)? != expected {
            return Err(TestError::Assertion(format!(
                "expected {expected}, got {got}"
            )));
        }
    }

    // Cleanup
    session_a.detach().await;
    session_b.detach().await;
    Ok(())
}
