//! RpcSession: a MessagePack-RPC session that owns the transport.
//!
//! Only the session's decoder loop reads from the transport. Everything the
//! peer sends is routed from there:
//!
//! ```text
//!                        ┌─────────────────────────────────┐
//!                        │           RpcSession            │
//!                        ├─────────────────────────────────┤
//!                        │  transport: Transport           │
//!                        │  calls: HashMap<request_id,     │
//!                        │         oneshot::Sender>        │
//!                        │  handlers: HandlerRegistry      │
//!                        │  queues: per-name mpsc          │
//!                        └───────────┬─────────────────────┘
//!                                    │
//!                              decoder loop
//!                                    │
//!        ┌───────────────────────────┼───────────────────────────┐
//!        │                           │                           │
//!    response?                 notification?                 request?
//!        │                           │                           │
//!  ┌─────▼─────────────┐   ┌─────────▼─────────┐   ┌─────────────▼─────────────┐
//!  │ Resolve the       │   │ Queue for the     │   │ Spawn handler, write one  │
//!  │ pending oneshot   │   │ per-name worker   │   │ response with the same id │
//!  └───────────────────┘   └───────────────────┘   └───────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let transport = Transport::unix("/run/user/1000/host.sock").await?;
//! let session = Arc::new(RpcSession::new(transport));
//!
//! session.on_notification("redraw", |args| async move {
//!     println!("redraw: {args:?}");
//! });
//! session.on_request("ping", |_args| async { Ok(Value::from("pong")) });
//!
//! session.start();
//! let channel = session.channel_id().await?;
//! let line = session.call("nvim_get_current_line", vec![]).await?;
//! session.detach().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, watch, OnceCell};
use tokio::task::JoinHandle;

use crate::dispatch::{invoke_request_handler, NotificationQueues};
use crate::handlers::{
    BoxFuture, HandlerId, HandlerOutcome, HandlerRegistry, NotificationHandler, RequestHandler,
};
use crate::{
    encode_message, ApiInfo, ClientInfo, DecodeError, ErrorCode, MessageDecoder, MethodInfo,
    RpcError, RpcMessage, SessionConfig, Transport, TransportError,
};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, decoder loop not started yet.
    Connecting,
    Open,
    /// Terminal. The transport is closed and nothing is pending.
    Detached,
}

type CallOutcome = Result<Value, RpcError>;

struct PendingCall {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

struct CallTable {
    next_id: u32,
    calls: HashMap<u32, PendingCall>,
    /// Set exactly once, by the first shutdown. Checked under the same lock
    /// as registration so no call can slip in after the drain.
    closed: Option<String>,
}

impl CallTable {
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.calls.contains_key(&id) {
                return id;
            }
        }
    }
}

/// A bidirectional MessagePack-RPC session over one transport.
pub struct RpcSession {
    transport: Transport,
    config: SessionConfig,
    calls: Mutex<CallTable>,
    state: watch::Sender<ConnectionState>,
    handlers: Arc<HandlerRegistry>,
    queues: NotificationQueues,
    api_info: OnceCell<ApiInfo>,
}

impl RpcSession {
    /// Create a session with configuration taken from the environment.
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, SessionConfig::from_env())
    }

    pub fn with_config(transport: Transport, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            transport,
            config,
            calls: Mutex::new(CallTable {
                next_id: 1,
                calls: HashMap::new(),
                closed: None,
            }),
            state,
            handlers: Arc::new(HandlerRegistry::default()),
            queues: NotificationQueues::default(),
            api_info: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the session is detached, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        loop {
            if *state.borrow_and_update() == ConnectionState::Detached {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Why the session detached, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.calls.lock().closed.clone()
    }

    /// Get the ids of calls still waiting for a response (for diagnostics).
    pub fn pending_request_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.calls.lock().calls.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Open the session: spawn the decoder loop and, if configured, announce
    /// the client info.
    ///
    /// Returns `None` if the session was already started or detached.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<Result<(), RpcError>>> {
        let opened = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            return None;
        }

        tracing::debug!("RpcSession::start: session open");
        let handle = tokio::spawn(self.clone().run());

        if let Some(info) = self.config.client_info.clone() {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.set_client_info(&info).await {
                    tracing::warn!(error = %e, client = %info.name, "client info handshake failed");
                }
            });
        }

        Some(handle)
    }

    // ========================================================================
    // Handler registration
    // ========================================================================

    /// Register a handler for notifications named `name`.
    ///
    /// Handlers for one name run in registration order, each awaited before
    /// the next. Returning [`HandlerOutcome::Remove`] unregisters the handler
    /// after the current invocation; returning `()` keeps it.
    pub fn on_notification<F, Fut, O>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: Into<HandlerOutcome> + 'static,
    {
        let boxed: NotificationHandler =
            Arc::new(move |args: Vec<Value>| -> BoxFuture<HandlerOutcome> {
                let fut = handler(args);
                Box::pin(async move { fut.await.into() })
            });
        self.handlers.add_notification(name, boxed)
    }

    pub fn remove_notification_handler(&self, name: &str, id: HandlerId) -> bool {
        self.handlers.remove_notification(name, id)
    }

    /// Register the handler answering requests for `name`, replacing any
    /// earlier one.
    ///
    /// `Ok(value)` is sent back as the result; `Err(e)` as the error string.
    pub fn on_request<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let boxed: RequestHandler =
            Arc::new(move |args: Vec<Value>| -> BoxFuture<Result<Value, RpcError>> {
                Box::pin(handler(args))
            });
        self.handlers.set_request(name, boxed);
    }

    pub fn remove_request_handler(&self, name: &str) -> bool {
        self.handlers.remove_request(name)
    }

    // ========================================================================
    // RPC APIs
    // ========================================================================

    fn check_open(&self, table: &CallTable) -> Result<(), RpcError> {
        if let Some(reason) = &table.closed {
            return Err(RpcError::session_closed(reason.clone()));
        }
        match *self.state.borrow() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Connecting => Err(RpcError::status(
                ErrorCode::FailedPrecondition,
                "session not started",
            )),
            ConnectionState::Detached => Err(RpcError::session_closed("session detached")),
        }
    }

    /// Register a pending waiter under a fresh request id.
    fn register_pending(
        &self,
        method: &str,
    ) -> Result<(u32, oneshot::Receiver<CallOutcome>), RpcError> {
        let mut table = self.calls.lock();
        self.check_open(&table)?;

        let pending_len = table.calls.len();
        let max = self.config.max_pending;
        if pending_len >= max {
            tracing::warn!(
                pending_len,
                max_pending = max,
                method,
                "too many pending RPC calls; refusing new call"
            );
            return Err(RpcError::status(
                ErrorCode::ResourceExhausted,
                "too many pending RPC calls",
            ));
        }

        let id = table.allocate_id();
        let (tx, rx) = oneshot::channel();
        table.calls.insert(
            id,
            PendingCall {
                method: method.to_owned(),
                created_at: Instant::now(),
                tx,
            },
        );
        tracing::trace!(
            request_id = id,
            method,
            pending_len = pending_len + 1,
            "registered pending call"
        );
        Ok((id, rx))
    }

    /// Call `method` on the peer and wait for its response.
    ///
    /// Calls run concurrently; responses are matched by id, in any order.
    /// There is no timeout: the call ends with the response, or with a
    /// connection error when the session detaches.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        struct PendingGuard<'a> {
            session: &'a RpcSession,
            request_id: u32,
            active: bool,
        }

        impl PendingGuard<'_> {
            fn disarm(&mut self) {
                self.active = false;
            }
        }

        impl Drop for PendingGuard<'_> {
            fn drop(&mut self) {
                if !self.active {
                    return;
                }
                if self
                    .session
                    .calls
                    .lock()
                    .calls
                    .remove(&self.request_id)
                    .is_some()
                {
                    tracing::debug!(
                        request_id = self.request_id,
                        "call cancelled/dropped: removed pending call"
                    );
                }
            }
        }

        if method.is_empty() {
            return Err(RpcError::status(
                ErrorCode::InvalidArgument,
                "method name must not be empty",
            ));
        }

        // Register waiter before sending
        let (request_id, rx) = self.register_pending(method)?;
        let mut guard = PendingGuard {
            session: self,
            request_id,
            active: true,
        };

        self.send_message(RpcMessage::Request {
            id: request_id,
            method: method.to_owned(),
            args,
        })
        .await?;
        tracing::debug!(request_id, method, "call: request sent");

        let outcome = rx.await;
        guard.disarm();
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::session_closed("call dropped without a response")),
        }
    }

    /// [`call`](Self::call), then deserialize the result into `T`.
    pub async fn call_as<T>(&self, method: &str, args: Vec<Value>) -> Result<T, RpcError>
    where
        T: DeserializeOwned,
    {
        let value = self.call(method, args).await?;
        rmpv::ext::from_value(value)
            .map_err(|e| RpcError::Decode(DecodeError::InvalidValue(e.to_string())))
    }

    /// Send a notification to the peer. Nothing comes back.
    pub async fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        if method.is_empty() {
            return Err(RpcError::status(
                ErrorCode::InvalidArgument,
                "method name must not be empty",
            ));
        }
        {
            let table = self.calls.lock();
            self.check_open(&table)?;
        }
        self.send_message(RpcMessage::Notification {
            method: method.to_owned(),
            args,
        })
        .await
    }

    /// Encode and write one message. A write failure detaches the session.
    async fn send_message(&self, message: RpcMessage) -> Result<(), RpcError> {
        let bytes = encode_message(message)?;
        if let Err(e) = self.transport.write_all(bytes).await {
            if self.close_reason().is_none() {
                tracing::error!(error = %e, "RpcSession: write failed");
                self.shutdown(format!("write failed: {e}")).await;
            }
            return Err(RpcError::Transport(e));
        }
        Ok(())
    }

    // ========================================================================
    // Introspection and handshake
    // ========================================================================

    /// The peer's API description, fetched once and cached.
    ///
    /// Concurrent first callers share a single bootstrap call. A failed
    /// bootstrap is not cached.
    pub async fn api_info(&self) -> Result<&ApiInfo, RpcError> {
        self.api_info
            .get_or_try_init(|| async {
                let method = self.config.api_info_method.as_str();
                tracing::debug!(method, "fetching api info");
                let value = self.call(method, Vec::new()).await?;
                let info = ApiInfo::from_value(value)?;
                tracing::debug!(channel_id = info.channel_id, "api info cached");
                Ok::<_, RpcError>(info)
            })
            .await
    }

    /// The channel id the peer assigned to this connection.
    pub async fn channel_id(&self) -> Result<u64, RpcError> {
        Ok(self.api_info().await?.channel_id)
    }

    /// Announce who we are to the peer and wait for the acknowledgement.
    ///
    /// An empty method table is filled in from the registered request
    /// handlers.
    pub async fn set_client_info(&self, info: &ClientInfo) -> Result<(), RpcError> {
        let mut info = info.clone();
        if info.methods.is_empty() {
            for name in self.handlers.request_names() {
                info.methods.insert(name, MethodInfo::default());
            }
        }
        tracing::debug!(
            client = %info.name,
            methods = info.methods.len(),
            "announcing client info"
        );
        self.call(&self.config.client_info_method, info.to_args())
            .await
            .map(|_| ())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Detach from the peer.
    ///
    /// Fails every pending call with a connection error, clears all handlers
    /// and closes the transport. Later calls fail immediately. Idempotent.
    pub async fn detach(&self) {
        self.shutdown("session detached".to_owned()).await;
    }

    /// Move to `Detached`. Returns false if already there.
    async fn shutdown(&self, reason: String) -> bool {
        let drained = {
            let mut table = self.calls.lock();
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(reason.clone());
            std::mem::take(&mut table.calls)
        };
        self.state.send_replace(ConnectionState::Detached);

        tracing::debug!(reason = %reason, failed_calls = drained.len(), "RpcSession: detaching");
        for (request_id, call) in drained {
            tracing::trace!(request_id, method = %call.method, "failing pending call");
            let _ = call.tx.send(Err(RpcError::session_closed(reason.clone())));
        }

        self.handlers.clear();
        self.queues.clear();
        self.transport.shutdown().await;
        true
    }

    // ========================================================================
    // Decoder loop
    // ========================================================================

    /// Read, decode and route until the transport closes or the peer sends
    /// something undecodable. Either way the session ends up detached.
    async fn run(self: Arc<Self>) -> Result<(), RpcError> {
        tracing::debug!("RpcSession::run: starting decoder loop");
        let mut decoder = MessageDecoder::new();

        loop {
            let chunk = match self.transport.read_chunk().await {
                Ok(chunk) => chunk,
                Err(TransportError::Closed) => {
                    tracing::debug!("RpcSession::run: transport closed");
                    self.shutdown("connection closed".to_owned()).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "RpcSession::run: transport error");
                    self.shutdown(format!("transport error: {e}")).await;
                    return Err(RpcError::Transport(e));
                }
            };

            decoder.extend(&chunk);
            loop {
                match decoder.next_message() {
                    Ok(Some(message)) => self.route(message),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            buffered = decoder.buffered_len(),
                            "RpcSession::run: protocol error"
                        );
                        self.shutdown(format!("protocol error: {e}")).await;
                        return Err(RpcError::Decode(e));
                    }
                }
            }
        }
    }

    fn route(self: &Arc<Self>, message: RpcMessage) {
        match message {
            RpcMessage::Response { id, error, result } => self.resolve_response(id, error, result),
            RpcMessage::Notification { method, args } => {
                let handlers = self.handlers.notification_snapshot(&method);
                if handlers.is_empty() {
                    tracing::debug!(method = %method, "no notification handler; dropping");
                    return;
                }
                self.queues.enqueue(&self.handlers, method, handlers, args);
            }
            RpcMessage::Request { id, method, args } => self.dispatch_request(id, method, args),
        }
    }

    fn resolve_response(&self, request_id: u32, error: Option<String>, result: Value) {
        let waiter = self.calls.lock().calls.remove(&request_id);
        let Some(call) = waiter else {
            tracing::warn!(
                request_id,
                "RpcSession::run: unroutable response (no pending call)"
            );
            return;
        };

        tracing::debug!(
            request_id,
            method = %call.method,
            failed = error.is_some(),
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "response delivered"
        );
        let outcome = match error {
            Some(message) => Err(RpcError::Remote(message)),
            None => Ok(result),
        };
        let _ = call.tx.send(outcome);
    }

    /// Answer an incoming request on its own task: exactly one response,
    /// whether the handler succeeds, fails, panics or does not exist.
    fn dispatch_request(self: &Arc<Self>, request_id: u32, method: String, args: Vec<Value>) {
        let handler = self.handlers.request_handler(&method);
        let session = self.clone();

        tokio::spawn(async move {
            let response = match handler {
                Some(handler) => {
                    tracing::debug!(request_id, method = %method, "dispatching request");
                    match invoke_request_handler(handler, args).await {
                        Ok(result) => RpcMessage::ok(request_id, result),
                        Err(e) => {
                            tracing::debug!(
                                request_id,
                                method = %method,
                                error = %e,
                                "request handler failed"
                            );
                            RpcMessage::err(request_id, e.to_response_message())
                        }
                    }
                }
                None => {
                    tracing::warn!(request_id, method = %method, "no request handler registered");
                    let e = RpcError::status(
                        ErrorCode::Unimplemented,
                        format!("unknown method: {method}"),
                    );
                    RpcMessage::err(request_id, e.to_response_message())
                }
            };

            if let Err(e) = session.send_message(response).await {
                tracing::warn!(
                    request_id,
                    method = %method,
                    error = %e,
                    "RpcSession: failed to send response"
                );
            }
        });
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("state", &self.state())
            .field("pending", &self.calls.lock().calls.len())
            .finish_non_exhaustive()
    }
}
