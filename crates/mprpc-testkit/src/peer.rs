//! A scripted peer that speaks raw MessagePack-RPC on the far end of a
//! transport.
//!
//! Tests drive it by hand: read what the session sent, answer in whatever
//! order or shape the scenario needs, or send bytes no real peer would.

use std::time::Duration;

use mprpc_core::{encode_message, MessageDecoder, RpcMessage, Transport, TransportError, Value};

use crate::TestError;

/// How long [`MockPeer::recv`] waits before giving up on the session.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockPeer {
    transport: Transport,
    decoder: MessageDecoder,
}

impl MockPeer {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            decoder: MessageDecoder::new(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Next message from the session.
    pub async fn recv(&mut self) -> Result<RpcMessage, TestError> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                tracing::trace!(?message, "mock peer received");
                return Ok(message);
            }
            let chunk = tokio::time::timeout(RECV_TIMEOUT, self.transport.read_chunk())
                .await
                .map_err(|_| TestError::Assertion("timed out waiting for a message".into()))??;
            self.decoder.extend(&chunk);
        }
    }

    /// Assert the session closed its end without sending anything else.
    pub async fn expect_closed(&mut self) -> Result<(), TestError> {
        match self.recv().await {
            Err(TestError::Transport(TransportError::Closed)) => Ok(()),
            Ok(message) => Err(TestError::Assertion(format!(
                "expected the session to close, got {message:?}"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Receive a request for `method` and return its id and arguments.
    pub async fn expect_request(&mut self, method: &str) -> Result<(u32, Vec<Value>), TestError> {
        match self.recv().await? {
            RpcMessage::Request {
                id,
                method: got,
                args,
            } if got == method => Ok((id, args)),
            other => Err(TestError::Assertion(format!(
                "expected request {method:?}, got {other:?}"
            ))),
        }
    }

    /// Receive a response and return its id, error and result.
    pub async fn expect_response(
        &mut self,
    ) -> Result<(u32, Option<String>, Value), TestError> {
        match self.recv().await? {
            RpcMessage::Response { id, error, result } => Ok((id, error, result)),
            other => Err(TestError::Assertion(format!(
                "expected a response, got {other:?}"
            ))),
        }
    }

    pub async fn expect_notification(
        &mut self,
        method: &str,
    ) -> Result<Vec<Value>, TestError> {
        match self.recv().await? {
            RpcMessage::Notification { method: got, args } if got == method => Ok(args),
            other => Err(TestError::Assertion(format!(
                "expected notification {method:?}, got {other:?}"
            ))),
        }
    }

    pub async fn send(&self, message: RpcMessage) -> Result<(), TestError> {
        let bytes = encode_message(message).map_err(mprpc_core::RpcError::from)?;
        self.transport.write_all(bytes).await?;
        Ok(())
    }

    /// Encode and send an arbitrary value, well-formed message or not.
    pub async fn send_value(&self, value: &Value) -> Result<(), TestError> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value)
            .map_err(|e| TestError::Setup(format!("encode failed: {e}")))?;
        self.send_raw(&buf).await
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), TestError> {
        self.transport
            .write_all(bytes::Bytes::copy_from_slice(bytes))
            .await?;
        Ok(())
    }

    pub async fn respond(&self, id: u32, result: Value) -> Result<(), TestError> {
        self.send(RpcMessage::ok(id, result)).await
    }

    pub async fn respond_error(&self, id: u32, message: &str) -> Result<(), TestError> {
        self.send(RpcMessage::err(id, message)).await
    }

    pub async fn request(&self, id: u32, method: &str, args: Vec<Value>) -> Result<(), TestError> {
        self.send(RpcMessage::Request {
            id,
            method: method.to_owned(),
            args,
        })
        .await
    }

    pub async fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), TestError> {
        self.send(RpcMessage::Notification {
            method: method.to_owned(),
            args,
        })
        .await
    }

    /// Issue a request and wait for its response, skipping nothing: the
    /// next message must be that response.
    ///
    /// The session routes messages in wire order, so once this returns,
    /// everything sent before it has been routed.
    pub async fn round_trip(
        &mut self,
        id: u32,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Result<Value, String>, TestError> {
        self.request(id, method, args).await?;
        let (got, error, result) = self.expect_response().await?;
        if got != id {
            return Err(TestError::Assertion(format!(
                "expected response {id}, got response {got}"
            )));
        }
        Ok(match error {
            Some(message) => Err(message),
            None => Ok(result),
        })
    }

    /// Close the peer's end; the session sees end of stream.
    pub async fn close(&self) {
        self.transport.shutdown().await;
    }
}
