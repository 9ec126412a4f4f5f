//! mprpc-core: a bidirectional MessagePack-RPC client session.
//!
//! This crate defines:
//! - The wire message model ([`RpcMessage`], [`MessageKind`])
//! - Streaming codec ([`encode_message`], [`MessageDecoder`])
//! - Transports ([`Transport`]): in-memory pairs and byte streams
//!   (Unix sockets, TCP, duplex pipes)
//! - The session engine ([`RpcSession`]): concurrent outgoing calls,
//!   notification and request dispatch, channel-id bootstrap, detach
//! - Errors ([`RpcError`], [`ErrorCode`]) and configuration ([`SessionConfig`])

#![forbid(unsafe_code)]

mod client_info;
mod codec;
mod config;
mod dispatch;
mod error;
mod handlers;
mod message;
mod session;
mod transport;

pub use client_info::*;
pub use codec::*;
pub use config::*;
pub use error::*;
pub use handlers::{
    BoxFuture, HandlerId, HandlerOutcome, NotificationHandler, RequestHandler,
};
pub use message::*;
pub use session::*;
pub use transport::*;

// Re-export the value type so callers need not depend on rmpv directly
pub use rmpv;
pub use rmpv::Value;
