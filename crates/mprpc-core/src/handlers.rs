//! Notification and request handler registries.
//!
//! Both tables belong to one session. Handlers are stored as `Arc`s so the
//! router can snapshot them and release the lock before invoking anything.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rmpv::Value;

use crate::RpcError;

/// What a notification handler wants done with itself after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerOutcome {
    #[default]
    Keep,
    Remove,
}

impl From<()> for HandlerOutcome {
    fn from(_: ()) -> Self {
        Self::Keep
    }
}

/// Identifies one registered notification handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Type alias for a boxed async notification handler.
pub type NotificationHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<HandlerOutcome> + Send + Sync>;

/// Type alias for a boxed async request handler.
pub type RequestHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<Result<Value, RpcError>> + Send + Sync>;

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    notifications: Mutex<HashMap<String, Vec<(HandlerId, NotificationHandler)>>>,
    requests: Mutex<HashMap<String, RequestHandler>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub(crate) fn add_notification(&self, name: &str, handler: NotificationHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut notifications = self.notifications.lock();
        let handlers = notifications.entry(name.to_owned()).or_default();
        handlers.push((id, handler));
        tracing::debug!(
            name,
            handler_id = id.0,
            count = handlers.len(),
            "notification handler registered"
        );
        id
    }

    pub(crate) fn remove_notification(&self, name: &str, id: HandlerId) -> bool {
        let mut notifications = self.notifications.lock();
        let Some(handlers) = notifications.get_mut(name) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            notifications.remove(name);
        }
        if removed {
            tracing::debug!(name, handler_id = id.0, "notification handler removed");
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn has_notification_handlers(&self, name: &str) -> bool {
        self.notifications.lock().contains_key(name)
    }

    /// Handlers for `name` in registration order.
    pub(crate) fn notification_snapshot(
        &self,
        name: &str,
    ) -> Vec<(HandlerId, NotificationHandler)> {
        self.notifications
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn contains_notification(&self, name: &str, id: HandlerId) -> bool {
        self.notifications
            .lock()
            .get(name)
            .is_some_and(|handlers| handlers.iter().any(|(handler_id, _)| *handler_id == id))
    }

    /// Returns true if an earlier handler was replaced.
    pub(crate) fn set_request(&self, name: &str, handler: RequestHandler) -> bool {
        let replaced = self
            .requests
            .lock()
            .insert(name.to_owned(), handler)
            .is_some();
        tracing::debug!(name, replaced, "request handler registered");
        replaced
    }

    pub(crate) fn remove_request(&self, name: &str) -> bool {
        self.requests.lock().remove(name).is_some()
    }

    pub(crate) fn request_handler(&self, name: &str) -> Option<RequestHandler> {
        self.requests.lock().get(name).cloned()
    }

    pub(crate) fn request_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.requests.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn clear(&self) {
        self.notifications.lock().clear();
        self.requests.lock().clear();
    }
}
