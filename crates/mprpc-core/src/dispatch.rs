//! Handler invocation for incoming notifications and requests.
//!
//! Notifications are queued per name together with the handlers registered
//! when they arrived. One worker per name drains its queue, running every
//! handler for a notification before starting the next. The decoder loop
//! only ever pushes onto an unbounded queue, so a slow handler never stalls
//! reading from the transport.
//!
//! A worker lives as long as its queue has a backlog. The queue map and the
//! worker agree on "empty" under the same lock, so a worker that exits has
//! always removed its own entry and the next notification starts a new one.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use rmpv::Value;
use tokio::sync::mpsc;

use crate::handlers::{
    HandlerId, HandlerOutcome, HandlerRegistry, NotificationHandler, RequestHandler,
};
use crate::{ErrorCode, RpcError};

/// Handlers for one name, in registration order, as seen at arrival.
pub(crate) type HandlerSnapshot = Vec<(HandlerId, NotificationHandler)>;

struct Queued {
    handlers: HandlerSnapshot,
    args: Vec<Value>,
}

struct Worker {
    generation: u64,
    tx: mpsc::UnboundedSender<Queued>,
}

#[derive(Default)]
struct QueueMap {
    next_generation: u64,
    workers: HashMap<String, Worker>,
}

#[derive(Default)]
pub(crate) struct NotificationQueues {
    map: Arc<Mutex<QueueMap>>,
}

impl NotificationQueues {
    /// Queue `args` for the worker serving `name`, starting it if needed.
    pub(crate) fn enqueue(
        &self,
        registry: &Arc<HandlerRegistry>,
        name: String,
        handlers: HandlerSnapshot,
        args: Vec<Value>,
    ) {
        let mut map = self.map.lock();

        let mut queued = Queued { handlers, args };
        if let Some(worker) = map.workers.get(&name) {
            match worker.tx.send(queued) {
                Ok(()) => return,
                Err(mpsc::error::SendError(back)) => queued = back,
            }
        }

        map.next_generation += 1;
        let generation = map.next_generation;
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, so this cannot fail.
        let _ = tx.send(queued);
        map.workers.insert(name.clone(), Worker { generation, tx });
        tracing::debug!(name = %name, generation, "starting notification worker");

        tokio::spawn(run_notification_worker(
            name,
            generation,
            registry.clone(),
            self.map.clone(),
            rx,
        ));
    }

    /// Drop every queue. Workers discard their backlog and exit.
    pub(crate) fn clear(&self) {
        self.map.lock().workers.clear();
    }

    #[cfg(test)]
    fn worker_count(&self) -> usize {
        self.map.lock().workers.len()
    }
}

/// Next item for the worker `(name, generation)`, or `None` once it should
/// exit. An empty queue removes the worker's entry under the map lock.
fn next_queued(
    map: &Mutex<QueueMap>,
    name: &str,
    generation: u64,
    rx: &mut mpsc::UnboundedReceiver<Queued>,
) -> Option<Queued> {
    let mut map = map.lock();
    let current = map
        .workers
        .get(name)
        .is_some_and(|worker| worker.generation == generation);
    if !current {
        return None;
    }

    match rx.try_recv() {
        Ok(queued) => Some(queued),
        Err(_) => {
            map.workers.remove(name);
            None
        }
    }
}

async fn run_notification_worker(
    name: String,
    generation: u64,
    registry: Arc<HandlerRegistry>,
    map: Arc<Mutex<QueueMap>>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
) {
    while let Some(Queued { handlers, args }) = next_queued(&map, &name, generation, &mut rx) {
        for (id, handler) in handlers {
            // Removed since arrival, possibly by an earlier notification.
            if !registry.contains_notification(&name, id) {
                continue;
            }

            let args = args.clone();
            let outcome = AssertUnwindSafe(async move { handler(args).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(HandlerOutcome::Keep) => {}
                Ok(HandlerOutcome::Remove) => {
                    registry.remove_notification(&name, id);
                }
                Err(panic) => {
                    tracing::warn!(
                        name = %name,
                        handler_id = ?id,
                        panic = %panic_message(&*panic),
                        "notification handler panicked"
                    );
                }
            }
        }
    }
    tracing::trace!(name = %name, generation, "notification worker exiting");
}

/// Run a request handler, turning a panic into an error so the request still
/// gets its one response.
pub(crate) async fn invoke_request_handler(
    handler: RequestHandler,
    args: Vec<Value>,
) -> Result<Value, RpcError> {
    match AssertUnwindSafe(async move { handler(args).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(RpcError::status(
            ErrorCode::Internal,
            format!("panic in request handler: {}", panic_message(&*panic)),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
