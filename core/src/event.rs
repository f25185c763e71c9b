// Event bus implementation
//
// Synchronous publish/subscribe hub. Every component of the TTS core talks to
// the others through named events instead of direct calls.
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::util::{gen_id, now_ms};

/// Well-known event names.
pub mod names {
    // Task lifecycle (TTS is only a subscriber)
    pub const TASK_CREATED: &str = "task:created";
    pub const TASK_STARTED: &str = "task:started";
    pub const TASK_PROGRESS: &str = "task:progress";
    pub const TASK_COMPLETED: &str = "task:completed";
    pub const TASK_FAILED: &str = "task:failed";
    pub const TASK_CANCELLED: &str = "task:cancelled";

    // Speech lane / providers
    pub const TTS_QUEUE_ADD: &str = "tts:queue:add";
    pub const TTS_PLAY_START: &str = "tts:play:start";
    pub const TTS_PLAY_END: &str = "tts:play:end";
    pub const TTS_PLAY_ERROR: &str = "tts:play:error";
    pub const TTS_PROVIDER_SWITCH: &str = "tts:provider:switch";
    pub const TTS_CIRCUIT_OPEN: &str = "tts:circuit:open";
    pub const TTS_CIRCUIT_CLOSE: &str = "tts:circuit:close";
    pub const TTS_ALERT: &str = "tts:alert";

    // Inbound dialogue (TTS subscribes to these)
    pub const ASSISTANT_REPLY: &str = "assistant:reply";
    pub const ASSISTANT_DIALOGUE: &str = "assistant:dialogue";
}

/// A named, ephemeral notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub timestamp_ms: i64,
    pub payload: Value,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: u64,
    once: bool,
    handler: Handler,
}

/// Event bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub handler_failures: u64,
    pub active_subscriptions: usize,
}

struct BusInner {
    // Event name -> handlers in registration order
    subscriptions: DashMap<String, Vec<Subscription>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

/// Handle returned by [`EventBus::on`]; call [`Unsubscribe::unsubscribe`] to detach.
///
/// Dropping the handle does not unsubscribe.
pub struct Unsubscribe {
    bus: Weak<BusInner>,
    name: String,
    id: u64,
}

impl Unsubscribe {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => remove_subscription(&inner, &self.name, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

fn remove_subscription(inner: &BusInner, name: &str, id: u64) -> bool {
    let mut removed = false;
    if let Some(mut subs) = inner.subscriptions.get_mut(name) {
        let before = subs.len();
        subs.retain(|s| s.id != id);
        removed = subs.len() != before;
    }
    inner
        .subscriptions
        .remove_if(name, |_, subs| subs.is_empty());
    removed
}

/// Cheaply cloneable publish/subscribe hub.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: DashMap::new(),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe `handler` to `name`.
    pub fn on<F>(&self, name: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(name, Arc::new(handler), false)
    }

    /// Subscribe `handler` for the next emission of `name` only.
    pub fn once<F>(&self, name: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(name, Arc::new(handler), true)
    }

    /// Detach a subscription by id. Returns whether anything was removed.
    pub fn off(&self, name: &str, subscription_id: u64) -> bool {
        remove_subscription(&self.inner, name, subscription_id)
    }

    /// Forward every emission of `name` into an unbounded channel.
    pub fn subscribe_channel(&self, name: &str) -> (Unsubscribe, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.on(name, move |event| {
            let _ = tx.send(event.clone());
        });
        (handle, rx)
    }

    fn add(&self, name: &str, handler: Handler, once: bool) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .entry(name.to_string())
            .or_default()
            .push(Subscription { id, once, handler });
        trace!(target: "tts.bus", event = name, subscription = id, "Subscribed");
        Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            name: name.to_string(),
            id,
        }
    }

    /// Dispatch `payload` to every current subscriber of `name`, synchronously and
    /// in registration order. A panicking handler is logged and skipped; the
    /// remaining handlers still run. Returns the number of handlers that completed.
    pub fn emit(&self, name: &str, payload: Value) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot handlers and drop `once` subscriptions before dispatch so that
        // handlers may freely (un)subscribe without holding the map lock.
        let handlers: Vec<Subscription> = match self.inner.subscriptions.get_mut(name) {
            Some(mut subs) => {
                let snapshot = subs.clone();
                subs.retain(|s| !s.once);
                snapshot
            }
            None => return 0,
        };
        self.inner
            .subscriptions
            .remove_if(name, |_, subs| subs.is_empty());

        let event = Event {
            id: gen_id(),
            name: name.to_string(),
            timestamp_ms: now_ms(),
            payload,
        };
        debug!(target: "tts.bus", event = name, handlers = handlers.len(), "Emitting event");

        let mut delivered = 0;
        for sub in handlers {
            match catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.inner.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        target: "tts.bus",
                        event = name,
                        subscription = sub.id,
                        "Error in event handler"
                    );
                }
            }
        }
        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Remove all subscribers for `name`, or every subscription when `None`.
    pub fn clear(&self, name: Option<&str>) {
        match name {
            Some(n) => {
                self.inner.subscriptions.remove(n);
            }
            None => self.inner.subscriptions.clear(),
        }
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.inner
            .subscriptions
            .get(name)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_published: self.inner.published.load(Ordering::Relaxed),
            total_delivered: self.inner.delivered.load(Ordering::Relaxed),
            handler_failures: self.inner.failures.load(Ordering::Relaxed),
            active_subscriptions: self
                .inner
                .subscriptions
                .iter()
                .map(|entry| entry.value().len())
                .sum(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
