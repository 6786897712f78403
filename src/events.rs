//! In-process publish/subscribe event bus.
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────┐  deliver  ┌──────────────┐
//! │ SensorMgr    │──────────▶│              │─────────▶│ SystemMonitor│
//! │ CommandHdlr  │──────────▶│   EventBus   │─────────▶│ ActuatorMgr  │
//! │ Nozzle task  │──────────▶│ topic → [h]  │─────────▶│ LogSink      │
//! └──────────────┘            └──────────────┘           └──────────────┘
//! ```
//!
//! One bus is constructed at boot and shared as `Arc<EventBus>` with every
//! component that needs it.  Delivery is synchronous on the publishing
//! thread, in registration order, to the handlers registered when the
//! publish started.
//!
//! The registry sits behind a re-entrant lock taken with a bounded wait
//! ([`DEFAULT_LOCK_TIMEOUT`]).  It stays held for the whole delivery so a
//! topic's deliveries never interleave; handlers running on the delivering
//! thread may publish or subscribe again.  If the lock is not acquired in
//! time the operation is dropped and logged, never queued.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{error, warn};
use parking_lot::ReentrantMutex;

use crate::app::events::{Event, Payload, topics};
use crate::error::BusError;

/// Bounded wait for the registry lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// A subscriber callback.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<Subscription>>,
    next_id: u64,
}

pub struct EventBus {
    registry: ReentrantMutex<RefCell<Registry>>,
    lock_timeout: Duration,
    published: AtomicU64,
    dropped: AtomicU64,
    handler_panics: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            registry: ReentrantMutex::new(RefCell::new(Registry::default())),
            lock_timeout,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
        }
    }

    // ── Subscription ──────────────────────────────────────────

    /// Register `handler` for events whose topic equals `topic`.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, BusError> {
        if !topics::is_valid(topic) {
            return Err(BusError::InvalidTopic(topic.to_owned()));
        }
        let Some(guard) = self.registry.try_lock_for(self.lock_timeout) else {
            return Err(self.timed_out("subscribe", topic));
        };
        let mut registry = guard.borrow_mut();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .topics
            .entry(topic.to_owned())
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        Ok(id)
    }

    /// Remove a subscription.  Returns `false` if the handle was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, BusError> {
        let Some(guard) = self.registry.try_lock_for(self.lock_timeout) else {
            return Err(self.timed_out("unsubscribe", "*"));
        };
        let mut registry = guard.borrow_mut();
        let mut emptied = None;
        let mut found = false;
        for (topic, subs) in &mut registry.topics {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                found = true;
                if subs.is_empty() {
                    emptied = Some(topic.clone());
                }
                break;
            }
        }
        if let Some(topic) = emptied {
            registry.topics.remove(&topic);
        }
        Ok(found)
    }

    // ── Publication ───────────────────────────────────────────

    /// Deliver `event` to every current subscriber of its topic.
    ///
    /// Returns the number of handlers invoked (including ones that
    /// panicked).  A lock timeout or malformed topic drops the event.
    pub fn try_publish(&self, event: Event) -> Result<usize, BusError> {
        if !topics::is_valid(event.topic()) {
            return Err(BusError::InvalidTopic(event.topic().to_owned()));
        }
        let Some(guard) = self.registry.try_lock_for(self.lock_timeout) else {
            return Err(self.timed_out("publish", event.topic()));
        };

        // Snapshot so handlers may (un)subscribe without touching this delivery.
        let handlers: Vec<Handler> = guard
            .borrow()
            .topics
            .get(event.topic())
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                self.handler_panics.fetch_add(1, Ordering::Relaxed);
                error!(
                    "EventBus: handler for '{}' panicked: {}",
                    event.topic(),
                    panic_message(panic.as_ref())
                );
            }
        }
        drop(guard);

        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(handlers.len())
    }

    /// Like [`try_publish`](Self::try_publish), logging instead of returning
    /// the error.  Returns the number of handlers invoked (0 when dropped).
    pub fn publish(&self, event: Event) -> usize {
        match self.try_publish(event) {
            Ok(delivered) => delivered,
            Err(e @ BusError::InvalidTopic(_)) => {
                warn!("EventBus: dropped event: {e}");
                0
            }
            // Already logged and counted.
            Err(BusError::LockTimeout { .. }) => 0,
        }
    }

    /// Build an event stamped now and publish it.
    pub fn publish_new(&self, topic: &str, source: &str, payload: Payload) -> usize {
        self.publish(Event::new(topic, source, payload))
    }

    // ── Diagnostics ───────────────────────────────────────────

    /// Number of handlers currently registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .try_lock_for(self.lock_timeout)
            .map_or(0, |guard| guard.borrow().topics.get(topic).map_or(0, Vec::len))
    }

    /// Number of distinct topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.registry
            .try_lock_for(self.lock_timeout)
            .map_or(0, |guard| guard.borrow().topics.len())
    }

    /// Events delivered (including ones nobody was subscribed to).
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publish/subscribe operations dropped on lock timeout.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn handler_panic_count(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }

    fn timed_out(&self, op: &str, topic: &str) -> BusError {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            "EventBus: {op} on '{topic}' dropped, lock not acquired within {}ms",
            self.lock_timeout.as_millis()
        );
        BusError::LockTimeout {
            topic: topic.to_owned(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
