//! Per-connection subscription registry.
//!
//! Maps the [`RequestId`] that established a subscription to the callback
//! receiving its `event` payloads. Each subscription owns a delivery task
//! fed by a bounded queue, so the dispatch loop only enqueues and a slow
//! callback never stalls correlation for other requests. When a queue is
//! full the new event is dropped.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};

use crate::domain::RequestId;
use crate::error::ClientError;

/// Default number of events buffered per subscription.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Upper bound applied to every event queue capacity.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

/// Clamps a configured queue capacity into `1..=MAX_QUEUE_CAPACITY`.
#[must_use]
pub const fn clamp_capacity(capacity: usize) -> usize {
    if capacity == 0 {
        1
    } else if capacity > MAX_QUEUE_CAPACITY {
        MAX_QUEUE_CAPACITY
    } else {
        capacity
    }
}

/// Outcome of queueing one event for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The event was queued for the callback.
    Queued,
    /// No subscription is registered for the id.
    Unknown,
    /// The subscriber's queue is full; the event was dropped.
    Full,
    /// The delivery task has stopped (its callback panicked); the event was dropped.
    Stopped,
}

#[derive(Debug)]
struct Subscription {
    // Dropping the sender ends the delivery task once its queue drains.
    events: mpsc::Sender<Value>,
}

#[derive(Debug, Default)]
struct Table {
    closed: bool,
    entries: HashMap<RequestId, Subscription>,
}

/// Registry of live subscriptions for one connection.
///
/// # Concurrency
///
/// - Lookups from the dispatch loop share a read lock.
/// - `subscribe`, `unsubscribe` and `close` take the write lock.
/// - Removal is best-effort: an event already queued for a subscription
///   is still delivered after `unsubscribe`.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    table: RwLock<Table>,
    capacity: usize,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty, open registry with [`DEFAULT_QUEUE_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates an empty, open registry buffering up to `capacity` events
    /// per subscription (clamped into `1..=MAX_QUEUE_CAPACITY`).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            capacity: clamp_capacity(capacity),
        }
    }

    /// Returns the per-subscription queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers `callback` for events carrying `id`.
    ///
    /// The callback runs on a dedicated task, once per event, in arrival
    /// order. Events arriving while [`SubscriptionRegistry::capacity`]
    /// events are already queued are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the registry has been closed, or
    /// [`ClientError::Protocol`] if `id` is already subscribed.
    pub async fn subscribe<F>(&self, id: RequestId, callback: F) -> Result<(), ClientError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut table = self.table.write().await;
        if table.closed {
            return Err(ClientError::Closed);
        }
        if table.entries.contains_key(&id) {
            return Err(ClientError::Protocol(format!("subscription {id} already exists")));
        }

        let (events, mut rx) = mpsc::channel::<Value>(self.capacity);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                callback(payload);
            }
        });
        table.entries.insert(id, Subscription { events });
        tracing::debug!(%id, "subscription registered");
        Ok(())
    }

    /// Removes the subscription for `id`. Returns `false` if none existed.
    ///
    /// Events already queued are still delivered before the delivery task
    /// ends.
    pub async fn unsubscribe(&self, id: RequestId) -> bool {
        let removed = self.table.write().await.entries.remove(&id);
        if removed.is_some() {
            tracing::debug!(%id, "subscription removed");
        }
        removed.is_some()
    }

    /// Queues `payload` for the subscription with `id` without waiting.
    pub async fn dispatch(&self, id: RequestId, payload: Value) -> Delivery {
        let table = self.table.read().await;
        let Some(sub) = table.entries.get(&id) else {
            return Delivery::Unknown;
        };
        match sub.events.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Stopped,
        }
    }

    /// Clears every subscription and refuses new ones.
    ///
    /// Returns how many subscriptions were removed.
    pub async fn close(&self) -> usize {
        let mut table = self.table.write().await;
        table.closed = true;
        let removed = table.entries.len();
        table.entries.clear();
        removed
    }

    /// Returns `true` if a subscription exists for `id`.
    pub async fn contains(&self, id: RequestId) -> bool {
        self.table.read().await.entries.contains_key(&id)
    }

    /// Returns the number of live subscriptions.
    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    /// Returns `true` if there are no live subscriptions.
    pub async fn is_empty(&self) -> bool {
        self.table.read().await.entries.is_empty()
    }
}
