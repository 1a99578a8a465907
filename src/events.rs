// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-memory publish/subscribe bus for resource change events.
//!
//! Publishers never block: each subscriber owns a bounded queue, and a full
//! queue drops the event while a per-subscriber counter records the loss.
//! The bus deliberately trades delivery completeness for liveness — a slow
//! SSE consumer can never stall a store mutation.
//!
//! Filters are evaluated on the dispatcher side, so events a subscriber does
//! not care about can never fill its queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics;
use crate::model::Resource;

/// The four resource change classes emitted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Created,
    Modified,
    Deleted,
    Reconciled,
}

impl EventType {
    /// Stable uppercase name, used for SSE framing and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Reconciled => "RECONCILED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub resource_id: i64,
    pub resource_name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    /// Snapshot of the resource document at publish time
    pub resource_data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event carrying a snapshot of `resource`.
    #[must_use]
    pub fn for_resource(event_type: EventType, resource: &Resource) -> Self {
        Self {
            event_type,
            resource_id: resource.id,
            resource_name: resource.name.clone(),
            resource_type_name: resource.resource_type_name.clone(),
            resource_type_version: resource.resource_type_version.clone(),
            resource_data: serde_json::to_value(resource).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }
}

/// Dispatcher-side subscription filter.
///
/// An unset field matches everything; set fields must all match.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub resource_id: Option<i64>,
    pub resource_type_name: Option<String>,
}

impl EventFilter {
    /// Match every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match events for one resource type.
    #[must_use]
    pub fn for_type(name: impl Into<String>) -> Self {
        Self {
            resource_type_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Match events for one resource id.
    #[must_use]
    pub fn for_resource(id: i64) -> Self {
        Self {
            resource_id: Some(id),
            ..Self::default()
        }
    }

    /// True when `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if self.resource_id.is_some_and(|id| id != event.resource_id) {
            return false;
        }
        if self
            .resource_type_name
            .as_ref()
            .is_some_and(|name| name != &event.resource_type_name)
        {
            return false;
        }
        true
    }
}

/// A live subscription handed to a consumer.
///
/// Dropping the receiver (or calling [`EventBus::unsubscribe`]) detaches the
/// queue; the dispatcher prunes closed queues on the next publish.
pub struct Subscription {
    /// Identifier for [`EventBus::unsubscribe`]
    pub id: u64,
    /// Bounded event stream
    pub receiver: mpsc::Receiver<Event>,
    /// Events lost to queue overflow for this subscriber
    pub dropped: Arc<AtomicU64>,
}

struct SubscriberHandle {
    tx: mpsc::Sender<Event>,
    filter: EventFilter,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    next_id: u64,
    subscribers: HashMap<u64, SubscriberHandle>,
}

/// Process-wide event bus; created at startup, drained at shutdown.
pub struct EventBus {
    capacity: usize,
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Create a bus whose subscriber queues hold up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Fan an event out to every matching subscriber without blocking.
    ///
    /// A full subscriber queue drops the event and bumps that subscriber's
    /// `dropped` counter. Closed subscribers are pruned.
    pub fn publish(&self, event: &Event) {
        metrics::record_event_published(event.event_type.as_str());

        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let mut closed: Vec<u64> = Vec::new();

        for (id, sub) in &inner.subscribers {
            if !sub.filter.matches(event) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_event_dropped(event.event_type.as_str());
                    debug!(
                        subscriber = id,
                        event_type = %event.event_type,
                        resource = %event.resource_name,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            inner.subscribers.remove(&id);
        }
    }

    /// Register a subscriber with a dispatcher-side filter.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            SubscriberHandle {
                tx,
                filter,
                dropped: Arc::clone(&dropped),
            },
        );

        debug!(subscriber = id, "Subscriber registered");
        Subscription {
            id,
            receiver: rx,
            dropped,
        }
    }

    /// Remove a subscriber; its stream ends after the queue drains.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "Subscriber removed");
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .subscribers
            .len()
    }

    /// Drop every subscriber queue so streams observe end-of-stream.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        debug!(subscribers = count, "Event bus shut down");
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod events_tests;
