// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event fan-out to bounded-buffer subscribers.
//!
//! Emission is non-blocking: a full sink drops the event for that sink and
//! bumps its drop counter. A scheduler task is never blocked by a slow
//! subscriber. Per-sink delivery order matches emission order.

use crate::error::EngineError;
use cv_core::{Event, SubscriberId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

struct Sink {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    sinks: RwLock<HashMap<SubscriberId, Sink>>,
    default_capacity: usize,
}

/// Fan-out hub for lifecycle events. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sinks: RwLock::new(HashMap::new()),
                default_capacity: default_capacity.max(1),
            }),
        }
    }

    /// Register a subscriber. Events emitted strictly after registration are
    /// delivered to its sink, FIFO, up to `capacity` buffered.
    pub fn subscribe(
        &self,
        id: SubscriberId,
        capacity: Option<usize>,
    ) -> Result<Subscription, EngineError> {
        let capacity = capacity.unwrap_or(self.inner.default_capacity).max(1);
        let mut sinks = self.inner.sinks.write();
        if sinks.contains_key(&id) {
            return Err(EngineError::DuplicateSubscriber(id));
        }
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        sinks.insert(
            id.clone(),
            Sink {
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        Ok(Subscription { id, rx, dropped })
    }

    /// Remove a subscriber and close its sink. Buffered events stay readable
    /// on the subscription until drained.
    pub fn unsubscribe(&self, id: &SubscriberId) -> Result<(), EngineError> {
        self.inner
            .sinks
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::SubscriberNotFound(id.clone()))
    }

    /// Broadcast an event to all sinks without blocking. Full sinks drop the
    /// event and count it.
    pub fn emit(&self, event: Event) {
        tracing::debug!(event = %event.log_summary(), "emit");
        let sinks = self.inner.sinks.read();
        for sink in sinks.values() {
            match sink.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    sink.dropped.fetch_add(1, Ordering::Relaxed);
                }
                // Receiver side gone; unsubscribe will reap the sink.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Events dropped so far for one subscriber, if registered.
    pub fn dropped_count(&self, id: &SubscriberId) -> Option<u64> {
        self.inner
            .sinks
            .read()
            .get(id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sinks.read().len()
    }
}

/// A subscriber's receiving end.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Events the bus has dropped for this sink because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
