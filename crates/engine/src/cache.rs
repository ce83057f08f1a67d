// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Content-addressed memoization of step outputs.
//!
//! For any fingerprint at most one execution is in flight: the first caller
//! becomes the *leader* and runs the step; concurrent callers become
//! *followers* and wait on the leader's result. Failures are never cached:
//! the slot is cleared and the next caller leads a fresh attempt.

use crate::plugin::StepOutputs;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Result of a cache lookup.
pub enum Lookup {
    /// Completed outputs were found.
    Hit(StepOutputs),
    /// No entry and no flight: the caller must execute and finalize.
    Leader(FlightToken),
    /// Another caller is executing; wait for its result.
    Follower(FlightWait),
}

#[derive(Clone)]
enum FlightState {
    Pending,
    Done(StepOutputs),
    Failed(String),
}

struct CacheEntry {
    outputs: StepOutputs,
    completed_at_ms: u64,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    flights: HashMap<String, watch::Sender<FlightState>>,
    tick: u64,
}

struct CacheInner {
    state: Mutex<CacheState>,
    capacity: Option<usize>,
}

/// Fingerprint-keyed memo of step outputs with single-flight dispatch.
/// Cheap to clone.
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<CacheInner>,
}

impl ArtifactCache {
    /// `capacity` bounds completed entries (LRU eviction); `None` is
    /// unbounded. In-flight slots are never evicted.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                capacity,
            }),
        }
    }

    /// Resolve a fingerprint to a hit, or claim/join the in-flight slot.
    pub fn lookup_or_start(&self, fingerprint: &str) -> Lookup {
        let mut state = self.inner.state.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some(entry) = state.entries.get_mut(fingerprint) {
            entry.last_used = tick;
            return Lookup::Hit(entry.outputs.clone());
        }
        if let Some(tx) = state.flights.get(fingerprint) {
            return Lookup::Follower(FlightWait { rx: tx.subscribe() });
        }
        let (tx, _rx) = watch::channel(FlightState::Pending);
        state.flights.insert(fingerprint.to_string(), tx);
        Lookup::Leader(FlightToken {
            fingerprint: fingerprint.to_string(),
            inner: Arc::clone(&self.inner),
            finalized: false,
        })
    }

    /// Completed outputs for a fingerprint without joining any flight.
    /// Used by read-only cache policies.
    pub fn get(&self, fingerprint: &str) -> Option<StepOutputs> {
        let mut state = self.inner.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(fingerprint)?;
        entry.last_used = tick;
        Some(entry.outputs.clone())
    }

    /// Leader success: record the entry and wake followers with the outputs.
    pub fn publish(&self, mut token: FlightToken, outputs: StepOutputs, completed_at_ms: u64) {
        token.finalized = true;
        let tx = {
            let mut state = self.inner.state.lock();
            state.tick += 1;
            let tick = state.tick;
            state.entries.insert(
                token.fingerprint.clone(),
                CacheEntry {
                    outputs: outputs.clone(),
                    completed_at_ms,
                    last_used: tick,
                },
            );
            if let Some(capacity) = self.inner.capacity {
                evict_over(&mut state, capacity);
            }
            state.flights.remove(&token.fingerprint)
        };
        if let Some(tx) = tx {
            let _ = tx.send(FlightState::Done(outputs));
        }
    }

    /// Leader failure: clear the slot (no negative caching) and wake
    /// followers with the error so they can re-enter as leaders.
    pub fn fail(&self, mut token: FlightToken, error: &str) {
        token.finalized = true;
        self.inner.abort_flight(&token.fingerprint, error);
    }

    /// Drop a completed entry. In-flight slots are untouched.
    pub fn invalidate(&self, fingerprint: &str) {
        self.inner.state.lock().entries.remove(fingerprint);
    }

    /// Drop all completed entries.
    pub fn clear(&self) {
        self.inner.state.lock().entries.clear();
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completion timestamp of a cached entry.
    pub fn completed_at_ms(&self, fingerprint: &str) -> Option<u64> {
        self.inner
            .state
            .lock()
            .entries
            .get(fingerprint)
            .map(|e| e.completed_at_ms)
    }
}

impl CacheInner {
    fn abort_flight(&self, fingerprint: &str, error: &str) {
        let tx = self.state.lock().flights.remove(fingerprint);
        if let Some(tx) = tx {
            let _ = tx.send(FlightState::Failed(error.to_string()));
        }
    }
}

fn evict_over(state: &mut CacheState, capacity: usize) {
    while state.entries.len() > capacity.max(1) {
        let Some(oldest) = state
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
        else {
            break;
        };
        state.entries.remove(&oldest);
    }
}

/// Proof that the holder is the single executor for a fingerprint. Must be
/// finalized through `publish` or `fail`; dropping it unfinalized (a
/// cancelled or panicked leader) behaves as a failure so followers are
/// never stranded.
pub struct FlightToken {
    fingerprint: String,
    inner: Arc<CacheInner>,
    finalized: bool,
}

impl FlightToken {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Drop for FlightToken {
    fn drop(&mut self) {
        if !self.finalized {
            self.inner
                .abort_flight(&self.fingerprint, "cache leader abandoned the flight");
        }
    }
}

/// A follower's handle on the leader's eventual result.
pub struct FlightWait {
    rx: watch::Receiver<FlightState>,
}

impl FlightWait {
    /// Wait for the leader. `Ok` carries the published outputs; `Err`
    /// carries the leader's failure, after which the caller should re-enter
    /// `lookup_or_start`.
    pub async fn wait(mut self) -> Result<StepOutputs, String> {
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state {
                FlightState::Pending => {}
                FlightState::Done(outputs) => return Ok(outputs),
                FlightState::Failed(error) => return Err(error),
            }
            if self.rx.changed().await.is_err() {
                return Err("cache flight closed without a result".to_string());
            }
        }
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
