// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-run cooperative cancellation.
//!
//! A run owns one [`CancelHandle`]; every task and plugin context holds a
//! [`CancelSignal`] clone. Cancellation is level-triggered and idempotent:
//! once flipped it stays flipped.

use tokio::sync::watch;

/// Create a connected cancel handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Requests cancellation. Held by the engine per run.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Flip the signal. Safe to call repeatedly.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes cancellation. Cheap to clone into tasks and plugin contexts.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. If the handle is dropped
    /// without cancelling, this pends forever (the run is completing anyway).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a cancel; park until the task is dropped.
                std::future::pending::<()>().await;
            }
        }
    }

}

#[cfg(test)]
#[path = "cancel_tests.rs"]
mod tests;
