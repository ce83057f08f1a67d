// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for behavioral specs

use async_trait::async_trait;
use cv_core::{Event, EventKind, Pipeline, PipelineId, Run, RunId, Step, SubscriberId};
use cv_engine::{
    Engine, EngineConfig, Plugin, PluginError, PluginManifest, StepContext, StepOutputs,
    Subscription,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine with an explicit worker-pool size.
pub fn engine_with_pool(worker_pool_size: usize) -> Engine {
    Engine::new(EngineConfig {
        worker_pool_size,
        ..EngineConfig::default()
    })
}

pub fn pipeline(json: serde_json::Value) -> Pipeline {
    serde_json::from_value(json).expect("spec pipeline json must parse")
}

/// Plugin for step type `sleep`: sleeps `sleepMs` from the step config
/// (default 50), then succeeds.
pub struct SleepPlugin;

#[async_trait]
impl Plugin for SleepPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: "sleep".to_string(),
            version: "1.0.0".to_string(),
            step_types: vec!["sleep".to_string()],
            description: "sleeps then succeeds".to_string(),
            author: String::new(),
        }
    }

    async fn execute(&self, _ctx: &StepContext, step: &Step) -> Result<StepOutputs, PluginError> {
        let ms = step
            .config
            .get("sleepMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(50);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let mut out = StepOutputs::new();
        out.insert("sleptMs".to_string(), serde_json::json!(ms));
        Ok(out)
    }
}

/// Plugin for step type `flaky`: fails while the shared counter is
/// positive, then succeeds.
pub struct FlakyPlugin {
    pub remaining: Arc<AtomicU32>,
}

#[async_trait]
impl Plugin for FlakyPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: "flaky".to_string(),
            version: "1.0.0".to_string(),
            step_types: vec!["flaky".to_string()],
            description: String::new(),
            author: String::new(),
        }
    }

    async fn execute(&self, _ctx: &StepContext, _step: &Step) -> Result<StepOutputs, PluginError> {
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(PluginError::with_exit_code("transient failure", 1))
        } else {
            Ok(StepOutputs::new())
        }
    }
}

/// Plugin for step type `counted`: bumps the shared counter, sleeps, then
/// succeeds. Used to observe how many real executions happened.
pub struct CountingPlugin {
    pub counter: Arc<AtomicU32>,
    pub sleep_ms: u64,
}

#[async_trait]
impl Plugin for CountingPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: "counted".to_string(),
            version: "1.0.0".to_string(),
            step_types: vec!["counted".to_string()],
            description: String::new(),
            author: String::new(),
        }
    }

    async fn execute(&self, _ctx: &StepContext, _step: &Step) -> Result<StepOutputs, PluginError> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        let mut out = StepOutputs::new();
        out.insert("built".to_string(), serde_json::json!(true));
        Ok(out)
    }
}

/// Subscribe under a unique-ish id sized generously for spec runs.
pub fn subscribe(engine: &Engine, id: &str) -> Subscription {
    engine
        .subscribe(SubscriberId::new(id), Some(1024))
        .expect("fresh subscriber id")
}

/// Collect events for one run until its terminal event arrives.
pub async fn collect_run_events(sub: &mut Subscription, run_id: &RunId) -> Vec<Event> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, sub.recv())
            .await
            .expect("run events should arrive before the deadline")
            .expect("subscription should stay open");
        if event.run_id.as_ref() != Some(run_id) {
            continue;
        }
        let terminal = matches!(
            event.kind,
            EventKind::RunCompleted | EventKind::RunCancelled
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Project events to `(kind, step_id)` pairs for order assertions.
pub fn shape(events: &[Event]) -> Vec<(EventKind, Option<String>)> {
    events.iter().map(|e| (e.kind, e.step_id.clone())).collect()
}

/// Poll a run until it reaches a terminal status.
pub async fn wait_terminal(engine: &Engine, pipeline_id: &PipelineId, run_id: &RunId) -> Run {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = engine
            .get_run(pipeline_id, run_id)
            .expect("run should exist");
        if run.is_terminal() {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
