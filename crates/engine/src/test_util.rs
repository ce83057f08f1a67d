// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared stubs and helpers for engine tests

use crate::engine::{Engine, EngineConfig};
use crate::plugin::{Plugin, PluginError, PluginManifest, StepContext, StepOutputs};
use cv_core::{PipelineId, Run, RunId, SequentialIdGen, Step, SystemClock};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted plugin behavior for tests.
pub(crate) enum Behavior {
    /// Succeed after an optional delay.
    Succeed { delay: Duration },
    /// Fail while the counter is positive, then succeed.
    FailTimes { remaining: Arc<AtomicU32> },
    AlwaysFail,
    /// Sleep far longer than any test timeout; a cancellation target.
    Hang,
    /// Count invocations, then succeed after the delay.
    Count {
        counter: Arc<AtomicU32>,
        delay: Duration,
    },
}

pub(crate) struct StubPlugin {
    pub name: String,
    pub step_types: Vec<String>,
    pub behavior: Behavior,
}

impl StubPlugin {
    pub(crate) fn new(
        name: &str,
        step_types: &[&str],
        behavior: Behavior,
    ) -> Arc<dyn Plugin> {
        Arc::new(Self {
            name: name.to_string(),
            step_types: step_types.iter().map(|s| s.to_string()).collect(),
            behavior,
        })
    }
}

#[async_trait]
impl Plugin for StubPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: self.name.clone(),
            version: "0.0.0".to_string(),
            step_types: self.step_types.clone(),
            description: String::new(),
            author: String::new(),
        }
    }

    async fn execute(&self, _ctx: &StepContext, step: &Step) -> Result<StepOutputs, PluginError> {
        match &self.behavior {
            Behavior::Succeed { delay } => {
                tokio::time::sleep(*delay).await;
                Ok(outputs_for(step))
            }
            Behavior::FailTimes { remaining } => {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Err(PluginError::with_exit_code("induced failure", 1))
                } else {
                    Ok(outputs_for(step))
                }
            }
            Behavior::AlwaysFail => Err(PluginError::with_exit_code("always fails", 1)),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(outputs_for(step))
            }
            Behavior::Count { counter, delay } => {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(*delay).await;
                Ok(outputs_for(step))
            }
        }
    }
}

fn outputs_for(step: &Step) -> StepOutputs {
    let mut out = StepOutputs::new();
    out.insert("step".to_string(), serde_json::json!(step.id));
    out
}

/// Engine with a small pool and a deterministic run-id sequence.
pub(crate) fn test_engine() -> Engine {
    Engine::with_parts(
        EngineConfig {
            worker_pool_size: 4,
            ..EngineConfig::default()
        },
        Arc::new(SystemClock),
        Arc::new(SequentialIdGen::new("run")),
    )
}

pub(crate) fn pipeline_from(json: serde_json::Value) -> cv_core::Pipeline {
    match serde_json::from_value(json) {
        Ok(p) => p,
        Err(e) => panic!("test pipeline json invalid: {e}"),
    }
}

/// Poll until the run reaches a terminal status.
pub(crate) async fn wait_terminal(engine: &Engine, pipeline_id: &PipelineId, run_id: &RunId) -> Run {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = match engine.get_run(pipeline_id, run_id) {
            Ok(run) => run,
            Err(e) => panic!("run lookup failed: {e}"),
        };
        if run.is_terminal() {
            return run;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("run {run_id} did not reach a terminal status in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
