// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The plugin contract.
//!
//! Plugins are the only way the engine does work: each advertises a set of
//! step types through its manifest and exposes a single `execute`
//! operation. The engine knows nothing about what a step does.

use crate::bus::EventBus;
use crate::cancel::CancelSignal;
use cv_core::{Event, EventKind, PipelineId, RunId, Step};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Named outputs a plugin populates for a step.
pub type StepOutputs = serde_json::Map<String, serde_json::Value>;

/// Static description a plugin provides at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    /// Step types this plugin claims in the registry's secondary index.
    pub step_types: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
}

/// Failure reported by a plugin's `execute`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code: Some(exit_code),
        }
    }
}

/// A step handler. Implementations must respect the context's cancellation
/// signal and deadline cooperatively.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> PluginManifest;

    async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<StepOutputs, PluginError>;
}

/// Execution context handed to a plugin for one step attempt.
pub struct StepContext {
    pipeline_id: PipelineId,
    run_id: RunId,
    step_id: String,
    attempt: u32,
    environment: HashMap<String, String>,
    cancel: CancelSignal,
    deadline: Option<Instant>,
    progress: ProgressSink,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pipeline_id: PipelineId,
        run_id: RunId,
        step_id: String,
        attempt: u32,
        environment: HashMap<String, String>,
        cancel: CancelSignal,
        deadline: Option<Instant>,
        progress: ProgressSink,
    ) -> Self {
        Self {
            pipeline_id,
            run_id,
            step_id,
            attempt,
            environment,
            cancel,
            deadline,
            progress,
        }
    }

    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// 1-based attempt number for this invocation.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resolved environment: pipeline entries overlaid with step entries.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    pub fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Absolute deadline for this attempt, when the step has a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Emit a `step.progress` event visible to run subscribers.
    pub fn progress(&self, message: &str) {
        self.progress.emit(message);
    }
}

/// Emits `step.progress` events on behalf of a plugin.
#[derive(Clone)]
pub struct ProgressSink {
    bus: EventBus,
    clock: Arc<dyn cv_core::Clock>,
    pipeline_id: PipelineId,
    run_id: RunId,
    step_id: String,
}

impl ProgressSink {
    pub(crate) fn new(
        bus: EventBus,
        clock: Arc<dyn cv_core::Clock>,
        pipeline_id: PipelineId,
        run_id: RunId,
        step_id: String,
    ) -> Self {
        Self {
            bus,
            clock,
            pipeline_id,
            run_id,
            step_id,
        }
    }

    fn emit(&self, message: &str) {
        self.bus.emit(
            Event::new(
                EventKind::StepProgress,
                self.clock.epoch_ms(),
                self.pipeline_id.clone(),
            )
            .with_run(self.run_id.clone())
            .with_step(self.step_id.clone())
            .with_data("message", message),
        );
    }
}
