// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle events broadcast to subscribers.

use crate::pipeline::PipelineId;
use crate::run::RunId;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

crate::define_id! {
    /// Opaque identifier for an event subscriber.
    pub struct SubscriberId;
}

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "pipeline.created")]
    PipelineCreated,
    #[serde(rename = "pipeline.deleted")]
    PipelineDeleted,
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.retried")]
    StepRetried,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.skipped")]
    StepSkipped,
    #[serde(rename = "step.progress")]
    StepProgress,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PipelineCreated => "pipeline.created",
            EventKind::PipelineDeleted => "pipeline.deleted",
            EventKind::RunStarted => "run.started",
            EventKind::RunCompleted => "run.completed",
            EventKind::RunCancelled => "run.cancelled",
            EventKind::StepStarted => "step.started",
            EventKind::StepRetried => "step.retried",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepSkipped => "step.skipped",
            EventKind::StepProgress => "step.progress",
        }
    }
}

/// An immutable lifecycle event record.
///
/// Serializes to the interchange shape
/// `{type, timestamp, pipelineId, runId?, stepId?, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub pipeline_id: PipelineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(kind: EventKind, timestamp: u64, pipeline_id: PipelineId) -> Self {
        Self {
            kind,
            timestamp,
            pipeline_id,
            run_id: None,
            step_id: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// One-line rendering for trace logs.
    pub fn log_summary(&self) -> String {
        let mut out = format!("{} pipeline={}", self.kind.as_str(), self.pipeline_id);
        if let Some(run_id) = &self.run_id {
            let _ = write!(out, " run={run_id}");
        }
        if let Some(step_id) = &self.step_id {
            let _ = write!(out, " step={step_id}");
        }
        if let Some(status) = self.data.get("status").and_then(|v| v.as_str()) {
            let _ = write!(out, " status={status}");
        }
        out
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
