// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run identifier and state machine.
//!
//! A [`Run`] is one execution instance of a pipeline. Both runs and their
//! per-step records move `pending → running → terminal`; terminal states
//! never transition again, and `ended_at_ms` is set exactly when a
//! terminal state is entered.

use crate::pipeline::{Pipeline, PipelineId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

crate::define_id! {
    /// Unique identifier for a run instance.
    #[derive(Default)]
    pub struct RunId;
}

/// Metadata key linking a retried run to its original.
pub const META_RETRY_OF: &str = "retryOf";

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Status of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Whether this terminal status satisfies a downstream `dependsOn`.
    /// Skipped counts as satisfied, the same as success.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-run record for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why a skipped step was skipped (`condition`, `upstream_failed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepState {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StepStatus::Pending,
            started_at_ms: None,
            ended_at_ms: None,
            attempts: 0,
            exit_code: None,
            outputs: serde_json::Map::new(),
            error: None,
            reason: None,
        }
    }

    /// Mark the step running for the given attempt. First attempt records
    /// `started_at_ms`; later attempts only bump the counter.
    pub fn start_attempt(&mut self, attempt: u32, at_ms: u64) {
        self.status = StepStatus::Running;
        self.attempts = attempt;
        if self.started_at_ms.is_none() {
            self.started_at_ms = Some(at_ms);
        }
    }

    /// Transition to a terminal status. Returns false (and leaves the record
    /// untouched) if the step is already terminal.
    pub fn finish(&mut self, status: StepStatus, at_ms: u64) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_at_ms = Some(at_ms);
        true
    }
}

/// Severity of a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A timestamped log line captured on the run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub ts_ms: u64,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

/// A single execution instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    pub status: RunStatus,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    /// Per-step records keyed by step id, seeded from the definition.
    pub steps: HashMap<String, StepState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Run {
    /// Create a pending run with a record for every step in the definition.
    pub fn new(id: RunId, pipeline: &Pipeline, created_at_ms: u64) -> Self {
        let steps = pipeline
            .stages
            .iter()
            .flat_map(|stage| &stage.steps)
            .map(|step| {
                let name = if step.name.is_empty() {
                    step.id.clone()
                } else {
                    step.name.clone()
                };
                (step.id.clone(), StepState::new(step.id.clone(), name))
            })
            .collect();
        Self {
            id,
            pipeline_id: pipeline.id.clone(),
            status: RunStatus::Pending,
            created_at_ms,
            started_at_ms: None,
            ended_at_ms: None,
            steps,
            logs: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The run id this run retries, if any.
    pub fn retry_of(&self) -> Option<RunId> {
        self.metadata
            .get(META_RETRY_OF)
            .and_then(|v| v.as_str())
            .map(RunId::new)
    }

    /// Mark the run running. No-op unless currently pending.
    pub fn mark_running(&mut self, at_ms: u64) -> bool {
        if self.status != RunStatus::Pending {
            return false;
        }
        self.status = RunStatus::Running;
        self.started_at_ms = Some(at_ms);
        true
    }

    /// Transition to a terminal status. Returns false if already terminal,
    /// so the terminal transition happens exactly once.
    pub fn finish(&mut self, status: RunStatus, at_ms: u64) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        if self.started_at_ms.is_none() {
            self.started_at_ms = Some(at_ms);
        }
        self.ended_at_ms = Some(at_ms);
        true
    }

    /// Append a log entry.
    pub fn log(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        step_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.logs.push(LogEntry {
            ts_ms,
            level,
            step_id: step_id.map(str::to_string),
            message: message.into(),
        });
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
