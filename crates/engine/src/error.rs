// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the engine

use cv_core::{PipelineId, RunId, SubscriberId, ValidationError};
use std::time::Duration;
use thiserror::Error;

/// Errors returned from facade operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid pipeline spec: {0}")]
    InvalidSpec(#[from] ValidationError),
    #[error("invalid pipeline spec: step {step} has unknown type {step_type}")]
    UnknownStepType { step: String, step_type: String },
    #[error("pipeline not found: {0}")]
    PipelineNotFound(PipelineId),
    #[error("duplicate pipeline id: {0}")]
    DuplicatePipeline(PipelineId),
    #[error("pipeline {0} has non-terminal runs")]
    PipelineInUse(PipelineId),
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("run {run} does not belong to pipeline {pipeline}")]
    RunMismatch { run: RunId, pipeline: PipelineId },
    #[error("duplicate plugin name: {0}")]
    DuplicatePlugin(String),
    #[error("step type {step_type} already claimed by plugin {plugin}")]
    DuplicateStepType { step_type: String, plugin: String },
    #[error("duplicate subscriber id: {0}")]
    DuplicateSubscriber(SubscriberId),
    #[error("subscriber not found: {0}")]
    SubscriberNotFound(SubscriberId),
}

/// Why a step attempt (or the whole step) failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("no plugin registered for step type {0}")]
    UnknownStepType(String),
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Plugin(String),
    #[error("upstream failure: {0}")]
    UpstreamFailed(String),
}

impl StepError {
    /// Stable kind name carried in events and step records.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::UnknownStepType(_) => "unknown_step_type",
            StepError::Timeout(_) => "timeout",
            StepError::Cancelled => "cancelled",
            StepError::Plugin(_) => "plugin_error",
            StepError::UpstreamFailed(_) => "upstream_failed",
        }
    }

    /// Whether the retry policy applies to this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Timeout(_) | StepError::Plugin(_))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
