// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory registry of pipeline definitions and runs.
//!
//! Shared-read/exclusive-write maps. Reads hand out snapshots; run records
//! are mutated only through the supervisor driving that run. Locks are
//! never held across `.await`.

use crate::error::EngineError;
use cv_core::{Pipeline, PipelineId, Run, RunId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct StoreInner {
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
    runs: RwLock<HashMap<RunId, Run>>,
}

/// Process-local store of pipelines and runs. Cheap to clone.
#[derive(Clone, Default)]
pub struct PipelineStore {
    inner: Arc<StoreInner>,
}

impl PipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pipeline(&self, pipeline: Pipeline) -> Result<(), EngineError> {
        let mut pipelines = self.inner.pipelines.write();
        if pipelines.contains_key(&pipeline.id) {
            return Err(EngineError::DuplicatePipeline(pipeline.id.clone()));
        }
        pipelines.insert(pipeline.id.clone(), pipeline);
        Ok(())
    }

    pub fn pipeline(&self, id: &PipelineId) -> Result<Pipeline, EngineError> {
        self.inner
            .pipelines
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::PipelineNotFound(id.clone()))
    }

    pub fn contains_pipeline(&self, id: &PipelineId) -> bool {
        self.inner.pipelines.read().contains_key(id)
    }

    /// Snapshot of all pipelines, order unspecified.
    pub fn list_pipelines(&self) -> Vec<Pipeline> {
        self.inner.pipelines.read().values().cloned().collect()
    }

    /// Remove a pipeline. Rejected while any of its runs is non-terminal.
    pub fn remove_pipeline(&self, id: &PipelineId) -> Result<Pipeline, EngineError> {
        let mut pipelines = self.inner.pipelines.write();
        if !pipelines.contains_key(id) {
            return Err(EngineError::PipelineNotFound(id.clone()));
        }
        let runs = self.inner.runs.read();
        if runs
            .values()
            .any(|r| &r.pipeline_id == id && !r.is_terminal())
        {
            return Err(EngineError::PipelineInUse(id.clone()));
        }
        drop(runs);
        pipelines
            .remove(id)
            .ok_or_else(|| EngineError::PipelineNotFound(id.clone()))
    }

    pub fn insert_run(&self, run: Run) {
        self.inner.runs.write().insert(run.id.clone(), run);
    }

    pub fn run(&self, id: &RunId) -> Result<Run, EngineError> {
        self.inner
            .runs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound(id.clone()))
    }

    /// Snapshot of runs for one pipeline, order unspecified.
    pub fn runs_for(&self, pipeline_id: &PipelineId) -> Vec<Run> {
        self.inner
            .runs
            .read()
            .values()
            .filter(|r| &r.pipeline_id == pipeline_id)
            .cloned()
            .collect()
    }

    /// Apply a mutation to a run record under the write lock. Returns false
    /// when the run is unknown. Only the run's supervisor calls this.
    pub fn update_run(&self, id: &RunId, mutate: impl FnOnce(&mut Run)) -> bool {
        let mut runs = self.inner.runs.write();
        match runs.get_mut(id) {
            Some(run) => {
                mutate(run);
                true
            }
            None => false,
        }
    }

    /// Terminal status of the most recently ended run for a pipeline.
    pub fn latest_terminal_status(&self, pipeline_id: &PipelineId) -> Option<String> {
        self.inner
            .runs
            .read()
            .values()
            .filter(|r| &r.pipeline_id == pipeline_id && r.is_terminal())
            .max_by_key(|r| r.ended_at_ms.unwrap_or(0))
            .map(|r| r.status.to_string())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
