// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The engine facade.
//!
//! Owns the shared components (plugin registry, artifact cache, event
//! bus, pipeline store, worker pool) and exposes the public operations:
//! pipeline CRUD, run lifecycle, and event subscription. Runs execute on
//! detached supervisor tasks; callers observe progress by polling run
//! snapshots or subscribing to events.

use crate::bus::{EventBus, Subscription};
use crate::cache::ArtifactCache;
use crate::cancel::{cancel_pair, CancelHandle};
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::plugin::{Plugin, PluginManifest};
use crate::registry::PluginRegistry;
use crate::scheduler::RunSupervisor;
use crate::store::PipelineStore;
use cv_core::{
    Clock, Event, EventKind, IdGen, Pipeline, PipelineGraph, PipelineId, Run, RunContext, RunId,
    SubscriberId, SystemClock, UuidIdGen,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Environment key the run context reads its branch ref from.
const BRANCH_ENV: &str = "BRANCH";

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on concurrently executing steps across all runs.
    pub worker_pool_size: usize,
    /// Sink capacity for subscribers that do not request one.
    pub default_subscriber_capacity: usize,
    /// Bound on completed cache entries; `None` is unbounded.
    pub cache_capacity: Option<usize>,
    /// Timeout applied to steps that do not declare one.
    pub default_step_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_pool_size(),
            default_subscriber_capacity: 100,
            cache_capacity: None,
            default_step_timeout: None,
        }
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(4)
}

struct EngineInner {
    registry: PluginRegistry,
    cache: ArtifactCache,
    bus: EventBus,
    store: PipelineStore,
    pool: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    id_gen: Arc<dyn IdGen>,
    default_step_timeout: Option<Duration>,
    /// Cancel handles per run, kept for the life of the run registry.
    cancels: Mutex<HashMap<RunId, CancelHandle>>,
}

/// The conveyor engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(UuidIdGen))
    }

    /// Construct with explicit clock and id generator (deterministic tests).
    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        id_gen: Arc<dyn IdGen>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: PluginRegistry::new(),
                cache: ArtifactCache::new(config.cache_capacity),
                bus: EventBus::new(config.default_subscriber_capacity),
                store: PipelineStore::new(),
                pool: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
                clock,
                id_gen,
                default_step_timeout: config.default_step_timeout,
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    // === Plugins ===

    /// Register a plugin and claim its step types. Names are never replaced.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        self.inner.registry.register(plugin)
    }

    pub fn plugin_manifests(&self) -> Vec<PluginManifest> {
        self.inner.registry.manifests()
    }

    // === Pipelines ===

    /// Validate and store a pipeline definition, then emit `pipeline.created`.
    pub fn create_pipeline(&self, mut pipeline: Pipeline) -> Result<(), EngineError> {
        PipelineGraph::build(&pipeline)?;
        for stage in &pipeline.stages {
            for step in &stage.steps {
                let known = match &step.plugin {
                    Some(name) => self.inner.registry.plugin(name).is_some(),
                    None => self.inner.registry.has_step_type(&step.step_type),
                };
                if !known {
                    return Err(EngineError::UnknownStepType {
                        step: step.id.clone(),
                        step_type: step.step_type.clone(),
                    });
                }
            }
        }
        if pipeline.created_at_ms == 0 {
            pipeline.created_at_ms = self.inner.clock.epoch_ms();
        }
        let id = pipeline.id.clone();
        let name = pipeline.name.clone();
        self.inner.store.insert_pipeline(pipeline)?;
        self.inner.bus.emit(
            Event::new(
                EventKind::PipelineCreated,
                self.inner.clock.epoch_ms(),
                id.clone(),
            )
            .with_data("name", name),
        );
        tracing::info!(pipeline = %id.short(12), "pipeline created");
        Ok(())
    }

    pub fn get_pipeline(&self, id: &PipelineId) -> Result<Pipeline, EngineError> {
        self.inner.store.pipeline(id)
    }

    pub fn list_pipelines(&self) -> Vec<Pipeline> {
        self.inner.store.list_pipelines()
    }

    /// Delete a pipeline. Rejected while any of its runs is non-terminal.
    pub fn delete_pipeline(&self, id: &PipelineId) -> Result<(), EngineError> {
        self.inner.store.remove_pipeline(id)?;
        self.inner.bus.emit(Event::new(
            EventKind::PipelineDeleted,
            self.inner.clock.epoch_ms(),
            id.clone(),
        ));
        tracing::info!(pipeline = %id.short(12), "pipeline deleted");
        Ok(())
    }

    // === Runs ===

    /// Start a run. Returns immediately; the run proceeds on a supervisor
    /// task. Must be called from within a tokio runtime.
    pub fn execute_run(&self, pipeline_id: &PipelineId) -> Result<RunId, EngineError> {
        self.spawn_run(pipeline_id, None)
    }

    /// Re-execute a pipeline from scratch, linking the new run to the old
    /// one via `retryOf` metadata. The original run is untouched.
    pub fn retry_run(
        &self,
        pipeline_id: &PipelineId,
        run_id: &RunId,
    ) -> Result<RunId, EngineError> {
        let original = self.inner.store.run(run_id)?;
        if &original.pipeline_id != pipeline_id {
            return Err(EngineError::RunMismatch {
                run: run_id.clone(),
                pipeline: pipeline_id.clone(),
            });
        }
        self.spawn_run(pipeline_id, Some(run_id.clone()))
    }

    pub fn get_run(&self, pipeline_id: &PipelineId, run_id: &RunId) -> Result<Run, EngineError> {
        let run = self.inner.store.run(run_id)?;
        if &run.pipeline_id != pipeline_id {
            return Err(EngineError::RunMismatch {
                run: run_id.clone(),
                pipeline: pipeline_id.clone(),
            });
        }
        Ok(run)
    }

    pub fn list_runs(&self, pipeline_id: &PipelineId) -> Result<Vec<Run>, EngineError> {
        if !self.inner.store.contains_pipeline(pipeline_id) {
            return Err(EngineError::PipelineNotFound(pipeline_id.clone()));
        }
        Ok(self.inner.store.runs_for(pipeline_id))
    }

    /// Request cancellation of a run. Idempotent; in-flight steps observe
    /// the signal cooperatively and pending steps never dispatch.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<(), EngineError> {
        let cancels = self.inner.cancels.lock();
        match cancels.get(run_id) {
            Some(handle) => {
                handle.cancel();
                Ok(())
            }
            None => Err(EngineError::RunNotFound(run_id.clone())),
        }
    }

    fn spawn_run(
        &self,
        pipeline_id: &PipelineId,
        retry_of: Option<RunId>,
    ) -> Result<RunId, EngineError> {
        let pipeline = self.inner.store.pipeline(pipeline_id)?;
        let graph = PipelineGraph::build(&pipeline)?;
        let run_id = RunId::new(self.inner.id_gen.next());

        let mut run = Run::new(run_id.clone(), &pipeline, self.inner.clock.epoch_ms());
        if let Some(original) = &retry_of {
            run.metadata.insert(
                cv_core::run::META_RETRY_OF.to_string(),
                serde_json::json!(original.as_str()),
            );
        }
        self.inner.store.insert_run(run);

        let (handle, signal) = cancel_pair();
        self.inner.cancels.lock().insert(run_id.clone(), handle);

        let run_ctx = RunContext {
            branch: pipeline
                .environment
                .get(BRANCH_ENV)
                .cloned()
                .unwrap_or_default(),
            prior_status: self.inner.store.latest_terminal_status(&pipeline.id),
            vars: pipeline.environment.clone(),
        };
        let dispatcher = Dispatcher {
            registry: self.inner.registry.clone(),
            cache: self.inner.cache.clone(),
            bus: self.inner.bus.clone(),
            clock: Arc::clone(&self.inner.clock),
            default_timeout: self.inner.default_step_timeout,
        };
        let supervisor = RunSupervisor::new(
            Arc::new(pipeline),
            graph,
            run_id.clone(),
            run_ctx,
            self.inner.store.clone(),
            self.inner.bus.clone(),
            dispatcher,
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.clock),
            signal,
        );
        tokio::spawn(supervisor.run());
        Ok(run_id)
    }

    // === Events ===

    /// Register a subscriber; it receives events emitted strictly after
    /// registration. `capacity` falls back to the configured default.
    pub fn subscribe(
        &self,
        id: SubscriberId,
        capacity: Option<usize>,
    ) -> Result<Subscription, EngineError> {
        self.inner.bus.subscribe(id, capacity)
    }

    /// Register a subscriber with the configured default sink capacity.
    pub fn subscribe_default(&self, id: SubscriberId) -> Result<Subscription, EngineError> {
        self.subscribe(id, None)
    }

    pub fn unsubscribe(&self, id: &SubscriberId) -> Result<(), EngineError> {
        self.inner.bus.unsubscribe(id)
    }

    /// Events dropped for a subscriber because its sink was full.
    pub fn dropped_count(&self, id: &SubscriberId) -> Option<u64> {
        self.inner.bus.dropped_count(id)
    }

    // === Cache administration ===

    pub fn invalidate_cache(&self, fingerprint: &str) {
        self.inner.cache.invalidate(fingerprint);
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
