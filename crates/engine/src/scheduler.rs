// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-run supervision.
//!
//! Each run is driven by one supervisor task that owns all mutation of the
//! run record. Stages are released in waves as their `needs` resolve;
//! within a released stage, steps dispatch as their `dependsOn` resolve.
//! Step tasks execute on the engine-wide worker pool and report lifecycle
//! messages back over a channel, so state updates and event emission stay
//! serialized and each transition pairs with exactly one event.

use crate::bus::EventBus;
use crate::cancel::CancelSignal;
use crate::dispatch::{Dispatcher, StepMsg, StepOutcome};
use crate::store::PipelineStore;
use cv_core::{
    Clock, Event, EventKind, LogLevel, Pipeline, PipelineGraph, RunContext, RunId, RunStatus, Step,
    StepStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Reasons recorded on skipped steps.
const REASON_CONDITION: &str = "condition";
const REASON_UPSTREAM: &str = "upstream_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StagePhase {
    Pending,
    Running,
    Success,
    Failed,
    /// Condition was false; satisfies downstream `needs` like success.
    SkippedCondition,
    /// A needed stage failed or was skipped upstream; propagates the skip.
    SkippedUpstream,
}

impl StagePhase {
    fn satisfies_needs(self) -> bool {
        matches!(self, StagePhase::Success | StagePhase::SkippedCondition)
    }

    fn blocks_needs(self) -> bool {
        matches!(self, StagePhase::Failed | StagePhase::SkippedUpstream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalStep {
    Pending,
    /// A task owns it; the terminal outcome arrives as a `Finished` message.
    Dispatched,
    Done(StepStatus),
}

struct StageExec {
    phase: StagePhase,
    remaining_needs: usize,
    /// Remaining unsatisfied `dependsOn` per step.
    in_degree: HashMap<String, usize>,
    /// Steps not yet terminal.
    open_steps: usize,
    failed: bool,
}

/// Drives one run to a terminal status.
pub(crate) struct RunSupervisor {
    pipeline: Arc<Pipeline>,
    graph: PipelineGraph,
    run_id: RunId,
    run_ctx: RunContext,
    store: PipelineStore,
    bus: EventBus,
    dispatcher: Dispatcher,
    pool: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    cancel: CancelSignal,

    stages: HashMap<String, StageExec>,
    steps: HashMap<String, LocalStep>,
    step_stage: HashMap<String, String>,
    in_flight: usize,
    cancelled: bool,
}

impl RunSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        graph: PipelineGraph,
        run_id: RunId,
        run_ctx: RunContext,
        store: PipelineStore,
        bus: EventBus,
        dispatcher: Dispatcher,
        pool: Arc<Semaphore>,
        clock: Arc<dyn Clock>,
        cancel: CancelSignal,
    ) -> Self {
        let mut stages = HashMap::new();
        let mut steps = HashMap::new();
        let mut step_stage = HashMap::new();
        for stage_id in &graph.stages {
            let step_graph = &graph.step_graphs[stage_id];
            for step_id in &step_graph.steps {
                steps.insert(step_id.clone(), LocalStep::Pending);
                step_stage.insert(step_id.clone(), stage_id.clone());
            }
            stages.insert(
                stage_id.clone(),
                StageExec {
                    phase: StagePhase::Pending,
                    remaining_needs: graph.stage_in_degree[stage_id],
                    in_degree: step_graph.in_degree.clone(),
                    open_steps: step_graph.steps.len(),
                    failed: false,
                },
            );
        }
        Self {
            pipeline,
            graph,
            run_id,
            run_ctx,
            store,
            bus,
            dispatcher,
            pool,
            clock,
            cancel,
            stages,
            steps,
            step_stage,
            in_flight: 0,
            cancelled: false,
        }
    }

    /// Execute the run to completion. Consumes the supervisor.
    pub(crate) async fn run(mut self) {
        let now = self.clock.epoch_ms();
        self.store.update_run(&self.run_id, |r| {
            r.mark_running(now);
            r.log(now, LogLevel::Info, None, "run started");
        });
        self.emit(self.event(EventKind::RunStarted, now));
        tracing::info!(
            run = %self.run_id.short(8),
            pipeline = %self.pipeline.id.short(12),
            "run started"
        );

        let (tx, mut rx) = mpsc::channel::<StepMsg>(256);
        let cancel = self.cancel.clone();

        if cancel.is_cancelled() {
            self.cancelled = true;
        } else {
            for stage_id in self.graph.root_stages() {
                self.release_stage(&stage_id, &tx);
            }
        }

        while self.in_flight > 0 {
            tokio::select! {
                _ = cancel.cancelled(), if !self.cancelled => {
                    self.cancelled = true;
                    self.cancel_pending_steps();
                }
                msg = rx.recv() => {
                    // We hold a sender, so the channel cannot close here.
                    if let Some(msg) = msg {
                        self.handle_msg(msg, &tx);
                    }
                }
            }
        }
        if self.cancelled {
            self.cancel_pending_steps();
        }

        let status = if self.cancelled {
            RunStatus::Cancelled
        } else if self
            .stages
            .values()
            .any(|s| s.phase == StagePhase::Failed)
        {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let now = self.clock.epoch_ms();
        let mut transitioned = false;
        self.store.update_run(&self.run_id, |r| {
            transitioned = r.finish(status, now);
            r.log(now, LogLevel::Info, None, format!("run finished: {status}"));
        });
        if transitioned {
            let kind = if status == RunStatus::Cancelled {
                EventKind::RunCancelled
            } else {
                EventKind::RunCompleted
            };
            self.emit(
                self.event(kind, now)
                    .with_data("status", status.to_string()),
            );
        }
        tracing::info!(run = %self.run_id.short(8), %status, "run finished");
    }

    fn handle_msg(&mut self, msg: StepMsg, tx: &mpsc::Sender<StepMsg>) {
        match msg {
            StepMsg::Started {
                step_id,
                attempt,
                at_ms,
            } => {
                self.store.update_run(&self.run_id, |r| {
                    if let Some(s) = r.steps.get_mut(&step_id) {
                        s.start_attempt(attempt, at_ms);
                    }
                });
                self.emit(
                    self.event(EventKind::StepStarted, at_ms)
                        .with_step(step_id)
                        .with_data("attempt", attempt),
                );
            }
            StepMsg::Retried {
                step_id,
                attempt,
                at_ms,
            } => {
                self.store.update_run(&self.run_id, |r| {
                    if let Some(s) = r.steps.get_mut(&step_id) {
                        s.start_attempt(attempt, at_ms);
                    }
                    r.log(
                        at_ms,
                        LogLevel::Warn,
                        Some(&step_id),
                        format!("retrying, attempt {attempt}"),
                    );
                });
                self.emit(
                    self.event(EventKind::StepRetried, at_ms)
                        .with_step(step_id)
                        .with_data("attempt", attempt),
                );
            }
            StepMsg::Finished(outcome) => {
                self.in_flight -= 1;
                self.finish_step(outcome, tx);
            }
        }
    }

    /// Record a dispatched step's terminal outcome and advance the graph.
    fn finish_step(&mut self, outcome: StepOutcome, tx: &mpsc::Sender<StepMsg>) {
        let StepOutcome {
            step_id,
            status,
            attempts,
            outputs,
            error,
            exit_code,
            cached,
            ended_at_ms,
        } = outcome;

        let error_text = error.as_ref().map(|e| e.to_string());
        let error_kind = error.as_ref().map(|e| e.kind());
        self.store.update_run(&self.run_id, |r| {
            if let Some(s) = r.steps.get_mut(&step_id) {
                if attempts > 0 {
                    s.attempts = attempts;
                }
                s.outputs = outputs;
                s.exit_code = exit_code;
                s.error = error_text.clone();
                s.finish(status, ended_at_ms);
            }
            if let Some(error) = &error_text {
                r.log(
                    ended_at_ms,
                    LogLevel::Error,
                    Some(&step_id),
                    format!("step {status}: {error}"),
                );
            }
        });
        self.steps.insert(step_id.clone(), LocalStep::Done(status));

        let mut event = self
            .event(EventKind::StepCompleted, ended_at_ms)
            .with_step(step_id.clone())
            .with_data("status", status.to_string())
            .with_data("attempts", attempts);
        if cached {
            event = event.with_data("cached", true);
        }
        if let (Some(text), Some(kind)) = (&error_text, error_kind) {
            event = event
                .with_data("error", text.as_str())
                .with_data("errorKind", kind);
        }
        self.emit(event);

        // A cancelled outcome means the run signal fired; adopt it even if
        // this supervisor has not polled its own signal yet.
        if status == StepStatus::Cancelled && !self.cancelled {
            self.cancelled = true;
            self.cancel_pending_steps();
        }

        let Some(stage_id) = self.step_stage.get(&step_id).cloned() else {
            return;
        };
        if let Some(exec) = self.stages.get_mut(&stage_id) {
            exec.open_steps -= 1;
            if status == StepStatus::Failed {
                exec.failed = true;
            }
        }
        if !self.cancelled {
            match status {
                StepStatus::Success => self.satisfy_step_dependents(&stage_id, &step_id, tx),
                StepStatus::Failed => self.cascade_skip_dependents(&stage_id, &step_id, tx),
                _ => {}
            }
        }
        self.maybe_finish_stage(&stage_id, tx);
    }

    /// A step resolved in a way that satisfies its dependents: decrement
    /// their in-degrees and dispatch any that became ready.
    fn satisfy_step_dependents(
        &mut self,
        stage_id: &str,
        step_id: &str,
        tx: &mpsc::Sender<StepMsg>,
    ) {
        let dependents = self.graph.step_graphs[stage_id]
            .dependents
            .get(step_id)
            .cloned()
            .unwrap_or_default();
        for dependent in dependents {
            let ready = {
                let Some(exec) = self.stages.get_mut(stage_id) else {
                    continue;
                };
                match exec.in_degree.get_mut(&dependent) {
                    Some(d) => {
                        *d = d.saturating_sub(1);
                        *d == 0
                    }
                    None => false,
                }
            };
            if ready && self.steps.get(&dependent) == Some(&LocalStep::Pending) {
                self.dispatch_step(stage_id, &dependent, tx);
            }
        }
    }

    /// A step failed: all its transitive intra-stage dependents are skipped.
    fn cascade_skip_dependents(
        &mut self,
        stage_id: &str,
        step_id: &str,
        tx: &mpsc::Sender<StepMsg>,
    ) {
        let dependents = &self.graph.step_graphs[stage_id].dependents;
        let mut queue: Vec<String> = dependents.get(step_id).cloned().unwrap_or_default();
        let mut to_skip: Vec<String> = Vec::new();
        while let Some(id) = queue.pop() {
            if to_skip.contains(&id) {
                continue;
            }
            queue.extend(dependents.get(&id).cloned().unwrap_or_default());
            to_skip.push(id);
        }
        for id in to_skip {
            if self.steps.get(&id) == Some(&LocalStep::Pending) {
                self.skip_step(stage_id, &id, REASON_UPSTREAM, tx);
            }
        }
    }

    /// Evaluate the step condition and either dispatch or skip.
    fn dispatch_step(&mut self, stage_id: &str, step_id: &str, tx: &mpsc::Sender<StepMsg>) {
        let pipeline = Arc::clone(&self.pipeline);
        let Some((_, step)) = pipeline.step(step_id) else {
            return;
        };
        if let Some(when) = &step.when {
            if !when.evaluate(&self.run_ctx) {
                self.skip_step(stage_id, step_id, REASON_CONDITION, tx);
                return;
            }
        }
        self.spawn_step(step, tx);
    }

    /// Spawn a pooled task for a ready step.
    fn spawn_step(&mut self, step: &Step, tx: &mpsc::Sender<StepMsg>) {
        self.steps
            .insert(step.id.clone(), LocalStep::Dispatched);
        self.in_flight += 1;

        let dispatcher = self.dispatcher.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let step = step.clone();
        let run_id = self.run_id.clone();
        let cancel = self.cancel.clone();
        let pool = Arc::clone(&self.pool);
        let clock = Arc::clone(&self.clock);
        let tx = tx.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = pool.acquire_owned() => permit.ok(),
            };
            let outcome = match permit {
                Some(_permit) => {
                    dispatcher
                        .execute_step(&pipeline, &step, &run_id, &cancel, &tx)
                        .await
                }
                // Cancelled while queued for a worker: never dispatched.
                None => StepOutcome::cancelled(&step.id, 0, clock.epoch_ms()),
            };
            let _ = tx.send(StepMsg::Finished(outcome)).await;
        });
    }

    /// Mark a step skipped. Condition skips satisfy dependents; upstream
    /// skips rely on the cascade to cover the whole dependent closure.
    fn skip_step(
        &mut self,
        stage_id: &str,
        step_id: &str,
        reason: &str,
        tx: &mpsc::Sender<StepMsg>,
    ) {
        let at_ms = self.clock.epoch_ms();
        self.store.update_run(&self.run_id, |r| {
            if let Some(s) = r.steps.get_mut(step_id) {
                s.reason = Some(reason.to_string());
                s.finish(StepStatus::Skipped, at_ms);
            }
        });
        self.steps
            .insert(step_id.to_string(), LocalStep::Done(StepStatus::Skipped));
        self.emit(
            self.event(EventKind::StepSkipped, at_ms)
                .with_step(step_id)
                .with_data("reason", reason),
        );
        if let Some(exec) = self.stages.get_mut(stage_id) {
            exec.open_steps -= 1;
        }
        if reason == REASON_CONDITION && !self.cancelled {
            self.satisfy_step_dependents(stage_id, step_id, tx);
        }
        self.maybe_finish_stage(stage_id, tx);
    }

    /// Begin a stage whose `needs` are satisfied.
    fn release_stage(&mut self, stage_id: &str, tx: &mpsc::Sender<StepMsg>) {
        if self.cancelled {
            return;
        }
        match self.stages.get(stage_id) {
            Some(exec) if exec.phase == StagePhase::Pending => {}
            _ => return,
        }
        let pipeline = Arc::clone(&self.pipeline);
        let Some(stage) = pipeline.stage(stage_id) else {
            return;
        };
        if let Some(when) = &stage.when {
            if !when.evaluate(&self.run_ctx) {
                self.skip_stage(stage_id, StagePhase::SkippedCondition, tx);
                return;
            }
        }
        if let Some(exec) = self.stages.get_mut(stage_id) {
            exec.phase = StagePhase::Running;
        }
        tracing::debug!(run = %self.run_id.short(8), stage = stage_id, "stage released");

        let ready: Vec<String> = self.graph.step_graphs[stage_id]
            .steps
            .iter()
            .filter(|id| {
                self.stages[stage_id].in_degree.get(*id).copied() == Some(0)
            })
            .cloned()
            .collect();
        for step_id in ready {
            if self.steps.get(&step_id) == Some(&LocalStep::Pending) {
                self.dispatch_step(stage_id, &step_id, tx);
            }
        }
        // A stage with no steps completes on the spot.
        self.maybe_finish_stage(stage_id, tx);
    }

    /// Skip an entire stage (condition false, or an upstream stage failed).
    fn skip_stage(&mut self, stage_id: &str, phase: StagePhase, tx: &mpsc::Sender<StepMsg>) {
        match self.stages.get(stage_id) {
            Some(exec) if exec.phase == StagePhase::Pending => {}
            _ => return,
        }
        let reason = if phase == StagePhase::SkippedCondition {
            REASON_CONDITION
        } else {
            REASON_UPSTREAM
        };
        if let Some(exec) = self.stages.get_mut(stage_id) {
            exec.phase = phase;
        }
        let at_ms = self.clock.epoch_ms();
        let step_ids = self.graph.step_graphs[stage_id].steps.clone();
        for step_id in step_ids {
            if self.steps.get(&step_id) != Some(&LocalStep::Pending) {
                continue;
            }
            self.store.update_run(&self.run_id, |r| {
                if let Some(s) = r.steps.get_mut(&step_id) {
                    s.reason = Some(reason.to_string());
                    s.finish(StepStatus::Skipped, at_ms);
                }
            });
            self.steps
                .insert(step_id.clone(), LocalStep::Done(StepStatus::Skipped));
            self.emit(
                self.event(EventKind::StepSkipped, at_ms)
                    .with_step(step_id)
                    .with_data("reason", reason),
            );
            if let Some(exec) = self.stages.get_mut(stage_id) {
                exec.open_steps -= 1;
            }
        }
        self.resolve_stage(stage_id, tx);
    }

    /// If every step of a running stage is terminal, settle the stage.
    fn maybe_finish_stage(&mut self, stage_id: &str, tx: &mpsc::Sender<StepMsg>) {
        let phase = {
            let Some(exec) = self.stages.get_mut(stage_id) else {
                return;
            };
            if exec.phase != StagePhase::Running || exec.open_steps > 0 {
                return;
            }
            exec.phase = if exec.failed {
                StagePhase::Failed
            } else {
                StagePhase::Success
            };
            exec.phase
        };
        tracing::debug!(run = %self.run_id.short(8), stage = stage_id, ?phase, "stage settled");
        self.resolve_stage(stage_id, tx);
    }

    /// Propagate a terminal stage to the stages that need it.
    fn resolve_stage(&mut self, stage_id: &str, tx: &mpsc::Sender<StepMsg>) {
        if self.cancelled {
            return;
        }
        let phase = match self.stages.get(stage_id) {
            Some(exec) => exec.phase,
            None => return,
        };
        let dependents = self
            .graph
            .stage_dependents
            .get(stage_id)
            .cloned()
            .unwrap_or_default();
        for dependent in dependents {
            if phase.blocks_needs() {
                self.skip_stage(&dependent, StagePhase::SkippedUpstream, tx);
                continue;
            }
            if !phase.satisfies_needs() {
                continue;
            }
            let eligible = {
                let Some(exec) = self.stages.get_mut(&dependent) else {
                    continue;
                };
                exec.remaining_needs = exec.remaining_needs.saturating_sub(1);
                exec.remaining_needs == 0 && exec.phase == StagePhase::Pending
            };
            if eligible {
                self.release_stage(&dependent, tx);
            }
        }
    }

    /// On cancellation, settle every step that never dispatched.
    fn cancel_pending_steps(&mut self) {
        let at_ms = self.clock.epoch_ms();
        let pending: Vec<String> = self
            .steps
            .iter()
            .filter(|(_, s)| **s == LocalStep::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for step_id in pending {
            self.store.update_run(&self.run_id, |r| {
                if let Some(s) = r.steps.get_mut(&step_id) {
                    s.finish(StepStatus::Cancelled, at_ms);
                }
            });
            self.steps
                .insert(step_id.clone(), LocalStep::Done(StepStatus::Cancelled));
            self.emit(
                self.event(EventKind::StepCompleted, at_ms)
                    .with_step(step_id)
                    .with_data("status", StepStatus::Cancelled.to_string()),
            );
        }
    }

    fn event(&self, kind: EventKind, at_ms: u64) -> Event {
        Event::new(kind, at_ms, self.pipeline.id.clone()).with_run(self.run_id.clone())
    }

    fn emit(&self, event: Event) {
        self.bus.emit(event);
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
