// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-step execution.
//!
//! Drives one step to a terminal outcome: cache lookup with single-flight
//! coordination, the attempt loop with backoff, per-attempt timeout, and
//! cooperative cancellation. Lifecycle notifications flow back to the run
//! supervisor, which owns all run-state mutation and event emission.

use crate::cache::{ArtifactCache, FlightToken, Lookup};
use crate::cancel::CancelSignal;
use crate::error::StepError;
use crate::plugin::{ProgressSink, StepContext, StepOutputs};
use crate::registry::PluginRegistry;
use crate::bus::EventBus;
use cv_core::{CachePolicy, Clock, Pipeline, RunId, Step, StepStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Lifecycle notifications from a step task to its run supervisor.
#[derive(Debug)]
pub(crate) enum StepMsg {
    Started {
        step_id: String,
        attempt: u32,
        at_ms: u64,
    },
    Retried {
        step_id: String,
        attempt: u32,
        at_ms: u64,
    },
    Finished(StepOutcome),
}

/// Terminal result of one step execution.
#[derive(Debug)]
pub(crate) struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub outputs: StepOutputs,
    pub error: Option<StepError>,
    pub exit_code: Option<i32>,
    pub cached: bool,
    pub ended_at_ms: u64,
}

impl StepOutcome {
    pub(crate) fn cancelled(step_id: impl Into<String>, attempts: u32, at_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Cancelled,
            attempts,
            outputs: StepOutputs::new(),
            error: Some(StepError::Cancelled),
            exit_code: None,
            cached: false,
            ended_at_ms: at_ms,
        }
    }
}

/// Shared machinery for executing steps. Cheap to clone into step tasks.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub registry: PluginRegistry,
    pub cache: ArtifactCache,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub default_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Execute one step to a terminal outcome. Sends `Started`/`Retried`
    /// notifications through `tx`; the caller reports the returned outcome.
    pub(crate) async fn execute_step(
        &self,
        pipeline: &Pipeline,
        step: &Step,
        run_id: &RunId,
        cancel: &CancelSignal,
        tx: &mpsc::Sender<StepMsg>,
    ) -> StepOutcome {
        let plugin = match &step.plugin {
            Some(name) => self.registry.plugin(name),
            None => self.registry.plugin_for_type(&step.step_type),
        };
        let Some(plugin) = plugin else {
            return self.failed(step, 0, StepError::UnknownStepType(step.step_type.clone()), None);
        };

        // Cache protocol: hit, or join the in-flight leader, or lead.
        let policy = effective_cache_policy(pipeline, step);
        let mut flight: Option<FlightToken> = None;
        let fingerprint = cacheable_fingerprint(pipeline, step, policy);
        if let Some(fp) = &fingerprint {
            if policy == CachePolicy::ReadOnly {
                if let Some(outputs) = self.cache.get(fp) {
                    return self.cache_hit(step, outputs);
                }
            } else {
                loop {
                    match self.cache.lookup_or_start(fp) {
                        Lookup::Hit(outputs) => return self.cache_hit(step, outputs),
                        Lookup::Leader(token) => {
                            flight = Some(token);
                            break;
                        }
                        Lookup::Follower(wait) => {
                            let waited = tokio::select! {
                                _ = cancel.cancelled() => {
                                    return StepOutcome::cancelled(&step.id, 0, self.clock.epoch_ms());
                                }
                                waited = wait.wait() => waited,
                            };
                            match waited {
                                Ok(outputs) => return self.cache_hit(step, outputs),
                                // Leader failed: re-enter; the next lap leads.
                                Err(_) => continue,
                            }
                        }
                    }
                }
            }
        }

        let environment = pipeline.step_environment(step);
        let timeout = step.timeout.or(self.default_timeout);
        let max_attempts = step.max_attempts();

        for attempt in 1..=max_attempts {
            let at_ms = self.clock.epoch_ms();
            let msg = if attempt == 1 {
                StepMsg::Started {
                    step_id: step.id.clone(),
                    attempt,
                    at_ms,
                }
            } else {
                StepMsg::Retried {
                    step_id: step.id.clone(),
                    attempt,
                    at_ms,
                }
            };
            if tx.send(msg).await.is_err() {
                // Supervisor gone; nothing left to report to.
                return StepOutcome::cancelled(&step.id, attempt, self.clock.epoch_ms());
            }

            let ctx = StepContext::new(
                pipeline.id.clone(),
                run_id.clone(),
                step.id.clone(),
                attempt,
                environment.clone(),
                cancel.clone(),
                timeout.map(|t| Instant::now() + t),
                ProgressSink::new(
                    self.bus.clone(),
                    Arc::clone(&self.clock),
                    pipeline.id.clone(),
                    run_id.clone(),
                    step.id.clone(),
                ),
            );

            match self.attempt_once(&plugin, &ctx, step, cancel, timeout).await {
                Ok(outputs) => {
                    let at_ms = self.clock.epoch_ms();
                    if let Some(token) = flight.take() {
                        self.cache.publish(token, outputs.clone(), at_ms);
                    }
                    return StepOutcome {
                        step_id: step.id.clone(),
                        status: StepStatus::Success,
                        attempts: attempt,
                        outputs,
                        error: None,
                        exit_code: Some(0),
                        cached: false,
                        ended_at_ms: at_ms,
                    };
                }
                Err((error, exit_code)) => {
                    if error == StepError::Cancelled {
                        if let Some(token) = flight.take() {
                            self.cache.fail(token, "cancelled");
                        }
                        return StepOutcome::cancelled(&step.id, attempt, self.clock.epoch_ms());
                    }
                    let retries_left = attempt < max_attempts && error.is_retryable();
                    if !retries_left {
                        if let Some(token) = flight.take() {
                            self.cache.fail(token, &error.to_string());
                        }
                        return self.failed(step, attempt, error, exit_code);
                    }
                    tracing::debug!(
                        step = %step.id,
                        attempt,
                        error = %error,
                        "step attempt failed, retrying"
                    );
                    if let Some(retry) = &step.retry {
                        let backoff = retry.backoff(attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                if let Some(token) = flight.take() {
                                    self.cache.fail(token, "cancelled during backoff");
                                }
                                return StepOutcome::cancelled(
                                    &step.id,
                                    attempt,
                                    self.clock.epoch_ms(),
                                );
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        }

        // The loop always returns; max_attempts >= 1.
        self.failed(step, max_attempts, StepError::Plugin("no attempt ran".into()), None)
    }

    /// One plugin invocation bounded by the step timeout and run cancellation.
    async fn attempt_once(
        &self,
        plugin: &Arc<dyn crate::plugin::Plugin>,
        ctx: &StepContext,
        step: &Step,
        cancel: &CancelSignal,
        timeout: Option<Duration>,
    ) -> Result<StepOutputs, (StepError, Option<i32>)> {
        let exec = plugin.execute(ctx, step);
        match timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => Err((StepError::Cancelled, None)),
                result = tokio::time::timeout(limit, exec) => match result {
                    Ok(Ok(outputs)) => Ok(outputs),
                    Ok(Err(e)) => Err((StepError::Plugin(e.message), e.exit_code)),
                    Err(_) => Err((StepError::Timeout(limit), None)),
                },
            },
            None => tokio::select! {
                _ = cancel.cancelled() => Err((StepError::Cancelled, None)),
                result = exec => match result {
                    Ok(outputs) => Ok(outputs),
                    Err(e) => Err((StepError::Plugin(e.message), e.exit_code)),
                },
            },
        }
    }

    fn cache_hit(&self, step: &Step, outputs: StepOutputs) -> StepOutcome {
        StepOutcome {
            step_id: step.id.clone(),
            status: StepStatus::Success,
            attempts: 0,
            outputs,
            error: None,
            exit_code: None,
            cached: true,
            ended_at_ms: self.clock.epoch_ms(),
        }
    }

    fn failed(
        &self,
        step: &Step,
        attempts: u32,
        error: StepError,
        exit_code: Option<i32>,
    ) -> StepOutcome {
        StepOutcome {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            attempts,
            outputs: StepOutputs::new(),
            error: Some(error),
            exit_code,
            cached: false,
            ended_at_ms: self.clock.epoch_ms(),
        }
    }
}

/// Cache policy for a step after applying pipeline defaults.
fn effective_cache_policy(pipeline: &Pipeline, step: &Step) -> CachePolicy {
    let step_policy = step.cache.as_ref().and_then(|c| c.policy);
    let default_policy = pipeline.cache.as_ref().and_then(|c| c.policy);
    step_policy.or(default_policy).unwrap_or_default()
}

/// The fingerprint, when this step participates in caching.
fn cacheable_fingerprint(
    pipeline: &Pipeline,
    step: &Step,
    policy: CachePolicy,
) -> Option<String> {
    let cache = step.cache.as_ref()?;
    if policy == CachePolicy::Disabled {
        return None;
    }
    let env = pipeline.step_environment(step);
    let resolved_key = crate::fingerprint::resolve_key_template(&cache.key, &env);
    Some(crate::fingerprint::step_fingerprint(
        &pipeline.id,
        step,
        &resolved_key,
    ))
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
