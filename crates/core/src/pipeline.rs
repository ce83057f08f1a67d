// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative pipeline definitions.
//!
//! A [`Pipeline`] is an immutable, caller-identified definition: an ordered
//! list of stages, each holding steps with intra-stage dependencies.
//! Definitions are plain data; execution state lives in [`crate::run`].

use crate::condition::Condition;
use crate::duration::iso8601_opt;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

crate::define_id! {
    /// Caller-supplied stable identifier for a pipeline definition.
    pub struct PipelineId;
}

/// Name of the implicit stage created for flat `steps`-only pipelines.
pub const IMPLICIT_STAGE: &str = "main";

/// A declarative pipeline definition.
///
/// Immutable after creation; an update is modelled as delete + create
/// preserving `created_at_ms`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub stages: Vec<Stage>,
    /// Advisory trigger metadata; not interpreted by the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheDefaults>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub created_at_ms: u64,
}

/// Raw wire shape. Accepts either `stages` or a flat `steps` array; the
/// latter is normalized into a single implicit stage.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineRaw {
    id: PipelineId,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    stages: Vec<Stage>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    triggers: Vec<Trigger>,
    #[serde(default)]
    cache: Option<CacheDefaults>,
    #[serde(default)]
    environment: HashMap<String, String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    created_at_ms: u64,
}

impl<'de> Deserialize<'de> for Pipeline {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = PipelineRaw::deserialize(d)?;
        let stages = if raw.stages.is_empty() && !raw.steps.is_empty() {
            vec![Stage {
                id: IMPLICIT_STAGE.to_string(),
                name: IMPLICIT_STAGE.to_string(),
                steps: raw.steps,
                needs: Vec::new(),
                when: None,
                parallel: false,
            }]
        } else {
            raw.stages
        };
        Ok(Pipeline {
            id: raw.id,
            name: raw.name,
            description: raw.description,
            stages,
            triggers: raw.triggers,
            cache: raw.cache,
            environment: raw.environment,
            metadata: raw.metadata,
            created_at_ms: raw.created_at_ms,
        })
    }
}

impl Pipeline {
    /// Look up a step by id across all stages.
    pub fn step(&self, step_id: &str) -> Option<(&Stage, &Step)> {
        self.stages.iter().find_map(|stage| {
            stage
                .steps
                .iter()
                .find(|s| s.id == step_id)
                .map(|s| (stage, s))
        })
    }

    /// Look up a stage by id.
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Total step count across stages.
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    /// Environment for a step: pipeline env overlaid with step env.
    pub fn step_environment(&self, step: &Step) -> HashMap<String, String> {
        let mut env = self.environment.clone();
        env.extend(step.environment.clone());
        env
    }
}

/// A named group of steps released together once its `needs` are satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub steps: Vec<Step>,
    /// Stage ids that must complete successfully before this stage runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    /// Advisory hint; intra-stage parallelism is always driven by `dependsOn`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
}

/// A unit of work executed by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Key into the plugin registry's step-type index.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Optional explicit plugin name, bypassing the step-type index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Opaque configuration delivered to the plugin.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, with = "iso8601_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    /// Step ids within the same stage that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Declared output handles the plugin may populate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Step {
    /// Max attempts for this step (at least 1).
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }
}

/// Retry policy for transient step failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "crate::duration::iso8601")]
    pub interval: Duration,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exponential: bool,
}

impl RetryPolicy {
    /// Backoff before the attempt following failed attempt number `attempt`
    /// (1-based): `interval` or `interval * 2^(attempt-1)` when exponential.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.exponential {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.interval.saturating_mul(factor)
        } else {
            self.interval
        }
    }
}

/// Per-step cache configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Key template; `${env.NAME}` references resolve from the step's
    /// effective environment.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// Omitted means "inherit the pipeline default, else enabled".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CachePolicy>,
}

/// Pipeline-level cache defaults applied to steps that omit a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CachePolicy>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    #[default]
    Enabled,
    /// Reserved: serve hits but never publish.
    ReadOnly,
    Disabled,
}

/// Advisory trigger metadata. Stored and returned verbatim; the engine does
/// not schedule from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
