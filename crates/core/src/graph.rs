// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dependency graph construction and validation.
//!
//! A pipeline carries two overlaid graphs: stages depend on stages via
//! `needs`, and steps depend on steps within their stage via `dependsOn`.
//! They are kept as separate adjacency structures so stage-level skipping
//! can propagate without flattening the user's model.

use crate::pipeline::Pipeline;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Why a pipeline definition was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate stage id: {0}")]
    DuplicateStage(String),
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),
    #[error("stage {stage} needs unknown stage {needs}")]
    UnknownNeeds { stage: String, needs: String },
    #[error("step {step} depends on unknown step {depends_on}")]
    UnknownDependsOn { step: String, depends_on: String },
    #[error("step {step} depends on {depends_on}, which belongs to another stage; use stage `needs` for cross-stage ordering")]
    CrossStageDependsOn { step: String, depends_on: String },
    #[error("dependency cycle among stages: {0:?}")]
    StageCycle(Vec<String>),
    #[error("dependency cycle among steps of stage {stage}: {steps:?}")]
    StepCycle { stage: String, steps: Vec<String> },
}

/// Intra-stage dependency graph over step ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepGraph {
    /// Step ids in definition order.
    pub steps: Vec<String>,
    /// Step id → step ids that depend on it.
    pub dependents: HashMap<String, Vec<String>>,
    /// Step id → count of distinct `dependsOn` entries.
    pub in_degree: HashMap<String, usize>,
}

/// Validated dependency structure for one pipeline, immutable per run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineGraph {
    /// Stage ids in definition order.
    pub stages: Vec<String>,
    /// Stage id → stage ids that need it.
    pub stage_dependents: HashMap<String, Vec<String>>,
    /// Stage id → count of distinct `needs` entries.
    pub stage_in_degree: HashMap<String, usize>,
    /// Stage id → its intra-stage step graph.
    pub step_graphs: HashMap<String, StepGraph>,
}

impl PipelineGraph {
    /// Build and validate the combined graph for a pipeline definition.
    pub fn build(pipeline: &Pipeline) -> Result<Self, ValidationError> {
        let mut stage_ids = Vec::with_capacity(pipeline.stages.len());
        let mut seen_stages = HashSet::new();
        for stage in &pipeline.stages {
            if !seen_stages.insert(stage.id.clone()) {
                return Err(ValidationError::DuplicateStage(stage.id.clone()));
            }
            stage_ids.push(stage.id.clone());
        }

        // Step ids are unique across the whole pipeline, not just per stage.
        let mut step_stage: HashMap<&str, &str> = HashMap::new();
        for stage in &pipeline.stages {
            for step in &stage.steps {
                if step_stage.insert(&step.id, &stage.id).is_some() {
                    return Err(ValidationError::DuplicateStep(step.id.clone()));
                }
            }
        }

        let mut stage_dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut stage_in_degree: HashMap<String, usize> =
            stage_ids.iter().map(|id| (id.clone(), 0)).collect();
        for stage in &pipeline.stages {
            let mut distinct = HashSet::new();
            for needs in &stage.needs {
                if !seen_stages.contains(needs) {
                    return Err(ValidationError::UnknownNeeds {
                        stage: stage.id.clone(),
                        needs: needs.clone(),
                    });
                }
                if !distinct.insert(needs) {
                    continue;
                }
                stage_dependents
                    .entry(needs.clone())
                    .or_default()
                    .push(stage.id.clone());
                if let Some(d) = stage_in_degree.get_mut(&stage.id) {
                    *d += 1;
                }
            }
        }
        if let Err(residue) = kahn(&stage_ids, &stage_dependents, &stage_in_degree) {
            return Err(ValidationError::StageCycle(residue));
        }

        let mut step_graphs = HashMap::new();
        for stage in &pipeline.stages {
            let step_ids: Vec<String> = stage.steps.iter().map(|s| s.id.clone()).collect();
            let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
            let mut in_degree: HashMap<String, usize> =
                step_ids.iter().map(|id| (id.clone(), 0)).collect();
            for step in &stage.steps {
                let mut distinct = HashSet::new();
                for dep in &step.depends_on {
                    match step_stage.get(dep.as_str()) {
                        Some(owner) if *owner == stage.id => {}
                        Some(_) => {
                            return Err(ValidationError::CrossStageDependsOn {
                                step: step.id.clone(),
                                depends_on: dep.clone(),
                            });
                        }
                        None => {
                            return Err(ValidationError::UnknownDependsOn {
                                step: step.id.clone(),
                                depends_on: dep.clone(),
                            });
                        }
                    }
                    if !distinct.insert(dep) {
                        continue;
                    }
                    dependents
                        .entry(dep.clone())
                        .or_default()
                        .push(step.id.clone());
                    if let Some(d) = in_degree.get_mut(&step.id) {
                        *d += 1;
                    }
                }
            }
            if let Err(residue) = kahn(&step_ids, &dependents, &in_degree) {
                return Err(ValidationError::StepCycle {
                    stage: stage.id.clone(),
                    steps: residue,
                });
            }
            step_graphs.insert(
                stage.id.clone(),
                StepGraph {
                    steps: step_ids,
                    dependents,
                    in_degree,
                },
            );
        }

        Ok(Self {
            stages: stage_ids,
            stage_dependents,
            stage_in_degree,
            step_graphs,
        })
    }

    /// Stage ids with no `needs` (the first wave).
    pub fn root_stages(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|id| self.stage_in_degree.get(*id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect()
    }
}

/// Kahn's algorithm. Consuming every node proves acyclicity; on failure the
/// unconsumed residue (the nodes on or downstream of a cycle) is returned.
fn kahn(
    order: &[String],
    dependents: &HashMap<String, Vec<String>>,
    in_degree: &HashMap<String, usize>,
) -> Result<(), Vec<String>> {
    let mut degree = in_degree.clone();
    let mut queue: VecDeque<&String> = order
        .iter()
        .filter(|n| degree.get(*n).copied().unwrap_or(0) == 0)
        .collect();
    let mut consumed = 0usize;
    while let Some(node) = queue.pop_front() {
        consumed += 1;
        if let Some(deps) = dependents.get(node) {
            for dep in deps {
                if let Some(d) = degree.get_mut(dep) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }
    }
    if consumed == order.len() {
        Ok(())
    } else {
        let mut residue: Vec<String> = degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n)
            .collect();
        residue.sort();
        Err(residue)
    }
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;
