// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plugin registry.
//!
//! Maps plugin names to handlers, with a secondary index from step type to
//! plugin name. Registration is additive at startup; names and step-type
//! claims are never replaced.

use crate::error::EngineError;
use crate::plugin::{Plugin, PluginManifest};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct RegistryState {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    /// step type → plugin name
    step_types: HashMap<String, String>,
}

/// Registry of step handlers. Cheap to clone.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its manifest name and claim its step types.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        let manifest = plugin.manifest();
        let mut state = self.state.write();
        if state.plugins.contains_key(&manifest.name) {
            return Err(EngineError::DuplicatePlugin(manifest.name));
        }
        for step_type in &manifest.step_types {
            if let Some(owner) = state.step_types.get(step_type) {
                return Err(EngineError::DuplicateStepType {
                    step_type: step_type.clone(),
                    plugin: owner.clone(),
                });
            }
        }
        for step_type in &manifest.step_types {
            state
                .step_types
                .insert(step_type.clone(), manifest.name.clone());
        }
        tracing::info!(
            plugin = %manifest.name,
            step_types = ?manifest.step_types,
            "plugin registered"
        );
        state.plugins.insert(manifest.name.clone(), plugin);
        Ok(())
    }

    /// Resolve a handler by plugin name.
    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.state.read().plugins.get(name).cloned()
    }

    /// Resolve a handler through the step-type index.
    pub fn plugin_for_type(&self, step_type: &str) -> Option<Arc<dyn Plugin>> {
        let state = self.state.read();
        let name = state.step_types.get(step_type)?;
        state.plugins.get(name).cloned()
    }

    pub fn has_step_type(&self, step_type: &str) -> bool {
        self.state.read().step_types.contains_key(step_type)
    }

    /// Manifests of all registered plugins, in no particular order.
    pub fn manifests(&self) -> Vec<PluginManifest> {
        self.state
            .read()
            .plugins
            .values()
            .map(|p| p.manifest())
            .collect()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
