// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cache fingerprints.
//!
//! A fingerprint identifies a cacheable step outcome:
//! `sha256(pipeline_id, step_id, step_type, canonical(config), resolved_key)`
//! where `canonical` renders JSON with lexicographically sorted object keys
//! at every level, so semantically equal configs hash identically.

use cv_core::{PipelineId, Step};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Compute the fingerprint for a cacheable step.
///
/// A step with an explicit cache key is identified by that key (plus type
/// and config), so identical work declared in different stages coalesces
/// into one flight. A keyless cache config stays scoped to the step id.
pub fn step_fingerprint(pipeline_id: &PipelineId, step: &Step, resolved_key: &str) -> String {
    let keyed = step.cache.as_ref().is_some_and(|c| !c.key.is_empty());
    let scope = if keyed { "" } else { step.id.as_str() };
    let mut hasher = Sha256::new();
    for part in [
        pipeline_id.as_str(),
        scope,
        &step.step_type,
        &canonical_json(&serde_json::Value::Object(step.config.clone())),
        resolved_key,
    ] {
        hasher.update(part.as_bytes());
        // NUL-separate so ("ab","c") and ("a","bc") differ.
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Render JSON with object keys sorted lexicographically at every level.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Resolve `${env.NAME}` references in a cache key template against the
/// step's effective environment. Unknown references resolve empty.
pub fn resolve_key_template(template: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${env.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "${env.".len()..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = env.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference: keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
#[path = "fingerprint_tests.rs"]
mod tests;
