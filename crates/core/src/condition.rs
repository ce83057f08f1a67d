// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Conditional-execution predicates.
//!
//! A `when` clause on a stage or step gates dispatch. All present fields
//! must pass (logical AND); an empty condition always passes. A step or
//! stage whose condition fails is skipped, and the skip satisfies
//! downstream dependencies as if it had succeeded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Predicate evaluated against the run's context before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Wildcard match against the run's branch ref (`main`, `release/*`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Match against the terminal status of the pipeline's previous run
    /// (`success`, `failed`); useful for cleanup/notification steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Wildcard match against the full ref, covering tag refs the `branch`
    /// shorthand does not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Condition {
    pub fn evaluate(&self, ctx: &RunContext) -> bool {
        if let Some(branch) = &self.branch {
            if !wildcard_match(branch, &ctx.branch) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            match &ctx.prior_status {
                Some(prior) => {
                    if !status.eq_ignore_ascii_case(prior) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(pattern) = &self.pattern {
            if !wildcard_match(pattern, &ctx.branch) {
                return false;
            }
        }
        true
    }
}

/// Facts a condition is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Branch ref the run is executing for (from the pipeline's `BRANCH`
    /// environment entry; empty when unset).
    pub branch: String,
    /// Terminal status of the pipeline's most recent prior run.
    pub prior_status: Option<String>,
    /// Resolved pipeline environment.
    pub vars: HashMap<String, String>,
}

/// Glob-lite matcher: `*` matches any (possibly empty) substring, all other
/// characters match literally.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // Backtrack: let the last star swallow one more character.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
#[path = "condition_tests.rs"]
mod tests;
