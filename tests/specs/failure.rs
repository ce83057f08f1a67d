// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exhausted failures mark the run failed and skip dependents

use crate::prelude::*;
use cv_core::{EventKind, PipelineId, RunStatus, StepStatus};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

#[tokio::test]
async fn exhausted_step_fails_run_and_skips_dependent() {
    let engine = engine_with_pool(4);
    engine
        .register_plugin(Arc::new(FlakyPlugin {
            remaining: Arc::new(AtomicU32::new(u32::MAX)),
        }))
        .unwrap();
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "doomed", "name": "doomed",
            "stages": [ { "id": "main", "steps": [
                {
                    "id": "x",
                    "type": "flaky",
                    "retry": { "maxAttempts": 2, "interval": "PT0.01S" },
                },
                { "id": "y", "type": "sleep", "dependsOn": ["x"] },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("doomed");
    let mut sub = subscribe(&engine, "doomed");
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut sub, &run_id).await;

    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);

    let x = &run.steps["x"];
    assert_eq!(x.status, StepStatus::Failed);
    assert_eq!(x.attempts, 2);
    assert_eq!(x.exit_code, Some(1));
    assert_eq!(x.error.as_deref(), Some("transient failure"));

    let y = &run.steps["y"];
    assert_eq!(y.status, StepStatus::Skipped);
    assert_eq!(y.reason.as_deref(), Some("upstream_failed"));
    assert!(y.started_at_ms.is_none(), "skipped steps never start");

    let x_completed = events
        .iter()
        .find(|e| e.kind == EventKind::StepCompleted && e.step_id.as_deref() == Some("x"))
        .unwrap();
    assert_eq!(x_completed.data["status"], "failed");
    assert_eq!(x_completed.data["errorKind"], "plugin_error");

    let y_skipped = events
        .iter()
        .find(|e| e.kind == EventKind::StepSkipped && e.step_id.as_deref() == Some("y"))
        .unwrap();
    assert_eq!(y_skipped.data["reason"], "upstream_failed");

    assert_eq!(events.last().unwrap().data["status"], "failed");
}

#[tokio::test]
async fn failed_stage_skips_needing_stage_end_to_end() {
    let engine = engine_with_pool(4);
    engine
        .register_plugin(Arc::new(FlakyPlugin {
            remaining: Arc::new(AtomicU32::new(u32::MAX)),
        }))
        .unwrap();
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "staged", "name": "staged",
            "stages": [
                { "id": "build", "steps": [ { "id": "compile", "type": "flaky" } ] },
                {
                    "id": "deploy",
                    "needs": ["build"],
                    "steps": [ { "id": "ship", "type": "sleep" } ],
                },
            ],
        })))
        .unwrap();

    let pid = PipelineId::new("staged");
    let mut sub = subscribe(&engine, "staged");
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut sub, &run_id).await;

    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps["compile"].status, StepStatus::Failed);
    assert_eq!(run.steps["ship"].status, StepStatus::Skipped);
    assert_eq!(run.steps["ship"].reason.as_deref(), Some("upstream_failed"));
    assert!(
        events
            .iter()
            .all(|e| !(e.kind == EventKind::StepStarted
                && e.step_id.as_deref() == Some("ship"))),
        "a skipped stage's steps never start"
    );
}
