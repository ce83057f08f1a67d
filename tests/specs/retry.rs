// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry policies re-run failing steps with observable events

use crate::prelude::*;
use cv_core::{EventKind, PipelineId, RunStatus, StepStatus};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let engine = engine_with_pool(4);
    engine
        .register_plugin(Arc::new(FlakyPlugin {
            remaining: Arc::new(AtomicU32::new(2)),
        }))
        .unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "retry", "name": "retry",
            "stages": [ { "id": "main", "steps": [
                {
                    "id": "f",
                    "type": "flaky",
                    "retry": { "maxAttempts": 3, "interval": "PT0.01S" },
                },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("retry");
    let mut sub = subscribe(&engine, "retry");
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut sub, &run_id).await;

    let step = |id: &str| Some(id.to_string());
    assert_eq!(
        shape(&events),
        vec![
            (EventKind::RunStarted, None),
            (EventKind::StepStarted, step("f")),
            (EventKind::StepRetried, step("f")),
            (EventKind::StepRetried, step("f")),
            (EventKind::StepCompleted, step("f")),
            (EventKind::RunCompleted, None),
        ]
    );
    let retried: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == EventKind::StepRetried)
        .map(|e| e.data["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(retried, vec![2, 3]);

    let completed = events
        .iter()
        .find(|e| e.kind == EventKind::StepCompleted)
        .unwrap();
    assert_eq!(completed.data["status"], "success");
    assert_eq!(completed.data["attempts"], 3);

    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.steps["f"].attempts, 3);
}

#[tokio::test]
async fn retries_are_silent_between_events() {
    // A step that succeeds on attempt one emits no step.retried.
    let engine = engine_with_pool(4);
    engine
        .register_plugin(Arc::new(FlakyPlugin {
            remaining: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "steady", "name": "steady",
            "stages": [ { "id": "main", "steps": [
                {
                    "id": "f",
                    "type": "flaky",
                    "retry": { "maxAttempts": 3, "interval": "PT0.01S" },
                },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("steady");
    let mut sub = subscribe(&engine, "steady");
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut sub, &run_id).await;

    assert!(events.iter().all(|e| e.kind != EventKind::StepRetried));
    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.steps["f"].status, StepStatus::Success);
    assert_eq!(run.steps["f"].attempts, 1);
}

#[tokio::test]
async fn exponential_backoff_spaces_attempts_out() {
    let engine = engine_with_pool(4);
    engine
        .register_plugin(Arc::new(FlakyPlugin {
            remaining: Arc::new(AtomicU32::new(2)),
        }))
        .unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "backoff", "name": "backoff",
            "stages": [ { "id": "main", "steps": [
                {
                    "id": "f",
                    "type": "flaky",
                    "retry": { "maxAttempts": 3, "interval": "PT0.02S", "exponential": true },
                },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("backoff");
    let run_id = engine.execute_run(&pid).unwrap();
    let run = wait_terminal(&engine, &pid, &run_id).await;

    assert_eq!(run.status, RunStatus::Success);
    let step = &run.steps["f"];
    // 20ms + 40ms of backoff must separate first start from last attempt.
    let span = step.ended_at_ms.unwrap() - step.started_at_ms.unwrap();
    assert!(span >= 60, "expected >= 60ms of backoff, saw {span}ms");
}
