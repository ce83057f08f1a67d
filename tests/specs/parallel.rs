// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Independent steps within a stage run concurrently

use crate::prelude::*;
use cv_core::{EventKind, PipelineId, RunStatus};
use std::sync::Arc;
use std::time::Instant;

#[tokio::test]
async fn independent_steps_overlap() {
    let engine = engine_with_pool(4);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "par", "name": "par",
            "stages": [ { "id": "main", "steps": [
                { "id": "a", "type": "sleep", "config": { "sleepMs": 100 } },
                { "id": "b", "type": "sleep", "config": { "sleepMs": 100 } },
                { "id": "c", "type": "sleep", "config": { "sleepMs": 100 } },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("par");
    let mut sub = subscribe(&engine, "par");
    let started = Instant::now();
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut sub, &run_id).await;
    let elapsed = started.elapsed();

    // Every step starts before any step completes.
    let first_completed = events
        .iter()
        .position(|e| e.kind == EventKind::StepCompleted)
        .unwrap();
    let started_count = events[..first_completed]
        .iter()
        .filter(|e| e.kind == EventKind::StepStarted)
        .count();
    assert_eq!(started_count, 3, "all three must start before any completes");

    assert!(
        elapsed.as_millis() < 250,
        "three 100ms steps must overlap, took {elapsed:?}"
    );

    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn pool_of_one_serializes_execution() {
    let engine = engine_with_pool(1);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "serial", "name": "serial",
            "stages": [ { "id": "main", "steps": [
                { "id": "a", "type": "sleep", "config": { "sleepMs": 30 } },
                { "id": "b", "type": "sleep", "config": { "sleepMs": 30 } },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("serial");
    let run_id = engine.execute_run(&pid).unwrap();
    let run = wait_terminal(&engine, &pid, &run_id).await;

    assert_eq!(run.status, RunStatus::Success);
    let (a, b) = (&run.steps["a"], &run.steps["b"]);
    let overlap = a.started_at_ms.unwrap() < b.ended_at_ms.unwrap()
        && b.started_at_ms.unwrap() < a.ended_at_ms.unwrap();
    assert!(!overlap, "one worker must serialize the two steps");
}
