// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancellation propagates to running and pending steps

use crate::prelude::*;
use cv_core::{EventKind, PipelineId, RunStatus, StepStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn mid_run_cancel_settles_everything_quickly() {
    let engine = engine_with_pool(4);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();

    // Ten long steps on four workers: some running, some queued.
    let steps: Vec<serde_json::Value> = (0..10)
        .map(|n| {
            serde_json::json!({
                "id": format!("s{n}"),
                "type": "sleep",
                "config": { "sleepMs": 500 },
            })
        })
        .collect();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "long", "name": "long",
            "stages": [ { "id": "main", "steps": steps } ],
        })))
        .unwrap();

    let pid = PipelineId::new("long");
    let mut sub = subscribe(&engine, "long");
    let run_id = engine.execute_run(&pid).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    engine.cancel_run(&run_id).unwrap();

    let run = wait_terminal(&engine, &pid, &run_id).await;
    let settle = cancelled_at.elapsed();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(
        settle < Duration::from_millis(300),
        "cancellation took {settle:?}"
    );
    for (id, step) in &run.steps {
        assert_eq!(
            step.status,
            StepStatus::Cancelled,
            "step {id} should be cancelled"
        );
    }
    // Steps that never got a worker must not have started.
    assert!(
        run.steps.values().any(|s| s.started_at_ms.is_none()),
        "with 10 steps on 4 workers some never dispatch"
    );

    let events = collect_run_events(&mut sub, &run_id).await;
    assert_eq!(events.last().unwrap().kind, EventKind::RunCancelled);
}

#[tokio::test]
async fn cancel_before_any_dispatch_cancels_cleanly() {
    let engine = engine_with_pool(1);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "quickdraw", "name": "quickdraw",
            "stages": [ { "id": "main", "steps": [
                { "id": "a", "type": "sleep", "config": { "sleepMs": 500 } },
                { "id": "b", "type": "sleep", "config": { "sleepMs": 500 } },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("quickdraw");
    let run_id = engine.execute_run(&pid).unwrap();
    engine.cancel_run(&run_id).unwrap();

    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run
        .steps
        .values()
        .all(|s| s.status == StepStatus::Cancelled));
}

#[tokio::test]
async fn cancelled_run_stays_cancelled() {
    let engine = engine_with_pool(2);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "final", "name": "final",
            "stages": [ { "id": "main", "steps": [
                { "id": "a", "type": "sleep", "config": { "sleepMs": 200 } },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("final");
    let run_id = engine.execute_run(&pid).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.cancel_run(&run_id).unwrap();
    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    let ended = run.ended_at_ms;

    // A later cancel request is a no-op on the terminal record.
    engine.cancel_run(&run_id).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let again = engine.get_run(&pid, &run_id).unwrap();
    assert_eq!(again.status, RunStatus::Cancelled);
    assert_eq!(again.ended_at_ms, ended);
}
