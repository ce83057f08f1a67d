// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Linear chains execute in dependency order with causal events

use crate::prelude::*;
use cv_core::{EventKind, PipelineId, RunStatus, StepStatus};
use std::sync::Arc;

#[tokio::test]
async fn chain_runs_in_order_with_causal_events() {
    let engine = engine_with_pool(4);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "linear", "name": "linear",
            "stages": [ { "id": "main", "steps": [
                { "id": "s1", "type": "sleep", "config": { "sleepMs": 50 } },
                { "id": "s2", "type": "sleep", "config": { "sleepMs": 50 }, "dependsOn": ["s1"] },
                { "id": "s3", "type": "sleep", "config": { "sleepMs": 50 }, "dependsOn": ["s2"] },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("linear");
    let mut sub = subscribe(&engine, "linear");
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut sub, &run_id).await;

    let step = |id: &str| Some(id.to_string());
    assert_eq!(
        shape(&events),
        vec![
            (EventKind::RunStarted, None),
            (EventKind::StepStarted, step("s1")),
            (EventKind::StepCompleted, step("s1")),
            (EventKind::StepStarted, step("s2")),
            (EventKind::StepCompleted, step("s2")),
            (EventKind::StepStarted, step("s3")),
            (EventKind::StepCompleted, step("s3")),
            (EventKind::RunCompleted, None),
        ]
    );
    for event in &events {
        if event.kind == EventKind::StepCompleted {
            assert_eq!(event.data["status"], "success");
        }
    }
    assert_eq!(events.last().unwrap().data["status"], "success");

    let run = wait_terminal(&engine, &pid, &run_id).await;
    assert_eq!(run.status, RunStatus::Success);
    for id in ["s1", "s2", "s3"] {
        let step = &run.steps[id];
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.attempts, 1);
        assert!(step.started_at_ms.unwrap() <= step.ended_at_ms.unwrap());
        assert_eq!(step.outputs["sleptMs"], 50);
    }
}

#[tokio::test]
async fn flat_pipeline_without_stages_runs_the_same() {
    let engine = engine_with_pool(4);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "flat", "name": "flat",
            "steps": [
                { "id": "a", "type": "sleep", "config": { "sleepMs": 10 } },
                { "id": "b", "type": "sleep", "config": { "sleepMs": 10 }, "dependsOn": ["a"] },
            ],
        })))
        .unwrap();

    let pid = PipelineId::new("flat");
    let run_id = engine.execute_run(&pid).unwrap();
    let run = wait_terminal(&engine, &pid, &run_id).await;

    assert_eq!(run.status, RunStatus::Success);
    assert!(
        run.steps["a"].ended_at_ms.unwrap() <= run.steps["b"].started_at_ms.unwrap(),
        "b must start after a finishes"
    );
}
