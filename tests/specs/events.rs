// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event delivery guarantees: pairing, drops, and subscriber lifecycle

use crate::prelude::*;
use cv_core::{EventKind, PipelineId, SubscriberId};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn each_step_transition_emits_exactly_one_event() {
    let engine = engine_with_pool(4);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "paired", "name": "paired",
            "stages": [ { "id": "main", "steps": [
                { "id": "a", "type": "sleep", "config": { "sleepMs": 10 } },
                { "id": "b", "type": "sleep", "config": { "sleepMs": 10 } },
                { "id": "c", "type": "sleep", "config": { "sleepMs": 10 }, "dependsOn": ["a", "b"] },
            ] } ],
        })))
        .unwrap();

    let pid = PipelineId::new("paired");
    let mut sub = subscribe(&engine, "paired");
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut sub, &run_id).await;

    let mut counts: HashMap<(EventKind, Option<String>), usize> = HashMap::new();
    for event in &events {
        *counts
            .entry((event.kind, event.step_id.clone()))
            .or_default() += 1;
    }
    for id in ["a", "b", "c"] {
        let id = Some(id.to_string());
        assert_eq!(counts[&(EventKind::StepStarted, id.clone())], 1);
        assert_eq!(counts[&(EventKind::StepCompleted, id)], 1);
    }
    assert_eq!(counts[&(EventKind::RunStarted, None)], 1);
    assert_eq!(counts[&(EventKind::RunCompleted, None)], 1);
}

#[tokio::test]
async fn slow_subscribers_drop_with_a_counter_not_a_stall() {
    let engine = engine_with_pool(4);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    let steps: Vec<serde_json::Value> = (0..8)
        .map(|n| serde_json::json!({ "id": format!("s{n}"), "type": "sleep", "config": { "sleepMs": 5 } }))
        .collect();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "noisy", "name": "noisy",
            "stages": [ { "id": "main", "steps": steps } ],
        })))
        .unwrap();

    // Tiny sink that is never drained while the run emits.
    let slow = engine
        .subscribe(SubscriberId::new("slow"), Some(2))
        .unwrap();
    let mut healthy = subscribe(&engine, "healthy");

    let pid = PipelineId::new("noisy");
    let run_id = engine.execute_run(&pid).unwrap();
    let events = collect_run_events(&mut healthy, &run_id).await;

    // 8 steps x 2 events + run start/end.
    assert_eq!(events.len(), 18, "healthy subscriber sees everything");
    assert!(
        slow.dropped_count() > 0,
        "the full sink must count its drops"
    );
    assert_eq!(
        engine.dropped_count(slow.id()),
        Some(slow.dropped_count()),
        "drop counter is visible through the facade"
    );
}

#[tokio::test]
async fn unsubscribed_sinks_stop_receiving() {
    let engine = engine_with_pool(4);
    engine.register_plugin(Arc::new(SleepPlugin)).unwrap();
    engine
        .create_pipeline(pipeline(serde_json::json!({
            "id": "bye", "name": "bye",
            "stages": [ { "id": "main", "steps": [
                { "id": "a", "type": "sleep", "config": { "sleepMs": 10 } },
            ] } ],
        })))
        .unwrap();

    let mut sub = subscribe(&engine, "bye");
    engine.unsubscribe(sub.id()).unwrap();

    let pid = PipelineId::new("bye");
    let run_id = engine.execute_run(&pid).unwrap();
    wait_terminal(&engine, &pid, &run_id).await;

    assert!(sub.recv().await.is_none(), "closed sink ends after drain");
}
