//! End-to-end routing scenarios
//!
//! - Scenario A: token filtering picks the larger backend
//! - Scenario B: a caller's preferred backend beats priority
//! - Scenario C: disabling a backend fails requests already queued for it
//! - Scenario D: 100 concurrent requests on one backend never overlap

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::task::JoinSet;

use common::{scenario_document, start_router, OutcomeLog, ScriptedExecutor, OUTPUT_TOKENS};
use dispatcher_core::{
    CallerPreferences, DispatchFailure, DispatchStatus, RouterSettings, SelectionCriteria,
    SelectionReason, SubmitRequest,
};

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Scenario A
// =============================================================================

#[tokio::test]
async fn scenario_a_token_filter_selects_big() {
    let executor = ScriptedExecutor::new();
    let (router, _) = start_router(
        RouterSettings::default(),
        scenario_document(),
        Arc::clone(&executor),
    );

    let criteria = SelectionCriteria::new(["text_generation"]).with_token_estimate(5000);
    assert_eq!(router.select(&criteria).unwrap().backend_id, "big");

    let receipt = router
        .submit(
            SubmitRequest::new(json!("summarize this"))
                .with_capabilities(["text_generation"])
                .with_token_estimate(5000),
            |_| {},
        )
        .unwrap();

    assert_eq!(receipt.backend_id, "big");
    assert_eq!(receipt.status, DispatchStatus::Pending);

    router.shutdown().await;
    assert_eq!(executor.labels_for("big"), vec!["summarize this"]);
}

// =============================================================================
// Scenario B
// =============================================================================

#[tokio::test]
async fn scenario_b_caller_preference_beats_priority() {
    let executor = ScriptedExecutor::new();
    let (router, _) = start_router(
        RouterSettings::default(),
        scenario_document(),
        Arc::clone(&executor),
    );

    // Without a preference, priority picks fast
    let criteria = SelectionCriteria::new(["text_generation"])
        .with_token_estimate(100)
        .with_caller("alice");
    assert_eq!(router.select(&criteria).unwrap().backend_id, "fast");

    router
        .update_caller_preferences("alice", CallerPreferences::preferring("big"))
        .unwrap();

    let outcome = router
        .submit_and_wait(
            SubmitRequest::new(json!("hello"))
                .with_capabilities(["text_generation"])
                .with_token_estimate(100)
                .with_caller("alice"),
        )
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.backend_id, "big");
    assert_eq!(outcome.caller_id.as_deref(), Some("alice"));

    let selection = router.select(&criteria).unwrap();
    assert_eq!(selection.reason, SelectionReason::CallerPreference);
}

// =============================================================================
// Scenario C
// =============================================================================

#[tokio::test]
async fn scenario_c_disable_fails_queued_requests() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("fast");
    let (router, _) = start_router(
        RouterSettings::default(),
        scenario_document(),
        Arc::clone(&executor),
    );
    let log = OutcomeLog::new();

    // Occupy the single lane with a request held at the gate
    let blocker = router
        .submit(SubmitRequest::new(json!("blocker")).pinned_to("fast"), log.handler())
        .unwrap();
    let queued = router
        .submit(
            SubmitRequest::new(json!("for big"))
                .with_capabilities(["text_generation"])
                .with_token_estimate(5000),
            log.handler(),
        )
        .unwrap();
    assert_eq!(queued.backend_id, "big");

    router.disable_backend("big").unwrap();

    let listed: Vec<_> = router
        .list_backends(None, None)
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(listed, vec!["fast"]);

    gate.add_permits(1);
    assert!(log.wait_for(2, WAIT).await);

    let outcome = log.get(&queued.request_id).unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.result, Err(DispatchFailure::BackendNotFound));
    assert_eq!(outcome.error().as_deref(), Some("backend not found"));
    assert!(outcome.started_at.is_none());

    assert!(log.get(&blocker.request_id).unwrap().is_success());
    assert!(executor.labels_for("big").is_empty());
}

// =============================================================================
// Scenario D
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_hundred_requests_never_overlap() {
    let executor = ScriptedExecutor::new();
    executor.delay("fast", Duration::from_millis(1));
    let (router, _) = start_router(
        RouterSettings::default(),
        scenario_document(),
        Arc::clone(&executor),
    );

    let mut callers = JoinSet::new();
    for caller in 0..10 {
        let router = Arc::clone(&router);
        callers.spawn(async move {
            let mut receivers = Vec::new();
            for n in 0..10 {
                let request = SubmitRequest::new(json!(format!("caller {caller} request {n}")))
                    .with_caller(format!("caller-{caller}"))
                    .pinned_to("fast");
                let (_, rx) = router.submit_with_receiver(request).unwrap();
                receivers.push(rx);
            }
            let mut delivered = 0;
            for rx in receivers {
                if rx.await.is_ok() {
                    delivered += 1;
                }
            }
            delivered
        });
    }

    let mut delivered = 0;
    while let Some(result) = callers.join_next().await {
        delivered += result.unwrap();
    }
    assert_eq!(delivered, 100);

    let stats = router.stats("fast").unwrap();
    assert_eq!(stats.total_requests, 100);
    // Each payload is four words
    assert_eq!(stats.total_tokens, 100 * (4 + OUTPUT_TOKENS));
    assert_eq!(executor.overlaps(), 0);

    let mut history = router.history(1000, None);
    assert_eq!(history.len(), 100);
    history.sort_by_key(|r| r.started_at);
    for pair in history.windows(2) {
        assert!(
            pair[1].started_at >= pair[0].completed_at,
            "{} started before {} completed",
            pair[1].request_id,
            pair[0].request_id
        );
    }

    assert_eq!(router.history(1000, Some("caller-3")).len(), 10);
}
