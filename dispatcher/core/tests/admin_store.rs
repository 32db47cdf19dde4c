//! Administrative mutations against a file-backed store
//!
//! Persistence across restarts, degraded stores, external edits and
//! rejected changes.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use common::{scenario_document, ScriptedExecutor};
use dispatcher_core::{
    AdminError, BackendDefinition, BackendKind, ConfigStore, DispatchError, Executor,
    FileConfigStore, RegistryError, Router, RouterSettings, RoutingRulesPatch, SelectionCriteria,
    StoreDocument, SubmitRequest,
};

fn file_router(path: &std::path::Path) -> Router {
    Router::start(
        RouterSettings::default(),
        Arc::new(FileConfigStore::new(path)) as Arc<dyn ConfigStore>,
        ScriptedExecutor::new() as Arc<dyn Executor>,
    )
}

fn seeded_store(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("backends.toml");
    FileConfigStore::new(&path)
        .save(&scenario_document())
        .unwrap();
    path
}

fn ids(router: &Router) -> Vec<String> {
    router
        .list_backends(None, None)
        .into_iter()
        .map(|b| b.id)
        .collect()
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn changes_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);

    let router = file_router(&path);
    router
        .add_backend(
            BackendDefinition::new("coder", BackendKind::Local)
                .with_capabilities(["code_generation"])
                .with_max_tokens(8000)
                .with_priority(3),
        )
        .unwrap();
    router.disable_backend("fast").unwrap();
    router
        .update_routing_rules(RoutingRulesPatch {
            default_backend: Some("big".to_string()),
            ..Default::default()
        })
        .unwrap();
    router.shutdown().await;

    let restarted = file_router(&path);
    assert_eq!(ids(&restarted), vec!["big", "coder"]);

    let persisted = FileConfigStore::new(&path).load().unwrap();
    assert!(!persisted.backends["fast"].enabled);
    assert_eq!(persisted.routing_rules.default_backend.as_deref(), Some("big"));

    // With nothing mapped for the capability, the new default answers
    let selection = restarted
        .select(&SelectionCriteria::new(["translation"]))
        .unwrap();
    assert_eq!(selection.backend_id, "big");
    restarted.shutdown().await;
}

#[tokio::test]
async fn remove_requires_disable_first() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let router = file_router(&path);

    assert!(matches!(
        router.remove_backend("big"),
        Err(AdminError::Registry(RegistryError::BackendStillEnabled(_)))
    ));

    router.disable_backend("big").unwrap();
    let removed = router.remove_backend("big").unwrap();
    assert_eq!(removed.id, "big");

    let persisted = FileConfigStore::new(&path).load().unwrap();
    assert!(!persisted.backends.contains_key("big"));
    router.shutdown().await;
}

#[tokio::test]
async fn missing_store_file_starts_empty_and_is_created_on_first_change() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("backends.toml");
    let router = file_router(&path);

    assert!(ids(&router).is_empty());
    router
        .add_backend(
            BackendDefinition::new("solo", BackendKind::Local).with_capabilities(["text_generation"]),
        )
        .unwrap();

    assert!(path.exists());
    assert_eq!(ids(&router), vec!["solo"]);
    router.shutdown().await;
}

// =============================================================================
// Degraded Stores
// =============================================================================

#[tokio::test]
async fn corrupt_store_at_startup_gives_empty_router() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backends.toml");
    std::fs::write(&path, "[backends.fast\nthis is not toml").unwrap();

    let router = file_router(&path);
    assert!(ids(&router).is_empty());

    let rejected = router.submit(
        SubmitRequest::new(json!("hello")).with_capabilities(["text_generation"]),
        |_| {},
    );
    assert_eq!(rejected.unwrap_err(), DispatchError::NoBackendResolved);
    router.shutdown().await;
}

#[tokio::test]
async fn corrupt_store_at_startup_refuses_changes_and_keeps_file() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let mut damaged = std::fs::read_to_string(&path).unwrap();
    damaged.push_str("\n[backends.broken\n");
    std::fs::write(&path, &damaged).unwrap();

    let router = file_router(&path);
    let version = router.snapshot_version();

    let refused = router.add_backend(
        BackendDefinition::new("extra", BackendKind::Cloud).with_capabilities(["translation"]),
    );
    assert!(matches!(refused, Err(AdminError::Store(_))));
    assert!(matches!(
        router.update_caller_preferences("dave", Default::default()),
        Err(AdminError::Store(_))
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), damaged);
    assert_eq!(router.snapshot_version(), version);
    assert!(ids(&router).is_empty());

    // Once the file is repaired and reloaded, changes go through again
    FileConfigStore::new(&path)
        .save(&scenario_document())
        .unwrap();
    router.reload().unwrap();
    router
        .add_backend(BackendDefinition::new("extra", BackendKind::Cloud))
        .unwrap();

    let persisted = FileConfigStore::new(&path).load().unwrap();
    assert!(persisted.backends.contains_key("fast"));
    assert!(persisted.backends.contains_key("extra"));
    router.shutdown().await;
}

#[tokio::test]
async fn corrupt_store_after_startup_falls_back_to_last_known_document() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let router = file_router(&path);

    std::fs::write(&path, "garbage = [").unwrap();
    router
        .add_backend(BackendDefinition::new("extra", BackendKind::Cloud).with_cost_per_token(0.001))
        .unwrap();

    let persisted = FileConfigStore::new(&path).load().unwrap();
    let persisted_ids: Vec<_> = persisted.backends.keys().cloned().collect();
    assert_eq!(persisted_ids, vec!["big", "extra", "fast"]);
    assert_eq!(ids(&router), vec!["extra", "fast", "big"]);
    router.shutdown().await;
}

// =============================================================================
// Reload
// =============================================================================

#[tokio::test]
async fn reload_picks_up_external_edits_and_resets_counters() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let router = file_router(&path);

    router
        .submit_and_wait(SubmitRequest::new(json!("one two")).pinned_to("fast"))
        .await
        .unwrap();
    assert_eq!(router.stats("fast").unwrap().total_requests, 1);

    let store = FileConfigStore::new(&path);
    let mut edited = store.load().unwrap();
    edited.backends.get_mut("big").unwrap().priority = 0;
    store.save(&edited).unwrap();

    let before = router.snapshot_version();
    let version = router.reload().unwrap();
    assert!(version > before);

    assert_eq!(ids(&router), vec!["big", "fast"]);
    assert_eq!(router.stats("fast").unwrap().total_requests, 0);
    router.shutdown().await;
}

#[tokio::test]
async fn failed_reload_keeps_current_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let router = file_router(&path);
    let before = router.snapshot_version();

    std::fs::write(&path, "[[[").unwrap();
    assert!(matches!(router.reload(), Err(AdminError::Store(_))));

    assert_eq!(router.snapshot_version(), before);
    assert_eq!(ids(&router), vec!["fast", "big"]);
    router.shutdown().await;
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn rejected_changes_are_not_applied() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let router = file_router(&path);
    let version = router.snapshot_version();

    assert!(matches!(
        router.add_backend(BackendDefinition::new("fast", BackendKind::Local)),
        Err(AdminError::Registry(RegistryError::DuplicateBackend(_)))
    ));
    assert!(matches!(
        router.add_backend(
            BackendDefinition::new("negative", BackendKind::Cloud).with_cost_per_token(-1.0)
        ),
        Err(AdminError::Registry(RegistryError::InvalidDefinition { .. }))
    ));
    assert!(matches!(
        router.update_backend("ghost", BackendDefinition::new("ghost", BackendKind::Local)),
        Err(AdminError::Registry(RegistryError::UnknownBackend(_)))
    ));
    assert!(matches!(
        router.enable_backend("ghost"),
        Err(AdminError::Registry(RegistryError::UnknownBackend(_)))
    ));

    assert_eq!(router.snapshot_version(), version);
    assert_eq!(FileConfigStore::new(&path).load().unwrap(), seeded());
    router.shutdown().await;
}

#[tokio::test]
async fn record_usage_requires_enabled_backend() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let router = file_router(&path);

    let cost = router.record_usage("big", 1000).unwrap();
    assert!((cost - 0.02).abs() < 1e-9);
    assert_eq!(router.stats("big").unwrap().total_tokens, 1000);

    router.disable_backend("big").unwrap();
    assert!(matches!(
        router.record_usage("big", 10),
        Err(AdminError::Registry(RegistryError::UnknownBackend(_)))
    ));
    assert!(router.stats("big").is_none());
    router.shutdown().await;
}

#[tokio::test]
async fn caller_exclusions_hide_backends_from_listing() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir);
    let router = file_router(&path);

    let mut preferences = BTreeMap::new();
    preferences.insert(
        "dave".to_string(),
        dispatcher_core::CallerPreferences::default().excluding("fast"),
    );
    router
        .update_routing_rules(RoutingRulesPatch {
            caller_preferences: Some(preferences),
            ..Default::default()
        })
        .unwrap();

    let for_dave: Vec<_> = router
        .list_backends(None, Some("dave"))
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(for_dave, vec!["big"]);

    let code_only: Vec<_> = router
        .list_backends(Some("code_generation"), None)
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(code_only, vec!["big"]);

    let selection = router
        .select(
            &SelectionCriteria::new(["text_generation"])
                .with_token_estimate(10)
                .with_caller("dave"),
        )
        .unwrap();
    assert_eq!(selection.backend_id, "big");
    router.shutdown().await;
}

/// The scenario document as it reads back from disk
fn seeded() -> StoreDocument {
    let text = scenario_document().to_toml().unwrap();
    StoreDocument::from_toml(&text).unwrap()
}
