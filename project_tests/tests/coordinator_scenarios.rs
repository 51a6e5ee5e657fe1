//! End-to-end coordinator scenarios over the scripted API.

use std::sync::Arc;

use lib_common::tracking::{
    CoordinatorOptions, FetchError, IdentifierStore, MemoryStore, TrackingCoordinator, EVENT_DELIVERED,
};
use project_tests::{RecordingRegistry, ScriptedApi};
use serde_json::json;

fn coordinator(
    api: ScriptedApi,
    stored: &[&str],
    registry: Arc<RecordingRegistry>,
) -> TrackingCoordinator<ScriptedApi, MemoryStore> {
    let store = MemoryStore::with_identifiers(stored.iter().map(|s| s.to_string()).collect());
    TrackingCoordinator::new(api, store, registry, CoordinatorOptions::default())
}

#[tokio::test]
async fn delivered_package_is_published_and_announced_once() {
    let api = ScriptedApi::new().respond_ok("LP1", json!({"status": "Delivered", "carrier": "DHL"}));
    let coord = coordinator(api, &["LP1"], Arc::new(RecordingRegistry::new()));
    coord.load().await;
    let mut events = coord.subscribe_events();

    let snapshot = coord.refresh_all().await.unwrap();

    let record = snapshot.record("LP1").unwrap();
    assert_eq!(record.status(), Some("Delivered"));
    assert_eq!(record.carrier(), Some(&json!("DHL")));

    let event = events.try_recv().unwrap();
    assert_eq!(event.event_type(), EVENT_DELIVERED);
    assert_eq!(event.tracking_number, "LP1");
    assert_eq!(event.data, *record);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn template_identifier_is_rejected_without_io() {
    let coord = coordinator(ScriptedApi::new(), &["LP1"], Arc::new(RecordingRegistry::new()));
    coord.load().await;

    assert!(!coord.add("{{ states('input_text.x') }}").await);

    assert_eq!(coord.tracking_numbers().await, vec!["LP1"]);
    assert_eq!(coord.api().call_count(), 0);
    assert_eq!(coord.store().identifiers(), vec!["LP1"]);
}

#[tokio::test]
async fn upstream_error_on_verification_rejects_add() {
    let api = ScriptedApi::new().respond("LP2", Err(FetchError::upstream("not found")));
    let coord = coordinator(api, &[], Arc::new(RecordingRegistry::new()));
    coord.load().await;

    assert!(!coord.add("LP2").await);

    assert!(coord.tracking_numbers().await.is_empty());
    assert!(coord.store().identifiers().is_empty());
    assert_eq!(coord.api().calls(), vec!["LP2"]);
}

#[tokio::test]
async fn remove_without_projected_entity_still_succeeds() {
    let registry = Arc::new(RecordingRegistry::new());
    let coord = coordinator(ScriptedApi::new(), &["LP1"], registry.clone());
    coord.load().await;

    assert!(coord.remove("LP1").await);

    assert!(coord.tracking_numbers().await.is_empty());
    assert!(coord.store().identifiers().is_empty());
    assert_eq!(registry.removals(), vec!["LP1"]);
}

#[tokio::test]
async fn empty_and_whitespace_identifiers_are_rejected() {
    let coord = coordinator(ScriptedApi::new(), &[], Arc::new(RecordingRegistry::new()));
    coord.load().await;

    assert!(!coord.add("").await);
    assert!(!coord.add("   ").await);
    assert!(!coord.add("}}LP").await);
    assert_eq!(coord.api().call_count(), 0);
}

#[tokio::test]
async fn add_trims_identifier_before_storing() {
    let api = ScriptedApi::new().respond_ok("LP3", json!({"status": "InTransit"}));
    let coord = coordinator(api, &[], Arc::new(RecordingRegistry::new()));
    coord.load().await;

    assert!(coord.add("  LP3\t").await);

    assert_eq!(coord.tracking_numbers().await, vec!["LP3"]);
    assert_eq!(coord.store().identifiers(), vec!["LP3"]);
    assert!(coord.snapshot().contains("LP3"));
}

#[tokio::test]
async fn transport_failure_on_verification_rejects_add() {
    let coord = coordinator(ScriptedApi::new(), &[], Arc::new(RecordingRegistry::new()));
    coord.load().await;

    assert!(!coord.add("UNREACHABLE").await);
    assert!(coord.tracking_numbers().await.is_empty());
}

#[tokio::test]
async fn close_is_forwarded_to_the_client() {
    let coord = coordinator(ScriptedApi::new(), &[], Arc::new(RecordingRegistry::new()));
    coord.close();
    coord.close();
    assert_eq!(coord.api().closed(), 2);
    assert!(coord.store().load().await.unwrap().is_empty());
}
