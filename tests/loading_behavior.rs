//! Behavior-driven tests for loading-state tracking
//!
//! These tests verify HOW the registry reflects in-flight work to a
//! subscribing UI: lifecycle visibility, error grace periods, timeouts and
//! aggregate batch progress.

use coral_core::{
    error::ApiError,
    loading::{
        BatchStep, LoadingEntry, LoadingOptions, LoadingTracker, OperationKind, ERROR_GRACE_PERIOD,
    },
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Loading Tracker: Lifecycle
// =============================================================================

#[tokio::test]
async fn a_successful_operation_appears_and_then_vanishes() {
    let tracker = LoadingTracker::new();

    let id = tracker.start_operation(
        OperationKind::Api,
        "loading customers",
        LoadingOptions::default(),
    );

    let entries = tracker.loading_operations();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation.description, "loading customers");
    assert!(entries[0].state.is_loading);
    assert!(tracker.is_any_loading());

    tracker.finish_operation(&id, None);
    assert!(tracker.loading_operations().is_empty());
    assert!(!tracker.is_any_loading());
}

#[tokio::test(start_paused = true)]
async fn a_failed_operation_stays_visible_for_the_grace_period() {
    let tracker = LoadingTracker::new();
    let id = tracker.start_operation(OperationKind::Api, "saving deal", LoadingOptions::default());

    tracker.finish_operation(&id, Some("boom"));

    // Immediately after the failure the UI can still show it.
    let entry = tracker.operation(&id).expect("entry lingers");
    assert!(!entry.state.is_loading);
    assert_eq!(entry.state.error.as_deref(), Some("boom"));

    // Once the grace period elapses it is gone.
    tokio::time::sleep(ERROR_GRACE_PERIOD + Duration::from_millis(100)).await;
    assert!(tracker.operation(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn a_timed_out_operation_fails_itself_with_the_standard_message() {
    let tracker = LoadingTracker::new();
    let id = tracker.start_operation(
        OperationKind::Computation,
        "generating report",
        LoadingOptions {
            timeout: Some(Duration::from_millis(200)),
            ..LoadingOptions::default()
        },
    );

    tokio::time::sleep(Duration::from_millis(250)).await;

    let entry = tracker.operation(&id).expect("entry lingers in error state");
    assert_eq!(entry.state.error.as_deref(), Some("Operation timed out"));
    assert!(!entry.state.is_loading);
}

// =============================================================================
// Loading Tracker: Subscriptions
// =============================================================================

#[tokio::test]
async fn subscribers_see_every_registry_change_until_they_unsubscribe() {
    let tracker = LoadingTracker::new();
    let snapshots: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);

    let subscription = tracker.subscribe(Arc::new(move |entries: &[LoadingEntry]| {
        sink.lock().expect("sink lock").push(entries.len());
    }));

    let id = tracker.start_operation(OperationKind::File, "export", LoadingOptions::default());
    tracker.finish_operation(&id, None);

    assert_eq!(*snapshots.lock().expect("sink lock"), vec![1, 0]);

    assert!(tracker.unsubscribe(subscription));
    tracker.start_operation(OperationKind::File, "export again", LoadingOptions::default());
    assert_eq!(
        *snapshots.lock().expect("sink lock"),
        vec![1, 0],
        "unsubscribed listeners stay silent"
    );
}

// =============================================================================
// Loading Tracker: Wrappers
// =============================================================================

#[tokio::test]
async fn with_loading_rethrows_after_recording_the_failure() {
    let tracker = LoadingTracker::new();

    let result: Result<(), ApiError> = tracker
        .with_loading(OperationKind::Api, "save proposal", async {
            Err(ApiError::http(500, "server exploded"))
        })
        .await;

    let error = result.expect_err("wrapper must rethrow");
    assert_eq!(error.status(), Some(500));

    // The recorded failure is what the UI renders during the grace period.
    let entries = tracker.loading_operations();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].state.error.as_deref(),
        Some("server exploded (core.http)")
    );
}

#[tokio::test]
async fn batch_progress_tracks_declared_weights() {
    let tracker = LoadingTracker::new();
    let progress_seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress_seen);

    tracker.subscribe(Arc::new(move |entries: &[LoadingEntry]| {
        if let Some(progress) = entries.first().and_then(|entry| entry.state.progress) {
            sink.lock().expect("sink lock").push(progress);
        }
    }));

    // Three steps weighted 1/1/2: expect 25%, 50%, 100%.
    let results = tracker
        .with_batch_loading(
            OperationKind::Database,
            "initial sync",
            vec![
                BatchStep::new(1, async { Ok("customers") }).with_label("customers synced"),
                BatchStep::new(1, async { Ok("leads") }).with_label("leads synced"),
                BatchStep::new(2, async { Ok("deals") }).with_label("deals synced"),
            ],
        )
        .await
        .expect("batch succeeds");

    assert_eq!(results, vec!["customers", "leads", "deals"]);
    let observed = progress_seen.lock().expect("sink lock").clone();
    for milestone in [25, 50, 100] {
        assert!(
            observed.contains(&milestone),
            "expected {milestone}% in {observed:?}"
        );
    }
}

// =============================================================================
// Loading Tracker: Global State
// =============================================================================

#[tokio::test]
async fn the_global_message_lives_independently_of_entries() {
    let tracker = LoadingTracker::new();

    tracker.set_global_message(Some(String::from("Reconnecting…")));
    assert_eq!(tracker.global_message().as_deref(), Some("Reconnecting…"));
    assert!(!tracker.is_any_loading(), "a global message is not an operation");

    let id = tracker.start_operation(OperationKind::Api, "fetch", LoadingOptions::default());
    tracker.set_global_message(None);
    assert_eq!(tracker.global_message(), None);
    assert!(tracker.is_any_loading(), "clearing the message leaves entries alone");
    tracker.finish_operation(&id, None);
}

#[tokio::test]
async fn stale_entries_are_cleaned_up_to_bound_memory() {
    let tracker = LoadingTracker::new();
    tracker.start_operation(OperationKind::Api, "orphaned spinner", LoadingOptions::default());
    tracker.start_operation(OperationKind::Api, "another orphan", LoadingOptions::default());

    assert_eq!(tracker.cleanup_stale(Duration::from_secs(300)), 0);
    assert_eq!(tracker.cleanup_stale(Duration::ZERO), 2);
    assert!(tracker.loading_operations().is_empty());
}
