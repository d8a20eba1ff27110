//! Update check tests against a scripted update server.

mod common;

use common::{latest, record, Harness};
use otakit::{
    ActivationPhase, CheckOutcome, DelayKind, EventKind, LatestResponse, LifecycleEvent, OtaError,
    UpdaterConfig, UpdaterEvent,
};

// ============================================================================
// Request
// ============================================================================

#[tokio::test]
async fn test_request_carries_identity_and_versions() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness.source.respond(latest("1.0.0", Some(false)));

    updater.get_latest(true).await.unwrap();
    let requests = harness.source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].device_id, updater.get_id());
    // On builtin the native version stands in for the bundle version
    assert_eq!(requests[0].version_name, "1.0.0");
    assert_eq!(requests[0].version_build, "1.0.0");
    assert_eq!(requests[0].platform, "ios");
    assert_eq!(requests[0].plugin_version, updater.get_plugin_version());
}

#[tokio::test]
async fn test_request_reports_current_bundle_version() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness.source.respond(latest("1.1.0", Some(false)));
    let queued = updater.get_latest(true).await.unwrap();
    let CheckOutcome::Queued { bundle } = queued.outcome else {
        panic!("expected queued, got {:?}", queued.outcome);
    };
    updater.set(&bundle.id).unwrap();
    updater.notify_app_ready().unwrap();

    harness.source.respond(latest("1.1.0", Some(false)));
    let again = updater.get_latest(true).await.unwrap();
    assert_eq!(again.outcome, CheckOutcome::UpToDate);
    assert_eq!(harness.source.requests()[1].version_name, "1.1.0");
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn test_same_version_is_up_to_date() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness.source.respond(latest("1.0.0", None));

    let result = updater.get_latest(true).await.unwrap();
    assert_eq!(result.outcome, CheckOutcome::UpToDate);
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn test_major_update_is_only_announced() {
    let harness = Harness::new();
    let updater = harness.restart();
    let majors = record(&updater, EventKind::MajorAvailable);
    harness.source.respond(latest("2.0.0", Some(true)));

    let result = updater.get_latest(true).await.unwrap();
    assert!(result.major);
    assert_eq!(result.outcome, CheckOutcome::MajorAvailable);

    let majors = majors.lock().unwrap();
    assert_eq!(
        *majors,
        vec![UpdaterEvent::MajorAvailable {
            version: "2.0.0".into()
        }]
    );
    assert_eq!(harness.transport.calls(), 0);
    assert!(updater.list().is_empty());
    assert!(updater.current().bundle.is_builtin());
    assert_eq!(updater.phase(), ActivationPhase::NoPending);
}

#[tokio::test]
async fn test_major_inferred_from_version_numbers() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness.source.respond(latest("2.1.0", None));

    let result = updater.get_latest(true).await.unwrap();
    assert!(result.major);
    assert_eq!(result.outcome, CheckOutcome::MajorAvailable);
}

#[tokio::test]
async fn test_major_applied_when_allowed() {
    let harness = Harness::with_config(UpdaterConfig {
        allow_major_auto_update: true,
        ..UpdaterConfig::default()
    });
    let updater = harness.restart();
    harness.source.respond(latest("2.0.0", Some(true)));

    let result = updater.get_latest(true).await.unwrap();
    assert!(matches!(result.outcome, CheckOutcome::Queued { .. }));
}

#[tokio::test]
async fn test_minor_update_is_queued_as_next() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness.source.respond(latest("1.1.0", Some(false)));

    let result = updater.get_latest(true).await.unwrap();
    let CheckOutcome::Queued { bundle } = result.outcome else {
        panic!("expected queued, got {:?}", result.outcome);
    };
    assert_eq!(bundle.version, "1.1.0");
    assert_eq!(updater.phase(), ActivationPhase::PendingNext);
    // Not rendered until the next lifecycle checkpoint
    assert!(updater.current().bundle.is_builtin());

    // Asking again does not download twice
    harness.source.respond(latest("1.1.0", Some(false)));
    let again = updater.get_latest(true).await.unwrap();
    assert_eq!(again.outcome, CheckOutcome::Queued { bundle: bundle.clone() });
    assert_eq!(harness.transport.calls(), 1);

    drop(updater);
    let updater = harness.restart();
    assert_eq!(updater.current().bundle.id, bundle.id);
}

#[tokio::test]
async fn test_older_version_is_still_applied() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness.source.respond(latest("0.9.0", Some(false)));

    let result = updater.get_latest(true).await.unwrap();
    let CheckOutcome::Queued { bundle } = result.outcome else {
        panic!("expected queued, got {:?}", result.outcome);
    };
    assert_eq!(bundle.version, "0.9.0");
    assert_eq!(harness.transport.calls(), 1);
}

#[tokio::test]
async fn test_delay_stages_update_until_satisfied() {
    let harness = Harness::new();
    let updater = harness.restart();
    updater.set_delay(DelayKind::Background, None).unwrap();
    harness.source.respond(latest("1.1.0", Some(false)));

    let result = updater.get_latest(true).await.unwrap();
    let CheckOutcome::Staged { bundle } = result.outcome else {
        panic!("expected staged, got {:?}", result.outcome);
    };
    assert_eq!(updater.phase(), ActivationPhase::PendingNext);

    assert!(updater.on_lifecycle(LifecycleEvent::Foreground).unwrap().is_none());
    assert!(updater.on_lifecycle(LifecycleEvent::Background).unwrap().is_none());
    let promoted = updater.on_lifecycle(LifecycleEvent::Foreground).unwrap();
    assert_eq!(promoted.map(|b| b.id), Some(bundle.id.clone()));
    assert_eq!(updater.current().bundle.id, bundle.id);
}

#[tokio::test]
async fn test_cancelled_delay_releases_staged_bundle() {
    let harness = Harness::new();
    let updater = harness.restart();
    updater
        .set_delay(DelayKind::Date, Some("2099-01-01T00:00:00Z".into()))
        .unwrap();
    harness.source.respond(latest("1.1.0", Some(false)));
    let result = updater.get_latest(true).await.unwrap();
    assert!(matches!(result.outcome, CheckOutcome::Staged { .. }));

    updater.cancel_delay().unwrap();
    let promoted = updater.on_lifecycle(LifecycleEvent::Foreground).unwrap();
    assert_eq!(promoted.map(|b| b.version), Some("1.1.0".to_string()));
}

#[tokio::test]
async fn test_delay_ignored_when_not_allowed() {
    let harness = Harness::new();
    let updater = harness.restart();
    updater.set_delay(DelayKind::Kill, None).unwrap();
    harness.source.respond(latest("1.1.0", Some(false)));

    let result = updater.get_latest(false).await.unwrap();
    assert!(matches!(result.outcome, CheckOutcome::Queued { .. }));
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_error_field_is_server_error() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness.source.respond(LatestResponse {
        error: Some("no_channel".into()),
        ..LatestResponse::default()
    });

    let err = updater.get_latest(true).await.unwrap_err();
    assert!(matches!(err, OtaError::ServerError { ref message, .. } if message == "no_channel"));
    assert!(updater.list().is_empty());
}

#[tokio::test]
async fn test_missing_version_is_server_error() {
    let harness = Harness::new();
    let updater = harness.restart();
    let err = updater.get_latest(true).await.unwrap_err();
    assert_eq!(err.code(), "server_error");
}

#[tokio::test]
async fn test_transport_error_propagates() {
    let harness = Harness::new();
    let updater = harness.restart();
    harness
        .source
        .fail(OtaError::NetworkError("connection refused".into()));

    let err = updater.get_latest(true).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(harness.transport.calls(), 0);
}
