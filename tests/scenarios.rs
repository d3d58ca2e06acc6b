//! End-to-end migration scenarios driven through the orchestrator
#![allow(clippy::unwrap_used)]

mod common;

use common::*;

use kvshift::config::Config;
use kvshift::hybrid::{UserMigrationOutcome, WriteOutcome};
use kvshift::migration::MigrationOutcome;
use kvshift::orchestrator::{
    MigrationRequest, MigrationStrategy, Orchestrator, OrchestratorEvent, EVENT_PRE_MIGRATION,
};
use kvshift::state::MigrationStep;
use kvshift::store::keys::{sessions_key, USERS_KEY};
use kvshift::store::{write_dataset, FileKvStore, KeyValueStore, MemoryRemoteStore, RemoteTable};
use kvshift::validator::{DatasetValidator, ValidationOptions};

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_clean_export_is_ready_for_migration() {
    let h = harness(&sample_dataset(3));

    let extraction = h.orchestrator.extractor().extract_all().unwrap();
    assert!(extraction.skipped.is_empty());
    let result = DatasetValidator::new(ValidationOptions::default()).validate(&extraction.dataset);

    assert_eq!(result.counts.valid_users, 3);
    assert_eq!(result.counts.valid_sessions, 15);
    assert_eq!(result.counts.invalid_sessions, 0);
    assert!(result.score >= 90, "score {}", result.score);
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.message.contains("ready for migration")));
}

#[test]
fn test_reversed_time_range_invalidates_only_the_session() {
    let mut dataset = sample_dataset(3);
    let session = &mut dataset.sessions.get_mut("user-2").unwrap()[0];
    session.end_time = Some("2024-01-03T09:00:00Z".into());

    let result = DatasetValidator::new(ValidationOptions::default()).validate(&dataset);

    assert!(!result.is_valid);
    assert_eq!(result.counts.invalid_sessions, 1);
    assert_eq!(result.counts.valid_sessions, 14);
    assert_eq!(result.counts.valid_users, 3);
    let failing: Vec<_> = result
        .errors
        .all()
        .filter(|i| i.rule == "valid_time_range")
        .collect();
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].record_id.as_deref(), Some("user-2-s1"));
}

// ============================================================================
// Safe strategy
// ============================================================================

#[tokio::test]
async fn test_safe_migration_copies_everything() {
    let h = harness(&sample_dataset(3));

    let result = h
        .orchestrator
        .start_migration(MigrationRequest::default())
        .await;
    assert!(result.success, "{:?}", result.error);

    let outcome = result.data.unwrap();
    let report = outcome.report.unwrap();
    assert_eq!(report.outcome, MigrationOutcome::Success);
    assert_eq!(report.completed_steps.len(), MigrationStep::total());
    assert_eq!(report.transfer.users_migrated, 3);
    assert!(report.verification.unwrap().passed);

    assert_eq!(h.remote.row_count(RemoteTable::Users), 3);
    assert_eq!(h.remote.row_count(RemoteTable::Stats), 3);
    assert_eq!(h.remote.row_count(RemoteTable::Sessions), 15);
    assert_eq!(h.remote.row_count(RemoteTable::Meetings), 0);

    let status = h.orchestrator.get_status().data.unwrap();
    assert!(status.users.values().all(|u| u.migrated));
    assert_eq!(status.migration.unwrap().progress, 100);
    assert_eq!(
        status.latest_backup.map(|b| b.id),
        outcome.backup_id
    );
}

#[tokio::test]
async fn test_second_safe_run_skips_migrated_users() {
    let h = harness(&sample_dataset(2));
    assert!(
        h.orchestrator
            .start_migration(MigrationRequest::default())
            .await
            .success
    );

    let result = h
        .orchestrator
        .start_migration(MigrationRequest::default())
        .await;
    assert!(result.success, "{:?}", result.error);
    let report = result.data.unwrap().report.unwrap();
    assert_eq!(report.transfer.users_skipped, 2);
    assert_eq!(report.transfer.users_migrated, 0);
    assert_eq!(h.remote.row_count(RemoteTable::Sessions), 10);
}

#[tokio::test]
async fn test_remote_violation_rolls_back_to_pre_run_backup() {
    let h = harness(&sample_dataset(3));
    let before = h.local.get(USERS_KEY).unwrap();
    h.remote.inject_violation("orphan_sessions");
    let mut rx = h.orchestrator.subscribe();

    let result = h
        .orchestrator
        .start_migration(MigrationRequest::default())
        .await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "integrity_error");
    assert!(error.message.contains("rolled back"), "{}", error.message);

    let outcome = result.data.unwrap();
    let rollback = outcome.rolled_back.unwrap();
    assert_eq!(Some(rollback.backup_id.clone()), outcome.backup_id);
    assert!(error.message.contains(&rollback.backup_id));

    // Local data matches the pre-run state and nobody counts as migrated
    assert_eq!(h.local.get(USERS_KEY).unwrap(), before);
    let status = h.orchestrator.get_status().data.unwrap();
    assert!(status.users.values().all(|u| !u.migrated));
    assert!(status.migration.is_none());

    let names: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.name()).collect();
    assert!(names.contains(&"rollbackComplete"));
    assert_eq!(names.last(), Some(&"operationError"));
}

#[tokio::test]
async fn test_dry_run_stops_after_backup() {
    let h = harness(&sample_dataset(3));

    let result = h
        .orchestrator
        .start_migration(MigrationRequest {
            dry_run: true,
            ..Default::default()
        })
        .await;
    assert!(result.success, "{:?}", result.error);

    let report = result.data.unwrap().report.unwrap();
    assert_eq!(report.outcome, MigrationOutcome::DryRun);
    assert_eq!(
        report.completed_steps,
        vec![
            MigrationStep::Export,
            MigrationStep::ValidateExport,
            MigrationStep::CreateBackup
        ]
    );
    assert_eq!(report.export.unwrap().users.len(), 3);
    assert!(report.validation.unwrap().is_valid);
    assert_eq!(h.remote.write_count(), 0);
    assert_eq!(h.remote.row_count(RemoteTable::Users), 0);
}

#[tokio::test]
async fn test_invalid_export_blocks_migration() {
    let mut dataset = sample_dataset(2);
    dataset.sessions.get_mut("user-1").unwrap()[0].end_time = Some("2024-01-01T00:00:00Z".into());
    let h = harness(&dataset);

    let result = h
        .orchestrator
        .start_migration(MigrationRequest {
            skip_health_check: true,
            ..Default::default()
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, "validation_error");
    assert_eq!(h.remote.write_count(), 0);
}

// ============================================================================
// Fast and hybrid strategies
// ============================================================================

#[tokio::test]
async fn test_fast_strategy_uses_a_snapshot() {
    let h = harness(&sample_dataset(2));

    let result = h
        .orchestrator
        .start_migration(MigrationRequest {
            strategy: MigrationStrategy::Fast,
            ..Default::default()
        })
        .await;
    assert!(result.success, "{:?}", result.error);

    let outcome = result.data.unwrap();
    assert!(outcome.health.is_none());
    let report = outcome.report.unwrap();
    assert!(report.verification.is_none());
    assert_eq!(report.backup_id, outcome.backup_id);

    let snapshots = h.orchestrator.recovery().snapshots().unwrap();
    assert!(snapshots
        .iter()
        .any(|s| s.event.as_deref() == Some(EVENT_PRE_MIGRATION)));
    assert_eq!(h.remote.row_count(RemoteTable::Users), 2);
}

#[tokio::test]
async fn test_hybrid_strategy_tolerates_failing_user() {
    let h = harness(&sample_dataset(3));
    h.remote.fail_user("user-2");

    let result = h
        .orchestrator
        .start_migration(MigrationRequest {
            strategy: MigrationStrategy::Hybrid,
            ..Default::default()
        })
        .await;
    assert!(result.success, "{:?}", result.error);

    let outcome = result.data.unwrap();
    assert!(outcome.hybrid_enabled);
    let summary = outcome.hybrid.unwrap();
    assert_eq!(summary.migrated, vec!["user-1".to_string(), "user-3".to_string()]);
    assert!(summary.failed.contains_key("user-2"));

    h.remote.heal_user("user-2");
    let outcome = h
        .orchestrator
        .hybrid()
        .migrate_user("user-2", Default::default())
        .await
        .unwrap();
    assert!(matches!(outcome, UserMigrationOutcome::Migrated { .. }));
    assert!(h.orchestrator.get_status().data.unwrap().users["user-2"].migrated);
}

#[tokio::test]
async fn test_hybrid_strategy_has_no_dry_run() {
    let h = harness(&sample_dataset(1));

    let result = h
        .orchestrator
        .start_migration(MigrationRequest {
            strategy: MigrationStrategy::Hybrid,
            dry_run: true,
            ..Default::default()
        })
        .await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, "configuration_error");
    assert!(!h.orchestrator.hybrid().is_enabled().unwrap());
}

// ============================================================================
// Hybrid sync queue
// ============================================================================

#[tokio::test]
async fn test_sync_item_fails_permanently_after_three_attempts() {
    let h = harness(&sample_dataset(1));
    assert!(
        h.orchestrator
            .start_migration(MigrationRequest {
                enable_hybrid_after: Some(true),
                ..Default::default()
            })
            .await
            .success
    );
    let hybrid = h.orchestrator.hybrid();
    assert!(hybrid.is_enabled().unwrap());

    h.remote.fail_user("user-1");
    let outcome = hybrid
        .save_session(&completed_session("user-1-s6", "user-1", 6))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);
    let writes_before = h.remote.write_count();

    for attempt in 1..=2 {
        let report = hybrid.drain().await.unwrap();
        assert_eq!(report.retried, 1, "attempt {attempt}");
        assert!(report.permanently_failed.is_empty());
    }
    let report = hybrid.drain().await.unwrap();
    assert_eq!(report.permanently_failed.len(), 1);
    assert_eq!(report.permanently_failed[0].attempts, 3);
    assert!(hybrid.pending().unwrap().is_empty());

    // Never retried a fourth time
    let report = hybrid.drain().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(h.remote.write_count() - writes_before, 3);

    // The local write stands regardless
    let sessions = h.local.get(&sessions_key("user-1")).unwrap().unwrap();
    assert!(sessions.contains("user-1-s6"));
}

#[tokio::test]
async fn test_offline_writes_drain_on_reconnect() {
    let h = harness(&sample_dataset(1));
    assert!(
        h.orchestrator
            .start_migration(MigrationRequest::default())
            .await
            .success
    );
    let hybrid = h.orchestrator.hybrid();

    hybrid.set_online(false).await.unwrap();
    let outcome = hybrid
        .save_session(&completed_session("user-1-s6", "user-1", 6))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);
    assert_eq!(h.orchestrator.get_status().data.unwrap().pending_sync, 1);

    let report = hybrid.set_online(true).await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(h.remote.row_count(RemoteTable::Sessions), 6);
    assert!(hybrid.pending().unwrap().is_empty());
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn test_manual_rollback_restores_latest_backup() {
    let h = harness(&sample_dataset(2));
    assert!(
        h.orchestrator
            .start_migration(MigrationRequest::default())
            .await
            .success
    );
    let before = h.local.get(&sessions_key("user-1")).unwrap();
    h.local.set(&sessions_key("user-1"), "[]").unwrap();

    let result = h.orchestrator.rollback_migration(None).await;
    assert!(result.success, "{:?}", result.error);
    let report = result.data.unwrap();
    assert!(report.restored_keys >= 1);
    assert_eq!(h.local.get(&sessions_key("user-1")).unwrap(), before);

    let status = h.orchestrator.get_status().data.unwrap();
    assert!(status.migration.is_none());
    assert!(status.users.values().all(|u| !u.migrated));
}

#[tokio::test]
async fn test_user_rollback_leaves_other_users_alone() {
    let h = harness(&sample_dataset(2));
    assert!(
        h.orchestrator
            .start_migration(MigrationRequest::default())
            .await
            .success
    );
    let other = h.local.get(&sessions_key("user-2")).unwrap();
    let restored = h.local.get(&sessions_key("user-1")).unwrap();
    h.local.set(&sessions_key("user-1"), "[]").unwrap();
    h.local.set(&sessions_key("user-2"), "[]").unwrap();

    let result = h.orchestrator.rollback_user("user-1", None).await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.data.unwrap().user_in_backup);

    assert_eq!(h.local.get(&sessions_key("user-1")).unwrap(), restored);
    assert_ne!(h.local.get(&sessions_key("user-2")).unwrap(), other);
}

// ============================================================================
// File-backed stores
// ============================================================================

#[tokio::test]
async fn test_file_backed_migration_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.local_path = dir.path().join("local.json");
    config.storage.remote_path = dir.path().join("remote.json");
    config.storage.backup_dir = dir.path().join("backups");

    {
        let local = FileKvStore::open(&config.storage.local_path).unwrap();
        write_dataset(&local, &sample_dataset(2)).unwrap();
    }

    let orchestrator = Orchestrator::from_config(config.clone()).unwrap();
    let result = orchestrator
        .start_migration(MigrationRequest::default())
        .await;
    assert!(result.success, "{:?}", result.error);
    let backup_id = result.data.unwrap().backup_id.unwrap();
    drop(orchestrator);

    let remote = MemoryRemoteStore::open(&config.storage.remote_path).unwrap();
    assert_eq!(remote.row_count(RemoteTable::Users), 2);
    assert_eq!(remote.row_count(RemoteTable::Sessions), 10);

    let reopened = Orchestrator::from_config(config).unwrap();
    let status = reopened.get_status().data.unwrap();
    assert!(status.migration.unwrap().completed());
    assert_eq!(status.latest_backup.unwrap().id, backup_id);
    assert_eq!(status.users.len(), 2);
}
