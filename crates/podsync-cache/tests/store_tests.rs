//! Integration tests for SqliteCheckpointStore
//!
//! These tests verify the ICheckpointStore methods against an in-memory
//! SQLite database. Each test function creates a fresh database to keep
//! tests isolated; one test reopens a file-backed database to check that
//! state survives a restart.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use podsync_cache::{DatabasePool, SqliteCheckpointStore};
use podsync_core::domain::{
    newtypes::{BatchId, JobId, RemoteId},
    ActiveRateLimit, DiscoveredEntity, EntityKind, EntityStatus, FailedUnit, JobCompletion,
    ParentIds, QuotaCategory, ScanCounters, ScanSummary, TraversalCheckpoint, UnitKind,
};
use podsync_core::ports::ICheckpointStore;

// ============================================================================
// Test helpers
// ============================================================================

async fn setup() -> SqliteCheckpointStore {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    SqliteCheckpointStore::new(pool.pool().clone())
}

fn counters() -> ScanCounters {
    ScanCounters {
        organizations: 2,
        workspaces: 3,
        apps: 5,
        items: 120,
        files: 4,
        bytes: 4096,
    }
}

fn completion() -> JobCompletion {
    JobCompletion {
        summary: ScanSummary::from_counters(&counters(), Utc::now()),
        failed_units: Vec::new(),
        active_limit: None,
    }
}

fn app_entity(job: JobId, app: u64) -> DiscoveredEntity {
    DiscoveredEntity::new(
        job,
        EntityKind::App,
        ParentIds {
            organization: Some(RemoteId::new(1)),
            workspace: Some(RemoteId::new(10)),
            app: None,
        },
        RemoteId::new(app),
        "Deals",
        PathBuf::from("/backup/Acme/Sales/Deals"),
    )
    .with_item_count(42)
}

// ============================================================================
// Job tests
// ============================================================================

#[tokio::test]
async fn test_begin_and_get_job() {
    let store = setup().await;
    let id = store.begin_job(Some("nightly")).await.unwrap();

    let job = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.id(), &id);
    assert_eq!(job.title(), Some("nightly"));
    assert!(!job.is_cancelled());
    assert!(job.summary().is_none());

    assert!(store.get_job(&JobId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_latest_job_is_most_recent() {
    let store = setup().await;
    assert!(store.latest_job().await.unwrap().is_none());

    let _first = store.begin_job(None).await.unwrap();
    let second = store.begin_job(None).await.unwrap();

    assert_eq!(store.latest_job().await.unwrap().unwrap().id(), &second);
}

#[tokio::test]
async fn test_find_incomplete_job() {
    let store = setup().await;
    assert!(store.find_incomplete_job().await.unwrap().is_none());

    let id = store.begin_job(None).await.unwrap();
    assert_eq!(store.find_incomplete_job().await.unwrap().unwrap().id(), &id);
}

#[tokio::test]
async fn test_cancelled_job_is_never_incomplete() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    store.mark_cancelled(&id).await.unwrap();

    assert!(store.find_incomplete_job().await.unwrap().is_none());
    assert!(store.get_job(&id).await.unwrap().unwrap().is_cancelled());
}

#[tokio::test]
async fn test_newer_cancelled_job_supersedes_older_incomplete() {
    let store = setup().await;
    let _older = store.begin_job(None).await.unwrap();
    let newer = store.begin_job(None).await.unwrap();
    store.mark_cancelled(&newer).await.unwrap();

    assert!(store.find_incomplete_job().await.unwrap().is_none());
}

#[tokio::test]
async fn test_mark_cancelled_unknown_job_fails() {
    let store = setup().await;
    assert!(store.mark_cancelled(&JobId::new()).await.is_err());
}

#[tokio::test]
async fn test_finalize_job_stores_summary() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();

    let summary = store.finalize_job(&id, &completion()).await.unwrap();
    assert_eq!(summary.apps, 5);

    let job = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.summary(), Some(&summary));
    assert!(store.find_incomplete_job().await.unwrap().is_none());
}

#[tokio::test]
async fn test_finalize_rejects_failed_units_in_completion() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();

    let mut completion = completion();
    completion.failed_units.push(FailedUnit::new(
        UnitKind::Organization,
        RemoteId::new(2),
        "Beta",
        "quota exhausted",
        3,
    ));

    assert!(store.finalize_job(&id, &completion).await.is_err());
    assert!(store.get_job(&id).await.unwrap().unwrap().summary().is_none());
}

#[tokio::test]
async fn test_finalize_rejects_active_limit() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();

    let mut completion = completion();
    completion.active_limit = Some(ActiveRateLimit::new(
        QuotaCategory::Heavyweight,
        Utc::now() + chrono::Duration::minutes(30),
    ));

    assert!(store.finalize_job(&id, &completion).await.is_err());
}

#[tokio::test]
async fn test_finalize_rejects_unresolved_units_in_store() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    store
        .record_failed_unit(
            &id,
            &FailedUnit::new(UnitKind::Export, RemoteId::new(100), "Deals", "batch failed", 1),
        )
        .await
        .unwrap();

    assert!(store.finalize_job(&id, &completion()).await.is_err());

    store
        .resolve_failed_unit(&id, UnitKind::Export, RemoteId::new(100))
        .await
        .unwrap();
    assert!(store.finalize_job(&id, &completion()).await.is_ok());
}

#[tokio::test]
async fn test_finalize_cancelled_job_fails() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    store.mark_cancelled(&id).await.unwrap();

    assert!(store.finalize_job(&id, &completion()).await.is_err());
}

#[tokio::test]
async fn test_find_recent_completed() {
    let store = setup().await;
    let old = store.begin_job(None).await.unwrap();
    let stale = JobCompletion {
        summary: ScanSummary::from_counters(&counters(), Utc::now() - chrono::Duration::hours(3)),
        failed_units: Vec::new(),
        active_limit: None,
    };
    store.finalize_job(&old, &stale).await.unwrap();

    let window = Duration::from_secs(3600);
    assert!(store.find_recent_completed(window).await.unwrap().is_none());

    let fresh = store.begin_job(None).await.unwrap();
    store.finalize_job(&fresh, &completion()).await.unwrap();
    let found = store.find_recent_completed(window).await.unwrap().unwrap();
    assert_eq!(found.id(), &fresh);
}

// ============================================================================
// Checkpoint tests
// ============================================================================

#[tokio::test]
async fn test_save_and_load_checkpoint() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    assert!(store.load_checkpoint(&id).await.unwrap().is_none());

    let mut checkpoint = TraversalCheckpoint::new(id, 3);
    checkpoint.begin_organization(2);
    checkpoint.begin_workspace(4);
    checkpoint.complete_apps(2).unwrap();
    checkpoint.set_counters(counters());
    store.save_checkpoint(&id, &checkpoint).await.unwrap();

    let loaded = store.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(loaded.cursor(), (0, 0, 2));
    assert_eq!(loaded.org_total(), 3);
    assert_eq!(loaded.flags(), checkpoint.flags());
    assert_eq!(loaded.counters(), &counters());
}

#[tokio::test]
async fn test_checkpoint_advances_and_rejects_regression() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();

    let mut checkpoint = TraversalCheckpoint::new(id, 3);
    checkpoint.begin_organization(1);
    checkpoint.complete_workspace();
    checkpoint.complete_organization();
    store.save_checkpoint(&id, &checkpoint).await.unwrap();

    // Saving the same cursor again is allowed
    store.save_checkpoint(&id, &checkpoint).await.unwrap();

    let behind = TraversalCheckpoint::new(id, 3);
    assert!(store.save_checkpoint(&id, &behind).await.is_err());

    let loaded = store.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(loaded.org_index(), 1);
}

#[tokio::test]
async fn test_checkpoint_for_other_job_rejected() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    let other = store.begin_job(None).await.unwrap();

    let checkpoint = TraversalCheckpoint::new(other, 1);
    assert!(store.save_checkpoint(&id, &checkpoint).await.is_err());
}

// ============================================================================
// Entity tests
// ============================================================================

#[tokio::test]
async fn test_save_and_get_entity() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    let file = DiscoveredEntity::new(
        id,
        EntityKind::File,
        ParentIds {
            organization: Some(RemoteId::new(1)),
            workspace: Some(RemoteId::new(10)),
            app: Some(RemoteId::new(100)),
        },
        RemoteId::new(5001),
        "contract.pdf",
        PathBuf::from("/backup/Acme/Sales/Deals/files/contract.pdf"),
    )
    .with_size(2048)
    .with_mime_type("application/pdf")
    .with_download_url("https://files.podio.com/5001");
    store.save_entity(&file).await.unwrap();

    let loaded = store
        .get_entity(&id, EntityKind::File, RemoteId::new(5001))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, file);
}

#[tokio::test]
async fn test_save_entity_is_idempotent() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    store.save_entity(&app_entity(id, 100)).await.unwrap();
    store
        .update_entity_status(&id, EntityKind::App, RemoteId::new(100), &EntityStatus::Exported)
        .await
        .unwrap();

    // Rediscovery during a redo leaves the stored record alone
    store.save_entity(&app_entity(id, 100)).await.unwrap();

    let apps = store.list_entities(&id, Some(EntityKind::App)).await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].status(), &EntityStatus::Exported);
}

#[tokio::test]
async fn test_update_status_keeps_failure_reason() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    store.save_entity(&app_entity(id, 100)).await.unwrap();

    let failed = EntityStatus::Failed("batch reported failure".to_string());
    store
        .update_entity_status(&id, EntityKind::App, RemoteId::new(100), &failed)
        .await
        .unwrap();

    let loaded = store
        .get_entity(&id, EntityKind::App, RemoteId::new(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.status(), &failed);
}

#[tokio::test]
async fn test_update_unknown_entity_fails() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    let result = store
        .update_entity_status(&id, EntityKind::App, RemoteId::new(1), &EntityStatus::Exported)
        .await;
    assert!(result.is_err());
    assert!(store
        .set_export_batch(&id, RemoteId::new(1), Some(BatchId::new(9)))
        .await
        .is_err());
}

#[tokio::test]
async fn test_set_and_clear_export_batch() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    store.save_entity(&app_entity(id, 100)).await.unwrap();

    store
        .set_export_batch(&id, RemoteId::new(100), Some(BatchId::new(900)))
        .await
        .unwrap();
    let app = store
        .get_entity(&id, EntityKind::App, RemoteId::new(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(app.export_batch(), Some(BatchId::new(900)));
    assert_eq!(app.item_count(), Some(42));

    store.set_export_batch(&id, RemoteId::new(100), None).await.unwrap();
    let app = store
        .get_entity(&id, EntityKind::App, RemoteId::new(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(app.export_batch(), None);
}

#[tokio::test]
async fn test_list_entities_filters_by_kind_and_job() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    let other = store.begin_job(None).await.unwrap();

    let org = DiscoveredEntity::new(
        id,
        EntityKind::Organization,
        ParentIds::default(),
        RemoteId::new(1),
        "Acme",
        PathBuf::from("/backup/Acme"),
    );
    store.save_entity(&org).await.unwrap();
    store.save_entity(&app_entity(id, 100)).await.unwrap();
    store.save_entity(&app_entity(id, 101)).await.unwrap();
    store.save_entity(&app_entity(other, 100)).await.unwrap();

    assert_eq!(store.list_entities(&id, None).await.unwrap().len(), 3);
    let apps = store.list_entities(&id, Some(EntityKind::App)).await.unwrap();
    assert_eq!(
        apps.iter().map(|a| a.remote_id()).collect::<Vec<_>>(),
        vec![RemoteId::new(100), RemoteId::new(101)]
    );
    assert_eq!(store.list_entities(&other, None).await.unwrap().len(), 1);
}

// ============================================================================
// Failed unit tests
// ============================================================================

#[tokio::test]
async fn test_record_replaces_previous_failure() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();

    store
        .record_failed_unit(
            &id,
            &FailedUnit::new(UnitKind::Organization, RemoteId::new(2), "Beta", "quota", 3),
        )
        .await
        .unwrap();
    store
        .record_failed_unit(
            &id,
            &FailedUnit::new(UnitKind::Organization, RemoteId::new(2), "Beta", "network", 6),
        )
        .await
        .unwrap();

    let units = store.list_failed_units(&id).await.unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].reason(), "network");
    assert_eq!(units[0].attempts(), 6);
    assert_eq!(units[0].name(), "Beta");
}

#[tokio::test]
async fn test_resolve_missing_unit_is_noop() {
    let store = setup().await;
    let id = store.begin_job(None).await.unwrap();
    store
        .resolve_failed_unit(&id, UnitKind::App, RemoteId::new(7))
        .await
        .unwrap();
    assert!(store.list_failed_units(&id).await.unwrap().is_empty());
}

// ============================================================================
// Active rate limit tests
// ============================================================================

#[tokio::test]
async fn test_active_limits_round_trip() {
    let store = setup().await;
    assert!(store.load_active_limits().await.unwrap().is_empty());

    let resume_at = Utc::now() + chrono::Duration::minutes(20);
    let heavy = ActiveRateLimit::new(QuotaCategory::Heavyweight, resume_at);
    let general = ActiveRateLimit::new(QuotaCategory::Lightweight, resume_at);
    store.save_active_limit(&heavy).await.unwrap();
    store.save_active_limit(&general).await.unwrap();

    let limits = store.load_active_limits().await.unwrap();
    assert_eq!(limits.len(), 2);
    assert_eq!(limits[0].category(), QuotaCategory::Lightweight);
    assert_eq!(limits[1].category(), QuotaCategory::Heavyweight);

    // A later save replaces the earlier deadline
    let later = ActiveRateLimit::new(QuotaCategory::Heavyweight, resume_at + chrono::Duration::minutes(5));
    store.save_active_limit(&later).await.unwrap();
    let limits = store.load_active_limits().await.unwrap();
    assert_eq!(limits.len(), 2);
    assert_eq!(limits[1].resume_at(), later.resume_at());

    store.clear_active_limit(QuotaCategory::Heavyweight).await.unwrap();
    let limits = store.load_active_limits().await.unwrap();
    assert_eq!(limits, vec![general]);
}

// ============================================================================
// File-backed database
// ============================================================================

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("podsync.db");

    let id = {
        let pool = DatabasePool::new(&db_path).await.unwrap();
        let store = SqliteCheckpointStore::new(pool.pool().clone());
        let id = store.begin_job(Some("before restart")).await.unwrap();
        let mut checkpoint = TraversalCheckpoint::new(id, 4);
        checkpoint.begin_organization(0);
        checkpoint.complete_organization();
        store.save_checkpoint(&id, &checkpoint).await.unwrap();
        pool.close().await;
        id
    };

    let pool = DatabasePool::new(&db_path).await.unwrap();
    let store = SqliteCheckpointStore::new(pool.pool().clone());
    let job = store.find_incomplete_job().await.unwrap().unwrap();
    assert_eq!(job.id(), &id);
    assert_eq!(job.title(), Some("before restart"));
    let checkpoint = store.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor(), (1, 0, 0));
}
