//! Integration tests for the commit protocol.
//!
//! These tests validate:
//! - the completed commit file carries JSON commit metadata
//! - a write with auto-commit disabled stays INFLIGHT until committed
//! - failed records block the commit unless `commit_on_errors` is set
//! - the marker directory of an instant is gone once it completes
//! - the fail-safe consistency guard gates completion on file visibility
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lakeline_core::action::ActionError;
use lakeline_core::client::WriteClient;
use lakeline_core::config::{
    ConsistencyGuardConfig, ConsistencyPolicy, TableConfig, TableType, WriteConfig,
};
use lakeline_core::consistency::{FailSafeConsistencyGuard, FileLister};
use lakeline_core::engine::LocalEngine;
use lakeline_core::index::InMemoryIndex;
use lakeline_core::metadata::{CommitMetadata, ROLLING_STAT_METADATA_KEY, WriteOperationType};
use lakeline_core::model::{Record, RecordKey};
use lakeline_core::storage::{StorageResult, TableLocation, layout};
use lakeline_core::table::Table;
use lakeline_core::timeline::{ActionType, Instant, InstantTime};
use serde_json::json;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ==================== Test Helpers ====================

async fn create_table(
    tmp: &TempDir,
    write_config: WriteConfig,
) -> Result<Table<LocalEngine>, Box<dyn std::error::Error>> {
    Ok(Table::create(
        TableLocation::local(tmp.path()),
        TableConfig::new("commits", TableType::CopyOnWrite),
        write_config.with_auto_clean(false),
        LocalEngine::new(),
        Arc::new(InMemoryIndex::new()),
    )
    .await?)
}

fn record(k: &str, v: i64) -> Record {
    Record::new(RecordKey::new(k, "2024/01/01"), json!({ "v": v }))
}

fn fast_fail_safe(max_checks: u32) -> ConsistencyGuardConfig {
    ConsistencyGuardConfig {
        policy: ConsistencyPolicy::FailSafe,
        initial_check_interval_ms: 1,
        max_check_interval_ms: 4,
        max_checks,
    }
}

/// A listing that never shows any file, like a store whose listings lag
/// indefinitely.
struct BlindLister;

#[async_trait]
impl FileLister for BlindLister {
    async fn list_file_names(&self, _partition_path: &str) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }
}

// ==================== Commit metadata ====================

#[tokio::test]
async fn completed_commit_carries_json_metadata() -> TestResult {
    let tmp = TempDir::new()?;
    let mut client = WriteClient::new(create_table(&tmp, WriteConfig::default()).await?);

    let ts = InstantTime::new("001");
    client
        .upsert(&ts, vec![record("a", 1), record("b", 2)])
        .await?;

    let rel = layout::instant_rel_path(&Instant::completed("001", ActionType::Commit).file_name());
    let bytes = tokio::fs::read(tmp.path().join(rel)).await?;
    let metadata = CommitMetadata::from_json_bytes(&bytes)?;

    assert_eq!(metadata.operation_type, WriteOperationType::Upsert);
    assert!(!metadata.compacted);
    assert_eq!(metadata.total_records_written(), 2);
    assert_eq!(metadata.partition_write_stats("2024/01/01").len(), 1);
    assert!(metadata.metadata(ROLLING_STAT_METADATA_KEY).is_some());
    Ok(())
}

#[tokio::test]
async fn manual_commit_publishes_extra_metadata() -> TestResult {
    let tmp = TempDir::new()?;
    let config = WriteConfig::default().with_auto_commit(false);
    let mut client = WriteClient::new(create_table(&tmp, config).await?);

    let ts = client.start_commit().await?;
    let output = client.insert(&ts, vec![record("a", 1)]).await?;
    assert!(client.table().timeline().is_pending(&ts));
    assert!(tmp.path().join(layout::marker_rel_dir(ts.as_str())).exists());

    let extra = BTreeMap::from([("checkpoint".to_string(), "42".to_string())]);
    let metadata = client
        .commit(&ts, &output, WriteOperationType::Insert, extra)
        .await?;

    assert_eq!(metadata.metadata("checkpoint"), Some("42"));
    assert!(client.table().timeline().is_completed(&ts));
    assert!(!tmp.path().join(layout::marker_rel_dir(ts.as_str())).exists());
    Ok(())
}

// ==================== Failed records ====================

#[tokio::test]
async fn failed_records_block_the_commit() -> TestResult {
    let tmp = TempDir::new()?;
    let config = WriteConfig::default().with_auto_commit(false);
    let mut client = WriteClient::new(create_table(&tmp, config).await?);

    let ts = client.start_commit().await?;
    let mut statuses = client.insert(&ts, vec![record("a", 1)]).await?;
    let failed_key = RecordKey::new("a", "2024/01/01");
    statuses[0].mark_failure(&failed_key, "schema mismatch");

    let err = client
        .commit_statuses(&ts, &statuses, WriteOperationType::Insert)
        .await
        .unwrap_err();
    assert!(
        matches!(err, ActionError::WriteErrors { error_count: 1, .. }),
        "unexpected error: {err}"
    );
    assert!(client.table().timeline().is_pending(&ts));
    Ok(())
}

#[tokio::test]
async fn commit_on_errors_commits_anyway() -> TestResult {
    let tmp = TempDir::new()?;
    let config = WriteConfig::default()
        .with_auto_commit(false)
        .with_commit_on_errors(true);
    let mut client = WriteClient::new(create_table(&tmp, config).await?);

    let ts = client.start_commit().await?;
    let mut statuses = client
        .insert(&ts, vec![record("a", 1), record("b", 2)])
        .await?;
    statuses[0].mark_failure(&RecordKey::new("b", "2024/01/01"), "bad payload");

    client
        .commit_statuses(&ts, &statuses, WriteOperationType::Insert)
        .await?;
    assert!(client.table().timeline().is_completed(&ts));
    Ok(())
}

// ==================== Consistency guard ====================

#[tokio::test]
async fn fail_safe_guard_commits_once_files_are_listed() -> TestResult {
    let tmp = TempDir::new()?;
    let config = WriteConfig::default().with_consistency(fast_fail_safe(3));
    let mut client = WriteClient::new(create_table(&tmp, config).await?);

    let ts = client.start_commit().await?;
    client.upsert(&ts, vec![record("a", 1)]).await?;
    assert!(client.table().timeline().is_completed(&ts));
    Ok(())
}

#[tokio::test]
async fn fail_safe_guard_leaves_the_instant_inflight_on_timeout() -> TestResult {
    let tmp = TempDir::new()?;
    let guard = Arc::new(FailSafeConsistencyGuard::new(BlindLister, fast_fail_safe(2)));
    let table = create_table(&tmp, WriteConfig::default())
        .await?
        .with_consistency_guard(guard);
    let mut client = WriteClient::new(table);

    let ts = client.start_commit().await?;
    let err = client.upsert(&ts, vec![record("a", 1)]).await.unwrap_err();
    assert!(
        matches!(err, ActionError::Commit { .. }),
        "unexpected error: {err}"
    );
    assert!(client.table().timeline().is_pending(&ts));
    Ok(())
}
