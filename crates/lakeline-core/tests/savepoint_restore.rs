//! Integration tests for savepoints, restores and compaction.
//!
//! These tests validate:
//! - restoring to a savepoint rolls back every later commit, newest first,
//!   under a single restore instant
//! - readers see the savepointed version of the data after a restore
//! - a restore refused by a savepointed target records no instant
//! - a scheduled compaction folds log files into a new base file
//! - scheduling with nothing to compact records no instant
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use lakeline_core::client::WriteClient;
use lakeline_core::config::{TableConfig, TableType, WriteConfig};
use lakeline_core::engine::LocalEngine;
use lakeline_core::fs_view::FileSystemView;
use lakeline_core::index::InMemoryIndex;
use lakeline_core::model::{Record, RecordKey};
use lakeline_core::storage::TableLocation;
use lakeline_core::table::Table;
use lakeline_core::timeline::{ActionType, InstantTime};
use serde_json::{Value, json};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ==================== Test Helpers ====================

async fn open_client(
    tmp: &TempDir,
    table_type: TableType,
) -> Result<WriteClient<LocalEngine>, Box<dyn std::error::Error>> {
    let table = Table::create(
        TableLocation::local(tmp.path()),
        TableConfig::new("restore", table_type),
        WriteConfig::default().with_auto_clean(false),
        LocalEngine::new(),
        Arc::new(InMemoryIndex::new()),
    )
    .await?;
    Ok(WriteClient::new(table))
}

fn record(k: &str, v: i64) -> Record {
    Record::new(RecordKey::new(k, "p"), json!({ "v": v }))
}

/// Merged value of every key in the latest slice of `file_id`.
async fn read_values(
    client: &WriteClient<LocalEngine>,
    file_id: &str,
) -> Result<Vec<(String, Value)>, Box<dyn std::error::Error>> {
    let table = client.table();
    let view = table.file_system_view().await?;
    let slice = view.latest_file_slice("p", file_id).expect("file slice");
    let completed = table.timeline().completed_commits_timeline();
    let rows = LocalEngine::read_slice(table.location(), &slice, &completed).await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.key.record_key, r.data))
        .collect())
}

// ==================== Restore ====================

#[tokio::test]
async fn restore_rolls_back_every_commit_after_the_savepoint() -> TestResult {
    let tmp = TempDir::new()?;
    let mut client = open_client(&tmp, TableType::CopyOnWrite).await?;

    let c1 = InstantTime::new("001");
    let c2 = InstantTime::new("002");
    let c3 = InstantTime::new("003");
    let inserted = client.upsert(&c1, vec![record("a", 1)]).await?;
    let file_id = inserted[0].file_id.clone();
    client.upsert(&c2, vec![record("a", 2)]).await?;
    client.upsert(&c3, vec![record("a", 3), record("b", 3)]).await?;

    client.savepoint(&c1, "ops", "known good").await?;
    let metadata = client.restore_to_savepoint(&c1).await?;

    assert_eq!(metadata.restored_to, c1);
    assert_eq!(metadata.instants_to_rollback, vec![c3.clone(), c2.clone()]);

    let timeline = client.table().timeline();
    assert_eq!(timeline.completed_commits_timeline().timestamps(), vec![c1]);
    let restores = timeline.restore_timeline();
    assert_eq!(restores.count_instants(), 1);
    assert!(restores.last_instant().is_some_and(|i| i.is_completed()));
    // Inner rollbacks do not publish instants of their own.
    assert!(timeline.rollback_timeline().is_empty());

    assert_eq!(
        read_values(&client, &file_id).await?,
        vec![("a".to_string(), json!({ "v": 1 }))]
    );
    Ok(())
}

#[tokio::test]
async fn refused_restore_leaves_the_timeline_unchanged() -> TestResult {
    let tmp = TempDir::new()?;
    let mut client = open_client(&tmp, TableType::CopyOnWrite).await?;

    let c1 = InstantTime::new("001");
    let c2 = InstantTime::new("002");
    let c3 = InstantTime::new("003");
    client.upsert(&c1, vec![record("a", 1)]).await?;
    client.upsert(&c2, vec![record("a", 2)]).await?;
    client.upsert(&c3, vec![record("a", 3)]).await?;
    client.savepoint(&c1, "ops", "first").await?;
    client.savepoint(&c2, "ops", "second").await?;

    // 003 could go, but the savepointed 002 blocks the restore before any
    // work starts.
    let err = client.restore_to_savepoint(&c1).await.unwrap_err();
    assert!(err.is_precondition(), "unexpected error: {err}");

    client.table_mut().reload_timeline().await?;
    let timeline = client.table().timeline();
    assert!(timeline.restore_timeline().is_empty());
    assert_eq!(
        timeline.completed_commits_timeline().timestamps(),
        vec![c1, c2.clone(), c3]
    );

    // Restoring to the newer savepoint is still possible.
    let metadata = client.restore_to_savepoint(&c2).await?;
    assert_eq!(metadata.instants_to_rollback, vec![InstantTime::new("003")]);
    Ok(())
}

#[tokio::test]
async fn savepoint_requires_a_completed_commit() -> TestResult {
    let tmp = TempDir::new()?;
    let mut client = open_client(&tmp, TableType::CopyOnWrite).await?;

    let err = client
        .savepoint(&InstantTime::new("001"), "ops", "nothing here")
        .await
        .unwrap_err();
    assert!(err.is_precondition(), "unexpected error: {err}");
    assert!(client.table().timeline().savepoint_timeline().is_empty());
    Ok(())
}

// ==================== Compaction ====================

#[tokio::test]
async fn compaction_folds_logs_into_a_new_base_file() -> TestResult {
    let tmp = TempDir::new()?;
    let mut client = open_client(&tmp, TableType::MergeOnRead).await?;

    let inserted = client
        .insert(&InstantTime::new("001"), vec![record("a", 1), record("b", 1)])
        .await?;
    let file_id = inserted[0].file_id.clone();
    client
        .upsert(&InstantTime::new("002"), vec![record("a", 2)])
        .await?;

    let compaction_time = client
        .schedule_compaction()
        .await?
        .expect("a slice with logs to compact");
    assert!(
        client
            .table()
            .timeline()
            .pending_compaction_timeline()
            .contains_timestamp(&compaction_time)
    );

    let statuses = client.compact(&compaction_time).await?;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].file_id, file_id);

    let compaction = client
        .table()
        .timeline()
        .get(&compaction_time, ActionType::Compaction)
        .cloned()
        .expect("compaction instant");
    assert!(compaction.is_completed());

    let view = client.table().file_system_view().await?;
    let slice = view.latest_file_slice("p", &file_id).expect("file slice");
    assert_eq!(slice.base_instant_time, compaction_time);
    assert!(slice.base_file.is_some());
    assert!(!slice.has_log_files());

    assert_eq!(
        read_values(&client, &file_id).await?,
        vec![
            ("a".to_string(), json!({ "v": 2 })),
            ("b".to_string(), json!({ "v": 1 })),
        ]
    );

    // Nothing left to compact.
    assert!(client.schedule_compaction().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn compaction_is_refused_on_copy_on_write_tables() -> TestResult {
    let tmp = TempDir::new()?;
    let mut client = open_client(&tmp, TableType::CopyOnWrite).await?;
    client
        .upsert(&InstantTime::new("001"), vec![record("a", 1)])
        .await?;

    let err = client.schedule_compaction().await.unwrap_err();
    assert!(err.is_precondition(), "unexpected error: {err}");
    Ok(())
}
