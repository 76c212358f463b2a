use lakeline::prelude::*;
use lakeline::{ActionType, InstantState};
use serde_json::json;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn upsert_through_the_prelude() -> TestResult {
    let tmp = TempDir::new()?;
    let table = Table::create(
        TableLocation::local(tmp.path()),
        TableConfig::new("smoke", TableType::CopyOnWrite),
        WriteConfig::default(),
        LocalEngine::new(),
        Arc::new(InMemoryIndex::new()),
    )
    .await?;
    let mut client = WriteClient::new(table);

    let ts = client.start_commit().await?;
    let statuses = client
        .upsert(
            &ts,
            vec![Record::new(RecordKey::new("k1", "2024/01/01"), json!({ "v": 1 }))],
        )
        .await?;
    assert_eq!(statuses.len(), 1);

    let commit = client
        .table()
        .timeline()
        .get(&ts, ActionType::Commit)
        .cloned()
        .ok_or("commit missing")?;
    assert_eq!(commit.state, InstantState::Completed);
    Ok(())
}
