use serde_json::json;
use tempfile::TempDir;

use slicer_lite::controller::{ExecutionStats, ExecutionStatus};
use slicer_lite::error::SlicerError;
use slicer_lite::scheduler::{Slice, SliceState};
use slicer_lite::store::{
    ExecutionMetadata, ExecutionRecord, ExecutionStore, ExecutionUpdate, JsonFileStore,
    MemoryStore, StateStore,
};

fn slice(slicer_id: usize, order: u64) -> Slice {
    Slice::new("ex-1", "job-1", slicer_id, order, json!({ "order": order }))
}

#[tokio::test]
async fn test_slice_state_lifecycle() {
    let store = MemoryStore::new();
    let s = slice(0, 0);

    store.create_state("ex-1", &s, SliceState::Start).await.unwrap();
    assert_eq!(StateStore::count(&store, "ex-1", SliceState::Start).await.unwrap(), 1);

    store
        .update_state("ex-1", &s.slice_id, SliceState::Error, Some("boom".into()))
        .await
        .unwrap();
    let record = store.get_state("ex-1", &s.slice_id).await.unwrap().unwrap();
    assert_eq!(record.state, SliceState::Error);
    assert_eq!(record.error.as_deref(), Some("boom"));
    assert_eq!(StateStore::count(&store, "ex-1", SliceState::Start).await.unwrap(), 0);
    assert_eq!(StateStore::count(&store, "ex-1", SliceState::Error).await.unwrap(), 1);

    assert!(store.get_state("ex-1", "missing").await.unwrap().is_none());
    assert!(store
        .update_state("ex-1", "missing", SliceState::Completed, None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_query_pages_by_slicer_order() {
    let store = MemoryStore::new();
    for order in (0..7).rev() {
        let state = if order % 2 == 0 {
            SliceState::Error
        } else {
            SliceState::Completed
        };
        store.create_state("ex-1", &slice(0, order), state).await.unwrap();
    }
    store
        .create_state("ex-1", &slice(1, 0), SliceState::Error)
        .await
        .unwrap();

    let first = store
        .query("ex-1", 0, &[SliceState::Error], 0, 2)
        .await
        .unwrap();
    let second = store
        .query("ex-1", 0, &[SliceState::Error], 2, 2)
        .await
        .unwrap();
    let orders: Vec<u64> = first.iter().chain(&second).map(|r| r.slicer_order).collect();
    assert_eq!(orders, vec![0, 2, 4, 6]);

    let both = store
        .query("ex-1", 0, &[SliceState::Error, SliceState::Completed], 0, 100)
        .await
        .unwrap();
    assert_eq!(both.len(), 7);

    let last = store.last_slice("ex-1", 0).await.unwrap().unwrap();
    assert_eq!(last.slicer_order, 6);
    assert!(store.last_slice("ex-1", 5).await.unwrap().is_none());
}

#[tokio::test]
async fn test_terminal_status_is_final() {
    let store = MemoryStore::new();
    store
        .create(ExecutionRecord::new("ex-1", "job-1", ExecutionStatus::Pending))
        .await
        .unwrap();

    store
        .set_status("ex-1", ExecutionStatus::Running, None)
        .await
        .unwrap();
    store
        .set_status("ex-1", ExecutionStatus::Completed, None)
        .await
        .unwrap();

    let err = store
        .set_status("ex-1", ExecutionStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SlicerError::InvalidTransition { .. }));
    assert_eq!(store.get_status("ex-1").await.unwrap(), ExecutionStatus::Completed);

    assert_eq!(
        store.status_history("ex-1").await,
        vec![
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed
        ]
    );
}

#[tokio::test]
async fn test_execution_create_and_update() {
    let store = MemoryStore::new();
    store
        .create(ExecutionRecord::new("ex-1", "job-1", ExecutionStatus::Pending))
        .await
        .unwrap();
    assert!(store
        .create(ExecutionRecord::new("ex-1", "job-1", ExecutionStatus::Pending))
        .await
        .is_err());
    assert!(matches!(
        store.get("ex-2").await,
        Err(SlicerError::ExecutionNotFound(_))
    ));

    store
        .update("ex-1", ExecutionUpdate::operations(vec![json!({ "size": 5 })]))
        .await
        .unwrap();
    store
        .update("ex-1", ExecutionUpdate::slicers_finished())
        .await
        .unwrap();
    let stats = ExecutionStats {
        processed: 3,
        ..Default::default()
    };
    store
        .update(
            "ex-1",
            ExecutionUpdate::metadata(ExecutionMetadata::new(stats, None)),
        )
        .await
        .unwrap();

    let record = store.get("ex-1").await.unwrap();
    assert_eq!(record.operations, vec![json!({ "size": 5 })]);
    assert!(record.slicers_finished);
    assert_eq!(record.metadata.stats.processed, 3);
    assert!(!record.metadata.has_errors);
    // updates never move the status
    assert_eq!(record.status, ExecutionStatus::Pending);
}

#[tokio::test]
async fn test_json_file_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");

    let s = slice(0, 0);
    {
        let store = JsonFileStore::open(&path).await.unwrap();
        store
            .create(ExecutionRecord::new("ex-1", "job-1", ExecutionStatus::Pending))
            .await
            .unwrap();
        store.create_state("ex-1", &s, SliceState::Start).await.unwrap();
        store
            .update_state("ex-1", &s.slice_id, SliceState::Completed, None)
            .await
            .unwrap();
        store
            .set_status(
                "ex-1",
                ExecutionStatus::Failed,
                Some(ExecutionMetadata::new(
                    ExecutionStats::default(),
                    Some("slicer failed".into()),
                )),
            )
            .await
            .unwrap();
    }
    assert!(path.exists());
    assert!(!path.with_extension("tmp").exists());

    let reopened = JsonFileStore::open(&path).await.unwrap();
    assert_eq!(reopened.path(), path.as_path());

    let record = reopened.get("ex-1").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.metadata.failure_reason.as_deref(), Some("slicer failed"));

    let slice_record = reopened.get_state("ex-1", &s.slice_id).await.unwrap().unwrap();
    assert_eq!(slice_record.state, SliceState::Completed);
    assert_eq!(slice_record.request, json!({ "order": 0 }));

    assert_eq!(
        reopened.memory().status_history("ex-1").await,
        vec![ExecutionStatus::Pending, ExecutionStatus::Failed]
    );
}

#[tokio::test]
async fn test_json_file_store_starts_empty() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(dir.path().join("missing.json")).await.unwrap();
    assert!(store.get("ex-1").await.is_err());
    assert_eq!(StateStore::count(&store, "ex-1", SliceState::Start).await.unwrap(), 0);
}

#[tokio::test]
async fn test_json_file_store_rejects_corrupt_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");
    std::fs::write(&path, b"not json").unwrap();

    assert!(matches!(
        JsonFileStore::open(&path).await,
        Err(SlicerError::Serde(_))
    ));
}
