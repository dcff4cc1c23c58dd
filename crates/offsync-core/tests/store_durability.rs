//! Records survive process restarts and move between stores intact.

use std::io::Cursor;

use serde_json::json;
use tempfile::TempDir;

use offsync_core::backend::{BackendAdapter, BackendMode, LocalAdapter, ListQuery, WriteOp};
use offsync_core::error::StorageError;
use offsync_core::queue::{PendingQueue, QueueConfig};
use offsync_core::store::{RecordStore, SqliteRecordStore};
use offsync_core::sync::{SyncController, WriteOutcome};

#[tokio::test]
async fn queued_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");

    let (first_id, second_id) = {
        let store = SqliteRecordStore::open(&path).await.unwrap();
        let queue = PendingQueue::new(store, QueueConfig::default());
        let a = queue
            .enqueue("activity-event", json!({ "op": "activity" }))
            .await
            .unwrap();
        let b = queue
            .enqueue("widget-create", json!({ "op": "create" }))
            .await
            .unwrap();
        queue.mark_failed_attempt(&a.id).await.unwrap();
        queue.store().close().await.unwrap();
        (a.id, b.id)
    };

    let store = SqliteRecordStore::open(&path).await.unwrap();
    let records = store.get_all(None).await.unwrap();
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![first_id.as_str(), second_id.as_str()]);
    assert_eq!(records[0].retries, 1);
    assert_eq!(records[1].retries, 0);
    assert_eq!(records[1].payload, json!({ "op": "create" }));
    assert_eq!(store.count(Some("widget-create")).await.unwrap(), 1);
}

#[tokio::test]
async fn closed_store_rejects_every_call() {
    let dir = TempDir::new().unwrap();
    let store = SqliteRecordStore::open(dir.path().join("closed.db"))
        .await
        .unwrap();
    store.close().await.unwrap();

    assert_eq!(store.count(None).await.unwrap_err(), StorageError::NotOpen);
    assert_eq!(store.delete("x").await.unwrap_err(), StorageError::NotOpen);
    assert_eq!(
        store.get_all(None).await.unwrap_err(),
        StorageError::NotOpen
    );
}

#[tokio::test]
async fn export_then_import_moves_records_between_stores() {
    let dir = TempDir::new().unwrap();
    let source = PendingQueue::new(
        SqliteRecordStore::open(dir.path().join("source.db"))
            .await
            .unwrap(),
        QueueConfig::default(),
    );
    let a = source.enqueue("widget-create", json!({ "n": 1 })).await.unwrap();
    source.enqueue("widget-create", json!({ "n": 2 })).await.unwrap();
    source.enqueue("activity-event", json!({ "n": 3 })).await.unwrap();
    source.mark_failed_attempt(&a.id).await.unwrap();

    let mut buffer = Vec::new();
    let written = source
        .export_jsonl(&mut buffer, Some("widget-create"))
        .await
        .unwrap();
    assert_eq!(written, 2);
    assert_eq!(String::from_utf8_lossy(&buffer).lines().count(), 2);

    let target = PendingQueue::new(
        SqliteRecordStore::open(dir.path().join("target.db"))
            .await
            .unwrap(),
        QueueConfig::default(),
    );
    let report = target.import_jsonl(Cursor::new(&buffer)).await.unwrap();
    assert_eq!(report.imported, 2);
    assert_eq!(report.skipped_existing, 0);

    let expected = source.list_unresolved(Some("widget-create")).await.unwrap();
    assert_eq!(target.list_unresolved(None).await.unwrap(), expected);

    // Importing the same file again changes nothing
    let again = target.import_jsonl(Cursor::new(&buffer)).await.unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.skipped_existing, 2);
    assert_eq!(target.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn import_rejects_malformed_lines_without_partial_writes() {
    let dir = TempDir::new().unwrap();
    let queue = PendingQueue::new(
        SqliteRecordStore::open(dir.path().join("bad.db")).await.unwrap(),
        QueueConfig::default(),
    );
    let input = concat!(
        r#"{"id":"pw-1","kind":"k","payload":{},"createdAt":"2026-01-01T00:00:00Z","retries":0}"#,
        "\n",
        "not json\n",
    );

    let err = queue.import_jsonl(Cursor::new(input)).await.unwrap_err();
    assert!(err.to_string().contains("line 2"), "{err}");
    assert_eq!(queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn local_backend_applies_writes_directly() {
    let dir = TempDir::new().unwrap();
    let store = SqliteRecordStore::open(dir.path().join("queue.db"))
        .await
        .unwrap();
    let backend = LocalAdapter::open(dir.path().join("local.db"), "activity_events")
        .await
        .unwrap();
    let controller = SyncController::new(
        std::sync::Arc::new(PendingQueue::new(store, QueueConfig::default())),
        backend,
    );
    assert_eq!(controller.mode(), BackendMode::Local);

    let outcome = controller
        .write(
            "widget-create",
            WriteOp::Create {
                entity: "widgets".into(),
                data: json!({ "id": "w-1", "name": "gear" }),
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Applied { .. }));
    assert_eq!(controller.pending_count().await.unwrap(), 0);

    let rows = controller
        .backend()
        .list_records("widgets", &ListQuery::new().eq("name", "gear"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "w-1");
}
