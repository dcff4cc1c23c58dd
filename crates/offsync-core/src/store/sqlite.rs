//! SQLite-backed record store.
//!
//! One connection per store, guarded by a mutex and only touched from
//! `spawn_blocking`. Every mutating call commits before it returns.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::{debug, info};

use super::{Mutator, RecordStore, apply_mutable_fields};
use crate::error::{Error, StorageError};
use crate::record::PendingRecord;
use crate::retry::{RetryPolicy, with_retry};

/// Schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS pending_records (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT NOT NULL UNIQUE,
    kind           TEXT NOT NULL,
    payload        TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    created_at_us  INTEGER NOT NULL,
    retries        INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_records(created_at_us, seq);
CREATE INDEX IF NOT EXISTS idx_pending_kind_created ON pending_records(kind, created_at_us, seq);
";

const SELECT_COLUMNS: &str = "id, kind, payload, created_at, retries";

/// Durable store for pending writes.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Option<Connection>>>,
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteRecordStore {
    /// Open (creating if needed) the store at `path`.
    ///
    /// Runs an integrity check and brings the schema to [`SCHEMA_VERSION`].
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || open_conn(&open_path))
            .await
            .map_err(|e| StorageError::Database(format!("task join: {e}")))??;

        info!(db_path = %path.display(), schema_version = SCHEMA_VERSION, "Record store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: Arc::new(path),
        })
    }

    /// [`open`](Self::open), retrying transient failures such as a locked database.
    pub async fn open_with_retry(
        path: impl Into<PathBuf>,
        policy: &RetryPolicy,
    ) -> crate::Result<Self> {
        let path = path.into();
        with_retry(policy, || {
            let path = path.clone();
            async move { Self::open(path).await.map_err(Error::from) }
        })
        .await
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
            let conn = guard.as_ref().ok_or(StorageError::NotOpen)?;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("task join: {e}")))?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn put(&self, record: PendingRecord) -> Result<(), StorageError> {
        record.validate()?;
        self.with_conn(move |conn| put_sync(conn, &record)).await
    }

    async fn get_all(&self, kind: Option<&str>) -> Result<Vec<PendingRecord>, StorageError> {
        let kind = kind.map(str::to_owned);
        self.with_conn(move |conn| get_all_sync(conn, kind.as_deref()))
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM pending_records WHERE id = ?1", [&id])
                .map_err(map_sql)?;
            debug!(record_id = %id, removed, "Record deleted");
            Ok(())
        })
        .await
    }

    async fn update(
        &self,
        id: &str,
        mutator: Mutator,
    ) -> Result<Option<PendingRecord>, StorageError> {
        let id = id.to_owned();
        self.with_conn(move |conn| update_sync(conn, &id, mutator))
            .await
    }

    async fn count(&self, kind: Option<&str>) -> Result<usize, StorageError> {
        let kind = kind.map(str::to_owned);
        self.with_conn(move |conn| {
            let n: i64 = match kind {
                Some(kind) => conn.query_row(
                    "SELECT COUNT(*) FROM pending_records WHERE kind = ?1",
                    [kind],
                    |row| row.get(0),
                ),
                None => conn.query_row("SELECT COUNT(*) FROM pending_records", [], |row| {
                    row.get(0)
                }),
            }
            .map_err(map_sql)?;
            Ok(n as usize)
        })
        .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let conn = Arc::clone(&self.conn);
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| map_sql(e))?;
                info!(db_path = %path.display(), "Record store closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("task join: {e}")))?
    }
}

// =============================================================================
// SQLite operations (sync, run inside spawn_blocking)
// =============================================================================

/// Open a connection with the durability pragmas every offsync table relies on.
pub(crate) fn open_database(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Database(format!("create {}: {e}", parent.display()))
            })?;
        }
    }

    let conn = Connection::open(path).map_err(map_sql)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;",
    )
    .map_err(map_sql)?;
    Ok(conn)
}

fn open_conn(path: &Path) -> Result<Connection, StorageError> {
    let conn = open_database(path)?;
    check_integrity(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

fn check_integrity(conn: &Connection) -> Result<(), StorageError> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(map_sql)?;
    if verdict == "ok" {
        Ok(())
    } else {
        Err(StorageError::Corruption { details: verdict })
    }
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(map_sql)?;

    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        });
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }

    let migration_err = |e: rusqlite::Error| StorageError::MigrationFailed(e.to_string());
    let tx = conn.unchecked_transaction().map_err(migration_err)?;
    tx.execute_batch(SCHEMA_SQL).map_err(migration_err)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(migration_err)?;
    tx.commit().map_err(migration_err)?;

    info!(from = current, to = SCHEMA_VERSION, "Record store schema migrated");
    Ok(())
}

fn put_sync(conn: &Connection, record: &PendingRecord) -> Result<(), StorageError> {
    let payload = serde_json::to_string(&record.payload)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    // Upsert keeps the original seq so a replaced record holds its FIFO slot
    conn.execute(
        "INSERT INTO pending_records (id, kind, payload, created_at, created_at_us, retries)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             kind = excluded.kind,
             payload = excluded.payload,
             created_at = excluded.created_at,
             created_at_us = excluded.created_at_us,
             retries = excluded.retries",
        params![
            record.id,
            record.kind,
            payload,
            record.created_at.to_rfc3339(),
            record.created_at.timestamp_micros(),
            i64::from(record.retries),
        ],
    )
    .map_err(map_sql)?;
    Ok(())
}

fn get_all_sync(conn: &Connection, kind: Option<&str>) -> Result<Vec<PendingRecord>, StorageError> {
    let mut records = Vec::new();
    match kind {
        Some(kind) => {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM pending_records WHERE kind = ?1
                     ORDER BY created_at_us, seq"
                ))
                .map_err(map_sql)?;
            let rows = stmt.query_map([kind], read_row).map_err(map_sql)?;
            for row in rows {
                records.push(decode_row(row.map_err(map_sql)?)?);
            }
        }
        None => {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM pending_records ORDER BY created_at_us, seq"
                ))
                .map_err(map_sql)?;
            let rows = stmt.query_map([], read_row).map_err(map_sql)?;
            for row in rows {
                records.push(decode_row(row.map_err(map_sql)?)?);
            }
        }
    }
    Ok(records)
}

fn update_sync(
    conn: &Connection,
    id: &str,
    mutator: Mutator,
) -> Result<Option<PendingRecord>, StorageError> {
    let tx = conn.unchecked_transaction().map_err(map_sql)?;

    let row = tx
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM pending_records WHERE id = ?1"),
            [id],
            read_row,
        )
        .optional()
        .map_err(map_sql)?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut stored = decode_row(row)?;
    let mut mutated = stored.clone();
    mutator(&mut mutated);
    apply_mutable_fields(&mut stored, &mutated);

    tx.execute(
        "UPDATE pending_records SET retries = ?1 WHERE id = ?2",
        params![i64::from(stored.retries), id],
    )
    .map_err(map_sql)?;
    tx.commit().map_err(map_sql)?;

    Ok(Some(stored))
}

type RawRow = (String, String, String, String, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_row((id, kind, payload, created_at, retries): RawRow) -> Result<PendingRecord, StorageError> {
    let payload = serde_json::from_str(&payload)
        .map_err(|e| StorageError::Serialization(format!("record {id} payload: {e}")))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StorageError::Serialization(format!("record {id} createdAt: {e}")))?
        .with_timezone(&Utc);
    Ok(PendingRecord {
        id,
        kind,
        payload,
        created_at,
        retries: u32::try_from(retries).unwrap_or(u32::MAX),
    })
}

pub(crate) fn map_sql(e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt) => StorageError::Corruption {
            details: e.to_string(),
        },
        _ => StorageError::Database(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn record(kind: &str, ms: i64) -> PendingRecord {
        PendingRecord::new(kind, serde_json::json!({"n": ms}), at(ms)).unwrap()
    }

    async fn open_temp() -> (tempfile::TempDir, SqliteRecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::open(dir.path().join("offsync.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn get_all_orders_by_created_at_then_insertion() {
        let (_dir, store) = open_temp().await;
        let late = record("tasks", 2_000);
        let tie_a = record("tasks", 1_000);
        let tie_b = record("tasks", 1_000);
        store.put(late.clone()).await.unwrap();
        store.put(tie_a.clone()).await.unwrap();
        store.put(tie_b.clone()).await.unwrap();

        let ids: Vec<String> = store
            .get_all(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![tie_a.id, tie_b.id, late.id]);
    }

    #[tokio::test]
    async fn kind_filter_and_count() {
        let (_dir, store) = open_temp().await;
        store.put(record("tasks", 1)).await.unwrap();
        store.put(record("mood-log", 2)).await.unwrap();
        store.put(record("tasks", 3)).await.unwrap();

        assert_eq!(store.get_all(Some("tasks")).await.unwrap().len(), 2);
        assert_eq!(store.count(Some("mood-log")).await.unwrap(), 1);
        assert_eq!(store.count(None).await.unwrap(), 3);
        assert!(store.get_all(Some("none")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_replaces_by_id() {
        let (_dir, store) = open_temp().await;
        let mut r = record("tasks", 10);
        store.put(r.clone()).await.unwrap();
        r.retries = 2;
        store.put(r.clone()).await.unwrap();

        let all = store.get_all(None).await.unwrap();
        assert_eq!(all, vec![r]);
    }

    #[tokio::test]
    async fn update_writes_back_retries_only() {
        let (_dir, store) = open_temp().await;
        let original = record("tasks", 10);
        store.put(original.clone()).await.unwrap();

        let updated = store
            .update(
                &original.id,
                Box::new(|r| {
                    r.retries += 1;
                    r.kind = "hijacked".to_string();
                    r.created_at += Duration::days(1);
                }),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.retries, 1);
        assert_eq!(updated.kind, "tasks");
        assert_eq!(updated.created_at, original.created_at);
        assert_eq!(store.get_all(None).await.unwrap(), vec![updated]);
    }

    #[tokio::test]
    async fn update_missing_record_is_none() {
        let (_dir, store) = open_temp().await;
        let result = store
            .update("pw-missing", Box::new(|r| r.retries += 1))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = open_temp().await;
        let r = record("tasks", 1);
        store.put(r.clone()).await.unwrap();
        store.delete(&r.id).await.unwrap();
        store.delete(&r.id).await.unwrap();
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_store_reports_not_open() {
        let (_dir, store) = open_temp().await;
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert_eq!(
            store.put(record("tasks", 1)).await.unwrap_err(),
            StorageError::NotOpen
        );
        assert_eq!(store.get_all(None).await.unwrap_err(), StorageError::NotOpen);
        assert_eq!(store.delete("x").await.unwrap_err(), StorageError::NotOpen);
        assert_eq!(store.count(None).await.unwrap_err(), StorageError::NotOpen);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsync.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }

        let err = SqliteRecordStore::open(&path).await.unwrap_err();
        assert_eq!(
            err,
            StorageError::SchemaTooNew {
                current: SCHEMA_VERSION + 1,
                supported: SCHEMA_VERSION,
            }
        );
    }

    #[tokio::test]
    async fn garbage_file_is_reported_as_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsync.db");
        std::fs::write(&path, vec![0xA5u8; 8192]).unwrap();

        let err = SqliteRecordStore::open(&path).await.unwrap_err();
        assert!(
            matches!(err, StorageError::Corruption { .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn open_with_retry_gives_up_on_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsync.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 42).unwrap();
        }

        let err = SqliteRecordStore::open_with_retry(&path, &RetryPolicy::store_open())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::SchemaTooNew { current: 42, .. })
        ));
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("offsync.db");
        let store = SqliteRecordStore::open(&path).await.unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
    }
}
