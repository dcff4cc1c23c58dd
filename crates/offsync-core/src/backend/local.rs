//! Local-only adapter backed by the `local_entities` SQLite table.
//!
//! Used when no real remote is configured. Every entity lives in one table
//! keyed by `(entity, id)` with the record body stored as JSON text.
//! Subscribers are fed from an in-process broadcast channel.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::{
    ActivityEvent, BackendAdapter, BackendMode, ChangeEvent, ListQuery, SUBSCRIPTION_BUFFER,
    Subscription, validate_entity,
};
use crate::error::{ApplicationFailure, BackendError, StorageError};
use crate::record::generate_record_id;
use crate::store::{map_sql, open_database};

const LOCAL_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS local_entities (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    entity      TEXT NOT NULL,
    id          TEXT NOT NULL,
    data        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE(entity, id)
);
";

#[derive(Clone)]
pub struct LocalAdapter {
    conn: Arc<Mutex<Connection>>,
    path: Arc<PathBuf>,
    changes: broadcast::Sender<ChangeEvent>,
    activity_entity: String,
}

impl std::fmt::Debug for LocalAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAdapter")
            .field("path", &self.path)
            .field("activity_entity", &self.activity_entity)
            .finish_non_exhaustive()
    }
}

impl LocalAdapter {
    pub async fn open(
        path: impl Into<PathBuf>,
        activity_entity: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            let conn = open_database(&open_path)?;
            conn.execute_batch(LOCAL_SCHEMA_SQL).map_err(map_sql)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("task join: {e}")))??;

        info!(db_path = %path.display(), "Local adapter opened");
        let (changes, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Arc::new(path),
            changes,
            activity_entity: activity_entity.into(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Connection) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| {
                StorageError::Database("connection mutex poisoned".to_string())
            })?;
            let conn: &Connection = &guard;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("task join: {e}")))?
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    fn mode(&self) -> BackendMode {
        BackendMode::Local
    }

    async fn create_record(&self, entity: &str, data: Value) -> Result<Value, BackendError> {
        validate_entity("create", entity)?;
        let Value::Object(mut object) = data else {
            return Err(ApplicationFailure::new("create", "record data must be a JSON object")
                .with_code("invalid_body")
                .into());
        };

        let id = match object.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null) | None => generate_record_id(Utc::now()).replacen("pw-", "loc-", 1),
            Some(_) => {
                return Err(ApplicationFailure::new("create", "id must be a string or number")
                    .with_code("invalid_body")
                    .into());
            }
        };
        object.insert("id".to_string(), Value::String(id.clone()));
        let record = Value::Object(object);

        let entity_owned = entity.to_owned();
        let body = record.to_string();
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO local_entities (entity, id, data, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(entity, id) DO NOTHING",
                    params![entity_owned, id, body, Utc::now().to_rfc3339()],
                )
                .map_err(map_sql)?;
            if inserted == 0 {
                return Err(ApplicationFailure::new(
                    "create",
                    format!("{entity_owned} {id} already exists"),
                )
                .with_code("conflict")
                .into());
            }
            Ok(())
        })
        .await?;

        debug!(entity, "Local record created");
        self.publish(ChangeEvent::Created {
            entity: entity.to_owned(),
            record: record.clone(),
        });
        Ok(record)
    }

    async fn update_record(
        &self,
        entity: &str,
        id: &str,
        patch: Value,
    ) -> Result<Value, BackendError> {
        validate_entity("update", entity)?;
        let Value::Object(patch) = patch else {
            return Err(ApplicationFailure::new("update", "patch must be a JSON object")
                .with_code("invalid_body")
                .into());
        };

        let entity_owned = entity.to_owned();
        let id_owned = id.to_owned();
        let merged = self
            .with_conn(move |conn| {
                let tx = conn.unchecked_transaction().map_err(map_sql)?;
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT data FROM local_entities WHERE entity = ?1 AND id = ?2",
                        params![entity_owned, id_owned],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(map_sql)?;
                let Some(existing) = existing else {
                    return Err(ApplicationFailure::new(
                        "update",
                        format!("{entity_owned} {id_owned} not found"),
                    )
                    .with_code("not_found")
                    .into());
                };

                let mut object: Map<String, Value> = serde_json::from_str(&existing)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                for (key, value) in patch {
                    if key != "id" {
                        object.insert(key, value);
                    }
                }
                let merged = Value::Object(object);
                tx.execute(
                    "UPDATE local_entities SET data = ?1, updated_at = ?2
                     WHERE entity = ?3 AND id = ?4",
                    params![
                        merged.to_string(),
                        Utc::now().to_rfc3339(),
                        entity_owned,
                        id_owned
                    ],
                )
                .map_err(map_sql)?;
                tx.commit().map_err(map_sql)?;
                Ok(merged)
            })
            .await?;

        debug!(entity, "Local record updated");
        self.publish(ChangeEvent::Updated {
            entity: entity.to_owned(),
            record: merged.clone(),
        });
        Ok(merged)
    }

    async fn delete_record(&self, entity: &str, id: &str) -> Result<(), BackendError> {
        validate_entity("delete", entity)?;
        let entity_owned = entity.to_owned();
        let id_owned = id.to_owned();
        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM local_entities WHERE entity = ?1 AND id = ?2",
                    params![entity_owned, id_owned],
                )
                .map_err(|e| map_sql(e).into())
            })
            .await?;

        if removed > 0 {
            self.publish(ChangeEvent::Deleted {
                entity: entity.to_owned(),
                id: id.to_owned(),
            });
        }
        Ok(())
    }

    async fn list_records(
        &self,
        entity: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, BackendError> {
        validate_entity("list", entity)?;
        let entity_owned = entity.to_owned();
        let rows: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT data FROM local_entities WHERE entity = ?1 ORDER BY seq")
                    .map_err(map_sql)?;
                let rows = stmt
                    .query_map([entity_owned], |row| row.get(0))
                    .map_err(map_sql)?
                    .collect::<Result<Vec<String>, _>>()
                    .map_err(map_sql)?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Value = serde_json::from_str(&row)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            if matches_filters(&value, query) {
                records.push(value);
            }
        }
        apply_order_and_limit(&mut records, query);
        Ok(records)
    }

    async fn subscribe(&self, entity: &str) -> Result<Subscription, BackendError> {
        validate_entity("subscribe", entity)?;
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let wanted = entity.to_owned();

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) if event.entity() == wanted => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(entity = %wanted, skipped, "Subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(entity, rx, task))
    }

    async fn record_activity(&self, event: &ActivityEvent) -> Result<(), BackendError> {
        let data = serde_json::to_value(event)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.create_record(&self.activity_entity, data).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(map_sql)?;
            Ok(())
        })
        .await
    }
}

fn matches_filters(record: &Value, query: &ListQuery) -> bool {
    query
        .filters
        .iter()
        .all(|(field, expected)| record.get(field) == Some(expected))
}

fn apply_order_and_limit(records: &mut Vec<Value>, query: &ListQuery) {
    if let Some(field) = &query.order_by {
        records.sort_by(|a, b| {
            let ord = compare_json(a.get(field), b.get(field));
            if query.descending { ord.reverse() } else { ord }
        });
    }
    if let Some(limit) = query.limit {
        records.truncate(limit);
    }
}

/// Order JSON scalars; missing and null values sort last.
fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
