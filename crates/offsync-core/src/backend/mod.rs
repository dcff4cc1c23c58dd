//! Backend adapters.
//!
//! A [`BackendAdapter`] is the uniform surface the rest of the crate talks
//! to. Two variants exist and one is chosen at startup by
//! [`Backend::from_config`]:
//!
//! ```text
//!              ┌──────────────────┐
//!  WriteOp ───▶│     Backend      │
//!              ├────────┬─────────┤
//!              │ Local  │ Remote  │
//!              │ SQLite │ REST    │
//!              └────────┴─────────┘
//! ```
//!
//! The local adapter never fails with a network error. The remote adapter
//! splits its failures into [`NetworkFailure`] (retry later) and
//! [`ApplicationFailure`] (the remote said no).
//!
//! [`NetworkFailure`]: crate::error::NetworkFailure
//! [`ApplicationFailure`]: crate::error::ApplicationFailure

mod local;
mod remote;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::{ApplicationFailure, BackendError};

pub use local::LocalAdapter;
pub use remote::{RemoteAdapter, RemoteSettings, StatusClass, classify_status};

/// Which adapter variant is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Local,
    Remote,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// A usage/telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEvent {
    #[must_use]
    pub fn new(event_type: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.into(),
            entity_id: None,
            metadata: Value::Null,
            occurred_at,
        }
    }

    #[must_use]
    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A serialized mutation. This is the payload stored for queued writes and
/// replayed verbatim through [`BackendAdapter::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WriteOp {
    Create {
        entity: String,
        data: Value,
    },
    Update {
        entity: String,
        id: String,
        patch: Value,
    },
    Delete {
        entity: String,
        id: String,
    },
    Activity {
        event: ActivityEvent,
    },
}

impl WriteOp {
    /// Short name used in logs and failure messages.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Activity { .. } => "activity",
        }
    }

    /// Target entity; `None` for activity events, whose entity is adapter config.
    #[must_use]
    pub fn entity(&self) -> Option<&str> {
        match self {
            Self::Create { entity, .. }
            | Self::Update { entity, .. }
            | Self::Delete { entity, .. } => Some(entity),
            Self::Activity { .. } => None,
        }
    }
}

/// Query for [`BackendAdapter::list_records`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Field equality filters
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ListQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(field.into());
        self.descending = descending;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A change observed on a subscribed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "lowercase")]
pub enum ChangeEvent {
    Created { entity: String, record: Value },
    Updated { entity: String, record: Value },
    Deleted { entity: String, id: String },
    /// Full contents after a polled refresh
    Refreshed { entity: String, records: Vec<Value> },
}

impl ChangeEvent {
    #[must_use]
    pub fn entity(&self) -> &str {
        match self {
            Self::Created { entity, .. }
            | Self::Updated { entity, .. }
            | Self::Deleted { entity, .. }
            | Self::Refreshed { entity, .. } => entity,
        }
    }
}

/// Live change feed for one entity. Dropping it stops the feed.
#[derive(Debug)]
pub struct Subscription {
    entity: String,
    rx: mpsc::Receiver<ChangeEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(
        entity: impl Into<String>,
        rx: mpsc::Receiver<ChangeEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            entity: entity.into(),
            rx,
            task,
        }
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Next change, or `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

const SUBSCRIPTION_BUFFER: usize = 64;

/// Uniform data-access surface over the local and remote backends.
#[async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
    fn mode(&self) -> BackendMode;

    async fn create_record(&self, entity: &str, data: Value) -> Result<Value, BackendError>;

    async fn update_record(
        &self,
        entity: &str,
        id: &str,
        patch: Value,
    ) -> Result<Value, BackendError>;

    async fn delete_record(&self, entity: &str, id: &str) -> Result<(), BackendError>;

    async fn list_records(
        &self,
        entity: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, BackendError>;

    async fn subscribe(&self, entity: &str) -> Result<Subscription, BackendError>;

    async fn record_activity(&self, event: &ActivityEvent) -> Result<(), BackendError>;

    /// Cheap reachability check. Only network failures mean "offline".
    async fn probe(&self) -> Result<(), BackendError>;

    /// Dispatch a serialized write. Deletes and activity events yield `null`.
    async fn apply(&self, op: &WriteOp) -> Result<Value, BackendError> {
        match op {
            WriteOp::Create { entity, data } => self.create_record(entity, data.clone()).await,
            WriteOp::Update { entity, id, patch } => {
                self.update_record(entity, id, patch.clone()).await
            }
            WriteOp::Delete { entity, id } => {
                self.delete_record(entity, id).await?;
                Ok(Value::Null)
            }
            WriteOp::Activity { event } => {
                self.record_activity(event).await?;
                Ok(Value::Null)
            }
        }
    }
}

/// The adapter selected for this process.
#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalAdapter),
    Remote(RemoteAdapter),
}

impl Backend {
    /// Select and construct the adapter. Placeholder or missing remote
    /// credentials select the local adapter.
    pub async fn from_config(config: &Config) -> crate::Result<Self> {
        let backend = match config.remote_credentials() {
            Some(credentials) => Self::Remote(RemoteAdapter::new(RemoteSettings {
                url: credentials.url,
                api_key: credentials.api_key,
                timeout: config.remote_timeout(),
                activity_entity: config.remote.activity_entity.clone(),
                poll_interval: std::time::Duration::from_millis(config.remote.subscribe_poll_ms),
            })?),
            None => Self::Local(
                LocalAdapter::open(config.db_path(), config.remote.activity_entity.clone())
                    .await?,
            ),
        };
        info!(mode = %backend.mode(), "Backend selected");
        Ok(backend)
    }
}

#[async_trait]
impl BackendAdapter for Backend {
    fn mode(&self) -> BackendMode {
        match self {
            Self::Local(a) => a.mode(),
            Self::Remote(a) => a.mode(),
        }
    }

    async fn create_record(&self, entity: &str, data: Value) -> Result<Value, BackendError> {
        match self {
            Self::Local(a) => a.create_record(entity, data).await,
            Self::Remote(a) => a.create_record(entity, data).await,
        }
    }

    async fn update_record(
        &self,
        entity: &str,
        id: &str,
        patch: Value,
    ) -> Result<Value, BackendError> {
        match self {
            Self::Local(a) => a.update_record(entity, id, patch).await,
            Self::Remote(a) => a.update_record(entity, id, patch).await,
        }
    }

    async fn delete_record(&self, entity: &str, id: &str) -> Result<(), BackendError> {
        match self {
            Self::Local(a) => a.delete_record(entity, id).await,
            Self::Remote(a) => a.delete_record(entity, id).await,
        }
    }

    async fn list_records(
        &self,
        entity: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, BackendError> {
        match self {
            Self::Local(a) => a.list_records(entity, query).await,
            Self::Remote(a) => a.list_records(entity, query).await,
        }
    }

    async fn subscribe(&self, entity: &str) -> Result<Subscription, BackendError> {
        match self {
            Self::Local(a) => a.subscribe(entity).await,
            Self::Remote(a) => a.subscribe(entity).await,
        }
    }

    async fn record_activity(&self, event: &ActivityEvent) -> Result<(), BackendError> {
        match self {
            Self::Local(a) => a.record_activity(event).await,
            Self::Remote(a) => a.record_activity(event).await,
        }
    }

    async fn probe(&self) -> Result<(), BackendError> {
        match self {
            Self::Local(a) => a.probe().await,
            Self::Remote(a) => a.probe().await,
        }
    }
}

/// Reject entity names that cannot be used as a table or URL path segment.
pub(crate) fn validate_entity(operation: &str, entity: &str) -> Result<(), BackendError> {
    let ok = !entity.is_empty()
        && entity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ApplicationFailure::new(operation, format!("invalid entity name: {entity:?}"))
            .with_code("invalid_entity")
            .into())
    }
}
