//! Shared fixtures for offsync-core integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::Notify;

use offsync_core::backend::{
    ActivityEvent, BackendAdapter, BackendMode, ListQuery, Subscription,
};
use offsync_core::clock::ManualClock;
use offsync_core::error::{ApplicationFailure, BackendError, NetworkFailure, NetworkFailureKind};
use offsync_core::queue::{PendingQueue, QueueConfig};
use offsync_core::store::MemoryRecordStore;
use offsync_core::sync::SyncController;

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).single().unwrap()
}

#[derive(Default)]
struct ScriptState {
    unreachable: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    applied: Mutex<Vec<String>>,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

/// Backend double whose reachability and rejections are set by the test.
///
/// Every accepted call is logged as `"<operation>:<entity or event type>"`.
#[derive(Clone, Default)]
pub struct ScriptedAdapter {
    state: Arc<ScriptState>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn reject_entity(&self, entity: &str) {
        self.state.rejected.lock().unwrap().insert(entity.to_string());
    }

    pub fn allow_entity(&self, entity: &str) {
        self.state.rejected.lock().unwrap().remove(entity);
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.applied.lock().unwrap().clone()
    }

    /// Make the next calls park until [`ScriptedAdapter::release`].
    pub fn hold_calls(&self) {
        self.state.gated.store(true, Ordering::SeqCst);
    }

    /// Wait until a held call has started.
    pub async fn wait_entered(&self) {
        self.state.entered.notified().await;
    }

    pub fn release(&self) {
        self.state.gated.store(false, Ordering::SeqCst);
        self.state.release.notify_one();
    }

    async fn accept(&self, operation: &str, target: &str) -> Result<(), BackendError> {
        if self.state.gated.load(Ordering::SeqCst) {
            self.state.entered.notify_one();
            self.state.release.notified().await;
        }
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(NetworkFailure::new(
                operation,
                NetworkFailureKind::Connect,
                "connection refused",
            )
            .into());
        }
        if self.state.rejected.lock().unwrap().contains(target) {
            return Err(ApplicationFailure::new(operation, "rejected by script")
                .with_status(422)
                .with_code("rejected")
                .into());
        }
        self.state
            .applied
            .lock()
            .unwrap()
            .push(format!("{operation}:{target}"));
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn mode(&self) -> BackendMode {
        BackendMode::Remote
    }

    async fn create_record(&self, entity: &str, data: Value) -> Result<Value, BackendError> {
        self.accept("create", entity).await?;
        Ok(data)
    }

    async fn update_record(
        &self,
        entity: &str,
        id: &str,
        patch: Value,
    ) -> Result<Value, BackendError> {
        self.accept("update", entity).await?;
        Ok(json!({ "id": id, "patch": patch }))
    }

    async fn delete_record(&self, entity: &str, _id: &str) -> Result<(), BackendError> {
        self.accept("delete", entity).await
    }

    async fn list_records(
        &self,
        entity: &str,
        _query: &ListQuery,
    ) -> Result<Vec<Value>, BackendError> {
        self.accept("list", entity).await?;
        Ok(Vec::new())
    }

    async fn subscribe(&self, entity: &str) -> Result<Subscription, BackendError> {
        Err(ApplicationFailure::new("subscribe", format!("{entity}: not scripted")).into())
    }

    async fn record_activity(&self, event: &ActivityEvent) -> Result<(), BackendError> {
        self.accept("activity", &event.event_type).await
    }

    async fn probe(&self) -> Result<(), BackendError> {
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(
                NetworkFailure::new("probe", NetworkFailureKind::Connect, "connection refused")
                    .into(),
            );
        }
        Ok(())
    }
}

pub type TestController = SyncController<Arc<MemoryRecordStore>, ScriptedAdapter>;

pub struct Harness {
    pub store: Arc<MemoryRecordStore>,
    pub clock: Arc<ManualClock>,
    pub controller: Arc<TestController>,
}

impl Harness {
    pub fn new(config: QueueConfig) -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let queue = Arc::new(PendingQueue::with_clock(
            Arc::clone(&store),
            config,
            clock.clone(),
        ));
        let controller = Arc::new(SyncController::new(queue, ScriptedAdapter::new()));
        Self {
            store,
            clock,
            controller,
        }
    }

    pub fn adapter(&self) -> &ScriptedAdapter {
        self.controller.backend()
    }
}
