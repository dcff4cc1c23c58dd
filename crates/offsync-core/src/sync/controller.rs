//! Synchronization controller.
//!
//! Routes writes to the active backend, queues the ones that fail for
//! network reasons, and drains the queue back through the backend when
//! asked. At most one drain runs at a time; a trigger that arrives during a
//! drain is coalesced into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::scheduler::{SyncHandle, SyncTrigger};
use crate::backend::{ActivityEvent, BackendAdapter, BackendMode, WriteOp};
use crate::error::{BackendError, StorageError, WriteError};
use crate::queue::PendingQueue;
use crate::record::PendingRecord;
use crate::store::RecordStore;

/// Kind tag used for queued activity events.
pub const ACTIVITY_KIND: &str = "activity-event";

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WriteOutcome {
    /// The backend accepted it; carries the backend's response.
    Applied { result: Value },
    /// The backend was unreachable; the write is queued for replay.
    Queued { id: String },
}

impl WriteOutcome {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub still_queued: usize,
    /// Records left out because they were past the retry ceiling when the pass began
    pub skipped_exhausted: usize,
    /// The pass stopped on a network failure
    pub stopped_early: bool,
    /// Another drain was already running; this trigger joined it
    pub coalesced: bool,
}

impl DrainReport {
    #[must_use]
    pub fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }
}

struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncController<S, B> {
    queue: Arc<PendingQueue<S>>,
    backend: B,
    draining: AtomicBool,
    online: AtomicBool,
    /// Where reconnects seen by writes and drains request a drain
    reconnect: OnceLock<SyncHandle>,
}

impl<S: RecordStore, B: BackendAdapter> SyncController<S, B> {
    pub fn new(queue: Arc<PendingQueue<S>>, backend: B) -> Self {
        Self {
            queue,
            backend,
            draining: AtomicBool::new(false),
            online: AtomicBool::new(true),
            reconnect: OnceLock::new(),
        }
    }

    /// Route reconnects observed by [`Self::write`] and drains to `handle`.
    /// Only the first handle is kept.
    pub fn attach_reconnect_trigger(&self, handle: SyncHandle) {
        let _ = self.reconnect.set(handle);
    }

    pub fn queue(&self) -> &Arc<PendingQueue<S>> {
        &self.queue
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }

    /// Last observed connectivity. Starts optimistic.
    pub fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record a connectivity observation. Returns true on an offline to online edge.
    pub(crate) fn observe_online(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was != online {
            info!(online, mode = %self.mode(), "Connectivity changed");
        }
        !was && online
    }

    /// A backend call succeeded. On an offline to online edge, ask the
    /// attached scheduler to drain what queued up during the outage.
    fn observe_success(&self) {
        if self.observe_online(true) {
            if let Some(handle) = self.reconnect.get() {
                handle.trigger(SyncTrigger::ConnectivityRestored);
            }
        }
    }

    /// Apply `op` through the backend; queue it under `kind` if the backend
    /// is unreachable.
    pub async fn write(&self, kind: &str, op: WriteOp) -> Result<WriteOutcome, WriteError> {
        match self.backend.apply(&op).await {
            Ok(result) => {
                self.observe_success();
                debug!(kind, operation = op.operation(), "Write applied");
                Ok(WriteOutcome::Applied { result })
            }
            Err(BackendError::Network(failure)) => {
                self.observe_online(false);
                let payload = serde_json::to_value(&op)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                let record = self.queue.enqueue(kind, payload).await?;
                warn!(
                    record_id = %record.id,
                    kind,
                    operation = op.operation(),
                    reason = %failure,
                    "Backend unreachable, write queued"
                );
                Ok(WriteOutcome::Queued { id: record.id })
            }
            Err(BackendError::Application(failure)) => {
                debug!(kind, operation = op.operation(), error = %failure, "Write rejected");
                Err(WriteError::Application(failure))
            }
            Err(BackendError::Storage(e)) => Err(WriteError::Storage(e)),
        }
    }

    /// Convenience wrapper: write an activity event under [`ACTIVITY_KIND`].
    pub async fn record_activity(&self, event: ActivityEvent) -> Result<WriteOutcome, WriteError> {
        self.write(ACTIVITY_KIND, WriteOp::Activity { event }).await
    }

    /// Drain every kind now.
    pub async fn flush_now(&self) -> Result<DrainReport, StorageError> {
        self.drain(None).await
    }

    /// Drain only records of `kind`.
    pub async fn drain_kind(&self, kind: &str) -> Result<DrainReport, StorageError> {
        self.drain(Some(kind)).await
    }

    pub async fn list_unresolved(
        &self,
        kind: Option<&str>,
    ) -> Result<Vec<PendingRecord>, StorageError> {
        self.queue.list_unresolved(kind).await
    }

    pub async fn pending_count(&self) -> Result<usize, StorageError> {
        self.queue.pending_count().await
    }

    async fn drain(&self, kind: Option<&str>) -> Result<DrainReport, StorageError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!(kind = ?kind, "Drain already running, coalescing trigger");
            return Ok(DrainReport::coalesced());
        }
        let _guard = InProgressGuard(&self.draining);

        let (candidates, skipped_exhausted) = self.queue.drain_snapshot(kind).await?;
        let mut report = DrainReport {
            skipped_exhausted,
            ..DrainReport::default()
        };

        for record in candidates {
            report.attempted += 1;

            let op: WriteOp = match record.decode_payload() {
                Ok(op) => op,
                Err(e) => {
                    warn!(record_id = %record.id, kind = %record.kind, error = %e, "Queued payload is not a write op");
                    self.queue.mark_failed_attempt(&record.id).await?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.backend.apply(&op).await {
                Ok(_) => {
                    self.queue.acknowledge(&record.id).await?;
                    self.observe_success();
                    report.succeeded += 1;
                }
                Err(BackendError::Network(failure)) => {
                    self.observe_online(false);
                    self.queue.mark_failed_attempt(&record.id).await?;
                    report.failed += 1;
                    report.stopped_early = true;
                    info!(record_id = %record.id, reason = %failure, "Backend unreachable, stopping drain");
                    break;
                }
                Err(BackendError::Application(failure)) => {
                    self.queue.mark_failed_attempt(&record.id).await?;
                    report.failed += 1;
                    warn!(
                        record_id = %record.id,
                        kind = %record.kind,
                        error = %failure,
                        "Replay rejected by backend"
                    );
                }
                Err(BackendError::Storage(e)) => {
                    self.queue.mark_failed_attempt(&record.id).await?;
                    report.failed += 1;
                    report.stopped_early = true;
                    warn!(record_id = %record.id, error = %e, "Local backend storage failed, stopping drain");
                    break;
                }
            }
        }

        report.still_queued = self.queue.store().count(kind).await?;

        if report.attempted > 0 {
            info!(
                kind = ?kind,
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                still_queued = report.still_queued,
                stopped_early = report.stopped_early,
                "Drain finished"
            );
        }
        Ok(report)
    }
}
