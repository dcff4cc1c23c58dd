//! Pending-write queue.
//!
//! Thin policy layer over a [`RecordStore`]: builds records at enqueue,
//! hands out FIFO drain candidates under the retry ceiling, and tracks
//! failed replays. Records over the ceiling stay stored until an operator
//! purges them.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::record::PendingRecord;
use crate::store::RecordStore;

/// Queue policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Records with `retries` above this are left out of drains.
    pub max_retries: u32,
    /// Enqueue fails with [`StorageError::QueueFull`] at this many records.
    pub max_pending: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_pending: 10_000,
        }
    }
}

impl From<&Config> for QueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.sync.max_retries,
            max_pending: config.storage.max_pending,
        }
    }
}

/// Outcome of [`PendingQueue::import_jsonl`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    /// Lines whose id was already queued
    pub skipped_existing: usize,
}

pub struct PendingQueue<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    // Serializes the count-then-put in enqueue and import
    admit: Mutex<()>,
}

impl<S: RecordStore> PendingQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
            admit: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Persist a new record for `kind` carrying `payload`.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> std::result::Result<PendingRecord, StorageError> {
        let record = PendingRecord::new(kind, payload, self.clock.now())?;

        let _admit = self.admit.lock().await;
        let pending = self.store.count(None).await?;
        if pending >= self.config.max_pending {
            warn!(
                kind,
                pending,
                limit = self.config.max_pending,
                "Queue full, rejecting write"
            );
            return Err(StorageError::QueueFull {
                limit: self.config.max_pending,
            });
        }
        self.store.put(record.clone()).await?;

        info!(record_id = %record.id, kind, pending = pending + 1, "Write queued");
        Ok(record)
    }

    /// Records eligible for replay, oldest first.
    pub async fn drain_candidates(
        &self,
        kind: Option<&str>,
    ) -> std::result::Result<Vec<PendingRecord>, StorageError> {
        Ok(self.drain_snapshot(kind).await?.0)
    }

    /// Split one read of the store into replay candidates and the number of
    /// exhausted records left out.
    pub async fn drain_snapshot(
        &self,
        kind: Option<&str>,
    ) -> std::result::Result<(Vec<PendingRecord>, usize), StorageError> {
        let max = self.config.max_retries;
        let (exhausted, candidates): (Vec<_>, Vec<_>) = self
            .store
            .get_all(kind)
            .await?
            .into_iter()
            .partition(|r| r.is_exhausted(max));
        Ok((candidates, exhausted.len()))
    }

    /// Drop a record after a successful replay. Unknown ids are ignored.
    pub async fn acknowledge(&self, id: &str) -> std::result::Result<(), StorageError> {
        self.store.delete(id).await?;
        debug!(record_id = %id, "Record acknowledged");
        Ok(())
    }

    /// Count one failed replay. Returns the updated record, or `None` if it
    /// was removed in the meantime.
    pub async fn mark_failed_attempt(
        &self,
        id: &str,
    ) -> std::result::Result<Option<PendingRecord>, StorageError> {
        let updated = self
            .store
            .update(id, Box::new(|r| r.retries = r.retries.saturating_add(1)))
            .await?;

        if let Some(record) = &updated {
            if record.retries == self.config.max_retries.saturating_add(1) {
                warn!(
                    record_id = %record.id,
                    kind = %record.kind,
                    retries = record.retries,
                    "Record exceeded retry ceiling; needs manual attention"
                );
            } else {
                debug!(record_id = %record.id, retries = record.retries, "Replay failed");
            }
        }
        Ok(updated)
    }

    /// Every stored record, exhausted ones included.
    pub async fn list_unresolved(
        &self,
        kind: Option<&str>,
    ) -> std::result::Result<Vec<PendingRecord>, StorageError> {
        self.store.get_all(kind).await
    }

    /// Records past the retry ceiling.
    pub async fn exhausted(
        &self,
        kind: Option<&str>,
    ) -> std::result::Result<Vec<PendingRecord>, StorageError> {
        let max = self.config.max_retries;
        let mut records = self.store.get_all(kind).await?;
        records.retain(|r| r.is_exhausted(max));
        Ok(records)
    }

    /// Operator removal of one record. Returns whether it existed.
    pub async fn purge(&self, id: &str) -> std::result::Result<bool, StorageError> {
        let existed = self.store.update(id, Box::new(|_| {})).await?.is_some();
        if existed {
            self.store.delete(id).await?;
            info!(record_id = %id, "Record purged");
        }
        Ok(existed)
    }

    /// Remove every exhausted record. Returns how many were removed.
    pub async fn purge_exhausted(
        &self,
        kind: Option<&str>,
    ) -> std::result::Result<usize, StorageError> {
        let exhausted = self.exhausted(kind).await?;
        for record in &exhausted {
            self.store.delete(&record.id).await?;
        }
        if !exhausted.is_empty() {
            info!(removed = exhausted.len(), kind = ?kind, "Exhausted records purged");
        }
        Ok(exhausted.len())
    }

    /// Number of records waiting to sync.
    pub async fn pending_count(&self) -> std::result::Result<usize, StorageError> {
        self.store.count(None).await
    }

    /// Write records as JSON Lines. Returns the number written.
    pub async fn export_jsonl<W: Write + Send>(
        &self,
        mut writer: W,
        kind: Option<&str>,
    ) -> Result<usize> {
        let records = self.store.get_all(kind).await?;
        for record in &records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(records.len())
    }

    /// Load records from JSON Lines, keeping their ids, timestamps and retry
    /// counts. Ids already queued are skipped.
    pub async fn import_jsonl<R: BufRead + Send>(&self, reader: R) -> Result<ImportReport> {
        let mut parsed = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PendingRecord = serde_json::from_str(&line).map_err(|e| {
                StorageError::InvalidRecord(format!("line {}: {e}", index + 1))
            })?;
            record.validate()?;
            parsed.push(record);
        }

        let _admit = self.admit.lock().await;
        let mut known: HashSet<String> = self
            .store
            .get_all(None)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();

        let mut report = ImportReport::default();
        for record in parsed {
            if known.contains(&record.id) {
                report.skipped_existing += 1;
                continue;
            }
            if known.len() >= self.config.max_pending {
                return Err(StorageError::QueueFull {
                    limit: self.config.max_pending,
                }
                .into());
            }
            known.insert(record.id.clone());
            self.store.put(record).await?;
            report.imported += 1;
        }

        info!(
            imported = report.imported,
            skipped = report.skipped_existing,
            "Records imported"
        );
        Ok(report)
    }
}
