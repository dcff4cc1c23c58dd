//! In-memory record store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Mutator, RecordStore, apply_mutable_fields};
use crate::error::StorageError;
use crate::record::PendingRecord;

#[derive(Debug)]
struct Entry {
    seq: u64,
    record: PendingRecord,
}

/// Non-durable store for tests and embedding.
///
/// [`set_unavailable`](Self::set_unavailable) makes every call fail with
/// [`StorageError::Database`], standing in for a full disk or a revoked quota.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    entries: Mutex<Vec<Entry>>,
    next_seq: AtomicU64,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::NotOpen);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Database("storage medium unavailable".into()));
        }
        Ok(())
    }
}

fn sorted(entries: &[Entry], kind: Option<&str>) -> Vec<PendingRecord> {
    let mut matching: Vec<&Entry> = entries
        .iter()
        .filter(|e| kind.is_none_or(|k| e.record.kind == k))
        .collect();
    matching.sort_by(|a, b| {
        a.record
            .created_at
            .cmp(&b.record.created_at)
            .then(a.seq.cmp(&b.seq))
    });
    matching.into_iter().map(|e| e.record.clone()).collect()
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, record: PendingRecord) -> Result<(), StorageError> {
        self.check()?;
        record.validate()?;
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.iter_mut().find(|e| e.record.id == record.id) {
            existing.record = record;
        } else {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            entries.push(Entry { seq, record });
        }
        Ok(())
    }

    async fn get_all(&self, kind: Option<&str>) -> Result<Vec<PendingRecord>, StorageError> {
        self.check()?;
        let entries = self.entries.lock().await;
        Ok(sorted(&entries, kind))
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries.lock().await.retain(|e| e.record.id != id);
        Ok(())
    }

    async fn update(
        &self,
        id: &str,
        mutator: Mutator,
    ) -> Result<Option<PendingRecord>, StorageError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) else {
            return Ok(None);
        };
        let mut mutated = entry.record.clone();
        mutator(&mut mutated);
        apply_mutable_fields(&mut entry.record, &mutated);
        Ok(Some(entry.record.clone()))
    }

    async fn count(&self, kind: Option<&str>) -> Result<usize, StorageError> {
        self.check()?;
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| kind.is_none_or(|k| e.record.kind == k))
            .count())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
