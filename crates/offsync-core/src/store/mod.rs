//! Durable record store.
//!
//! [`RecordStore`] is the persistence seam under the pending-write queue.
//! Two implementations ship:
//!
//! - [`SqliteRecordStore`]: the production store (WAL, `synchronous=FULL`)
//! - [`MemoryRecordStore`]: in-process, with a switch that simulates an
//!   unavailable medium
//!
//! Records come back ordered by `createdAt` ascending, ties broken by
//! insertion order.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::PendingRecord;

pub use memory::MemoryRecordStore;
pub use sqlite::{SCHEMA_VERSION, SqliteRecordStore};
pub(crate) use sqlite::{map_sql, open_database};

/// Read-modify-write callback for [`RecordStore::update`].
///
/// Only the record's `retries` is persisted from the mutated value.
pub type Mutator = Box<dyn FnOnce(&mut PendingRecord) + Send + 'static>;

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Insert or replace by id. Committed before returning.
    async fn put(&self, record: PendingRecord) -> Result<(), StorageError>;

    /// All records, optionally restricted to one kind, oldest first.
    async fn get_all(&self, kind: Option<&str>) -> Result<Vec<PendingRecord>, StorageError>;

    /// Remove a record. Deleting a missing id succeeds.
    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Atomically apply `mutator` and write back. `Ok(None)` if the record is gone.
    async fn update(
        &self,
        id: &str,
        mutator: Mutator,
    ) -> Result<Option<PendingRecord>, StorageError>;

    async fn count(&self, kind: Option<&str>) -> Result<usize, StorageError>;

    /// Release the medium. Every later call fails with [`StorageError::NotOpen`].
    async fn close(&self) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn put(&self, record: PendingRecord) -> Result<(), StorageError> {
        (**self).put(record).await
    }

    async fn get_all(&self, kind: Option<&str>) -> Result<Vec<PendingRecord>, StorageError> {
        (**self).get_all(kind).await
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        (**self).delete(id).await
    }

    async fn update(
        &self,
        id: &str,
        mutator: Mutator,
    ) -> Result<Option<PendingRecord>, StorageError> {
        (**self).update(id, mutator).await
    }

    async fn count(&self, kind: Option<&str>) -> Result<usize, StorageError> {
        (**self).count(kind).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        (**self).close().await
    }
}

/// Copy the mutable field from `mutated` onto `stored`.
pub(crate) fn apply_mutable_fields(stored: &mut PendingRecord, mutated: &PendingRecord) {
    stored.retries = mutated.retries;
}
