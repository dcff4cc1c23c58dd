//! The pending-write record and its id scheme.

use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A write that could not reach the remote and waits for replay.
///
/// Every field except `retries` is fixed at enqueue time. The serialized form
/// (camelCase, RFC 3339 `createdAt`) is also the export/import line format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PendingRecord {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
}

impl PendingRecord {
    /// Build a fresh record with a generated id and zero retries.
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(StorageError::InvalidRecord(
                "kind must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id: generate_record_id(created_at),
            kind,
            payload,
            created_at,
            retries: 0,
        })
    }

    /// Whether automatic drains should skip this record.
    #[must_use]
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retries > max_retries
    }

    /// Check the fields an imported or stored record must carry.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.id.trim().is_empty() {
            return Err(StorageError::InvalidRecord("id must not be empty".into()));
        }
        if self.kind.trim().is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "record {} has an empty kind",
                self.id
            )));
        }
        Ok(())
    }

    /// Decode the payload as a typed value.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            StorageError::Serialization(format!("record {}: {e}", self.id))
        })
    }
}

static RECORD_SEQ: AtomicU16 = AtomicU16::new(0);

/// Generate a time-ordered record id: `pw-<ms hex>-<seq hex><random hex>`.
///
/// The per-process sequence keeps ids unique when two records share a
/// millisecond; the random tail separates processes.
#[must_use]
pub fn generate_record_id(at: DateTime<Utc>) -> String {
    let ts = at.timestamp_millis().max(0) as u64;
    let seq = RECORD_SEQ.fetch_add(1, Ordering::Relaxed);
    let tail: u64 = rand::rng().random::<u64>() & 0xffff_ffff_ffff;
    format!("pw-{ts:013x}-{seq:04x}{tail:012x}")
}
