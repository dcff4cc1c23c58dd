//! offsync-core: offline-first durable write queue and backend sync.
//!
//! Writes go to whichever backend is active. When the remote backend is
//! unreachable they are persisted locally and replayed once it comes back.
//!
//! # Architecture
//!
//! ```text
//! caller → SyncController ──apply──▶ Backend (LocalAdapter | RemoteAdapter)
//!               │  network failure
//!               ▼
//!          PendingQueue → RecordStore (SQLite, WAL, synchronous=FULL)
//!               ▲
//!   SyncScheduler ◀── SyncHandle / ConnectivityMonitor / timer
//! ```
//!
//! # Modules
//!
//! - `record`: the pending record type and id generation
//! - `store`: durable record storage (SQLite) plus an in-memory store for tests
//! - `queue`: FIFO admission, retry accounting, export/import
//! - `backend`: the backend adapter contract and its local/remote implementations
//! - `sync`: write routing, drain passes, scheduling, connectivity tracking
//! - `config`: TOML configuration with environment overrides
//! - `logging`: tracing subscriber setup
//! - `retry`: backoff policy and retry helper
//! - `clock`: injectable time source
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod record;
pub mod retry;
pub mod store;
pub mod sync;

pub use error::{Error, Result, StorageError};

/// Version of the offsync-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
