//! Write routing, offline queueing, and replay.

mod controller;
mod scheduler;

pub use controller::{ACTIVITY_KIND, DrainReport, SyncController, WriteOutcome};
pub use scheduler::{
    ConnectivityMonitor, SchedulerConfig, SchedulerStats, SyncHandle, SyncScheduler, SyncTrigger,
};
