//! Drain scheduling.
//!
//! [`SyncScheduler`] owns the loop that decides when to drain:
//!
//! ```text
//!  SyncHandle::trigger ──┐
//!  ConnectivityMonitor ──┼──▶ mpsc(1) ──▶ select! ──▶ SyncController::flush_now
//!  periodic interval ────┘                  ▲
//!  shutdown watch ──────────────────────────┘
//! ```
//!
//! The trigger channel holds one pending trigger; extra triggers sent while
//! one is pending are dropped, which coalesces bursts into a single drain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::controller::{DrainReport, SyncController};
use crate::backend::BackendAdapter;
use crate::config::SyncConfig;
use crate::retry::RetryPolicy;
use crate::store::RecordStore;

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    ConnectivityRestored,
    Manual,
    Timer,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::ConnectivityRestored => "connectivity_restored",
            Self::Manual => "manual",
            Self::Timer => "timer",
        })
    }
}

/// Cloneable sender for drain triggers.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncTrigger>,
}

impl SyncHandle {
    /// Request a drain. Returns false if the request was coalesced into an
    /// already pending one or the scheduler has stopped.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%trigger, "Drain already pending, trigger coalesced");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Periodic drain interval; `None` disables the timer.
    pub flush_interval: Option<Duration>,
    /// Delay growth for timer drains after passes that stopped early.
    pub backoff: RetryPolicy,
    /// Drain once as soon as the loop starts.
    pub drain_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            flush_interval: (config.flush_interval_secs > 0)
                .then(|| Duration::from_secs(config.flush_interval_secs)),
            backoff: config.backoff_policy(),
            drain_on_start: true,
        }
    }
}

/// Counters reported when the scheduler loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub drains: u64,
    pub records_synced: u64,
    pub failed_passes: u64,
}

pub struct SyncScheduler<S, B> {
    controller: Arc<SyncController<S, B>>,
    config: SchedulerConfig,
    rx: mpsc::Receiver<SyncTrigger>,
    handle: SyncHandle,
}

impl<S: RecordStore, B: BackendAdapter> SyncScheduler<S, B> {
    /// Also attaches this scheduler as the controller's reconnect target, so
    /// a write that finds the backend back drains the queue.
    pub fn new(controller: Arc<SyncController<S, B>>, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let handle = SyncHandle { tx };
        controller.attach_reconnect_trigger(handle.clone());
        Self {
            controller,
            config,
            rx,
            handle,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SchedulerStats {
        // The scheduler's own handle keeps the channel open; only shutdown ends the loop
        let Self {
            controller,
            config,
            mut rx,
            handle: _handle,
        } = self;
        let mut stats = SchedulerStats::default();
        // Consecutive passes that stopped on a network failure
        let mut failed_streak: u32 = 0;

        info!(
            flush_interval_secs = config.flush_interval.map(|d| d.as_secs()),
            "Sync scheduler started"
        );

        if config.drain_on_start {
            drain_once(&controller, SyncTrigger::Startup, &mut stats, &mut failed_streak).await;
        }
        let mut next_timer = config.flush_interval.map(|d| Instant::now() + d);

        loop {
            let timer = async {
                match next_timer {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let trigger = tokio::select! {
                maybe_trigger = rx.recv() => match maybe_trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                () = timer => SyncTrigger::Timer,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                    continue;
                }
            };

            drain_once(&controller, trigger, &mut stats, &mut failed_streak).await;

            next_timer = config.flush_interval.map(|interval| {
                let delay = if failed_streak == 0 {
                    interval
                } else {
                    interval.max(config.backoff.delay_for_attempt(failed_streak - 1))
                };
                Instant::now() + delay
            });
        }

        info!(
            drains = stats.drains,
            records_synced = stats.records_synced,
            failed_passes = stats.failed_passes,
            "Sync scheduler stopped"
        );
        stats
    }
}

async fn drain_once<S: RecordStore, B: BackendAdapter>(
    controller: &SyncController<S, B>,
    trigger: SyncTrigger,
    stats: &mut SchedulerStats,
    failed_streak: &mut u32,
) {
    debug!(%trigger, "Drain triggered");
    match controller.flush_now().await {
        Ok(report) => record_report(&report, trigger, stats, failed_streak),
        Err(e) => {
            stats.failed_passes += 1;
            *failed_streak = failed_streak.saturating_add(1);
            warn!(%trigger, error = %e, "Drain failed on local storage");
        }
    }
}

fn record_report(
    report: &DrainReport,
    trigger: SyncTrigger,
    stats: &mut SchedulerStats,
    failed_streak: &mut u32,
) {
    if report.coalesced {
        return;
    }
    stats.drains += 1;
    stats.records_synced += report.succeeded as u64;
    if report.stopped_early {
        stats.failed_passes += 1;
        *failed_streak = failed_streak.saturating_add(1);
        debug!(%trigger, failed_streak = *failed_streak, "Drain stopped early, backing off");
    } else {
        *failed_streak = 0;
    }
}

/// Polls [`BackendAdapter::probe`] and raises
/// [`SyncTrigger::ConnectivityRestored`] on offline to online edges.
pub struct ConnectivityMonitor<S, B> {
    controller: Arc<SyncController<S, B>>,
    handle: SyncHandle,
    interval: Duration,
}

impl<S: RecordStore, B: BackendAdapter> ConnectivityMonitor<S, B> {
    pub fn new(controller: Arc<SyncController<S, B>>, handle: SyncHandle, interval: Duration) -> Self {
        Self {
            controller,
            handle,
            interval,
        }
    }

    /// Probe once. Returns true if this probe observed connectivity returning.
    pub async fn check(&self) -> bool {
        let online = match self.controller.backend().probe().await {
            Ok(()) => true,
            Err(e) if e.is_network() => {
                debug!(error = %e, "Probe failed");
                false
            }
            // The remote answered; it is reachable even if it complained
            Err(_) => true,
        };
        let restored = self.controller.observe_online(online);
        if restored {
            self.handle.trigger(SyncTrigger::ConnectivityRestored);
        }
        restored
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Connectivity monitor stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_disables_timer() {
        let config = SyncConfig {
            flush_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert!(SchedulerConfig::from(&config).flush_interval.is_none());
        assert_eq!(
            SchedulerConfig::default().flush_interval,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn streak_grows_on_early_stop_and_resets_on_clean_pass() {
        let mut stats = SchedulerStats::default();
        let mut streak = 0;
        let stopped = DrainReport {
            attempted: 1,
            failed: 1,
            stopped_early: true,
            ..DrainReport::default()
        };
        record_report(&stopped, SyncTrigger::Timer, &mut stats, &mut streak);
        record_report(&stopped, SyncTrigger::Timer, &mut stats, &mut streak);
        assert_eq!(streak, 2);
        assert_eq!(stats.failed_passes, 2);

        let clean = DrainReport {
            attempted: 2,
            succeeded: 2,
            ..DrainReport::default()
        };
        record_report(&clean, SyncTrigger::Manual, &mut stats, &mut streak);
        assert_eq!(streak, 0);
        assert_eq!(stats.records_synced, 2);
        assert_eq!(stats.drains, 3);
    }

    #[test]
    fn coalesced_reports_are_not_counted() {
        let mut stats = SchedulerStats::default();
        let mut streak = 1;
        record_report(&DrainReport::coalesced(), SyncTrigger::Manual, &mut stats, &mut streak);
        assert_eq!(stats, SchedulerStats::default());
        assert_eq!(streak, 1);
    }

    #[test]
    fn trigger_display() {
        assert_eq!(SyncTrigger::ConnectivityRestored.to_string(), "connectivity_restored");
    }
}
