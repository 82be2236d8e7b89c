// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resource-aware admission and the event-loop lag watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, warn};

/// Utilization thresholds above which ready tasks are deferred.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Percent of CPU above which nothing new is dispatched.
    pub cpu_threshold: f32,
    /// Percent of memory above which nothing new is dispatched.
    pub mem_threshold: f32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { cpu_threshold: 80.0, mem_threshold: 80.0 }
    }
}

/// Point-in-time utilization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Global CPU utilization percent.
    pub cpu_percent: f32,
    /// Memory utilization percent.
    pub mem_percent: f32,
}

/// Samples system utilization for admission decisions.
pub struct ResourceMonitor {
    system: Mutex<System>,
}

impl ResourceMonitor {
    /// Create a monitor. The first CPU sample reads as zero; sysinfo
    /// needs two refreshes for a meaningful delta, which the scan cadence
    /// provides naturally.
    #[must_use]
    pub fn new() -> Self {
        Self { system: Mutex::new(System::new()) }
    }

    /// Refresh and read utilization.
    #[must_use]
    pub fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self.system.lock().expect("resource monitor lock poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu_percent = system.global_cpu_usage();
        let total = system.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f32 / total as f32 * 100.0
        };
        ResourceSnapshot { cpu_percent, mem_percent }
    }

    /// Whether a new task may start under `config`.
    #[must_use]
    pub fn admit(&self, config: &AdmissionConfig) -> bool {
        let snap = self.snapshot();
        let ok = snap.cpu_percent < config.cpu_threshold && snap.mem_percent < config.mem_threshold;
        if !ok {
            debug!(
                cpu = snap.cpu_percent,
                mem = snap.mem_percent,
                "admission denied, deferring ready tasks"
            );
        }
        ok
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResourceMonitor")
    }
}

/// Watchdog settings.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Sampling period.
    pub sample_every: Duration,
    /// A sample counts as laggy when the sleep overshoots by this much.
    pub lag_threshold: Duration,
    /// Dispatch suspends after lag has been sustained this long.
    pub sustain: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sample_every: Duration::from_millis(100),
            lag_threshold: Duration::from_millis(100),
            sustain: Duration::from_secs(1),
        }
    }
}

/// Detects a wedged event loop by measuring timer overshoot.
///
/// While suspended, the scheduler starts no new executions; network
/// tasks keep making progress on their own.
#[derive(Clone)]
pub struct LoopLagWatchdog {
    suspended: Arc<AtomicBool>,
}

impl LoopLagWatchdog {
    /// Spawn the sampling task and return the shared flag handle.
    #[must_use]
    pub fn spawn(config: WatchdogConfig) -> Self {
        let suspended = Arc::new(AtomicBool::new(false));
        let flag = suspended.clone();
        tokio::spawn(async move {
            let mut laggy_since: Option<Instant> = None;
            loop {
                let before = Instant::now();
                tokio::time::sleep(config.sample_every).await;
                let overshoot = before.elapsed().saturating_sub(config.sample_every);
                if overshoot > config.lag_threshold {
                    let since = *laggy_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= config.sustain && !flag.swap(true, Ordering::SeqCst) {
                        warn!(?overshoot, "event loop lag sustained; suspending dispatch");
                    }
                } else {
                    laggy_since = None;
                    if flag.swap(false, Ordering::SeqCst) {
                        debug!("event loop recovered; dispatch resumed");
                    }
                }
            }
        });
        Self { suspended }
    }

    /// A watchdog that never fires. For tests.
    #[must_use]
    pub fn disabled() -> Self {
        Self { suspended: Arc::new(AtomicBool::new(false)) }
    }

    /// Whether dispatch is currently suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LoopLagWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopLagWatchdog")
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_plausible_values() {
        let monitor = ResourceMonitor::new();
        let snap = monitor.snapshot();
        assert!(snap.cpu_percent >= 0.0);
        assert!((0.0..=100.0).contains(&snap.mem_percent));
    }

    #[test]
    fn generous_thresholds_admit() {
        let monitor = ResourceMonitor::new();
        let config = AdmissionConfig { cpu_threshold: 101.0, mem_threshold: 101.0 };
        assert!(monitor.admit(&config));
    }

    #[test]
    fn zero_thresholds_deny() {
        let monitor = ResourceMonitor::new();
        let config = AdmissionConfig { cpu_threshold: 0.0, mem_threshold: 0.0 };
        assert!(!monitor.admit(&config));
    }

    #[tokio::test]
    async fn disabled_watchdog_never_suspends() {
        let watchdog = LoopLagWatchdog::disabled();
        assert!(!watchdog.is_suspended());
    }

    #[tokio::test]
    async fn responsive_loop_stays_unsuspended() {
        let watchdog = LoopLagWatchdog::spawn(WatchdogConfig::default());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!watchdog.is_suspended());
    }
}
