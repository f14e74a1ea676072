//! Coarse OS metrics with a time-bounded cache.
//!
//! Refreshed inline on access when stale, never by a background thread
//! (spec §4.4, §9 "time-based caches are explicit"). Grounded on the
//! `sysinfo::System` refresh pattern used elsewhere in the pack
//! (periodic `refresh_all()` inside a sampling loop).

use std::time::{Duration, Instant};
use sysinfo::{Disks, System};

/// A snapshot of coarse system metrics.
#[derive(Debug, Clone, Copy)]
pub struct SystemMetricsSnapshot {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub cpu_temp_f: i64,
    pub disk_free_mb: u64,
    pub updated_at: Instant,
}

/// Caches `current()` results for `refresh_interval`.
pub struct SystemMetrics {
    sys: System,
    refresh_interval: Duration,
    cached: Option<SystemMetricsSnapshot>,
    first_call: bool,
}

impl SystemMetrics {
    /// `refresh_interval` defaults to 60s per spec §4.4; configurable via
    /// `system_refresh_seconds`.
    pub fn new(refresh_interval: Duration) -> Self {
        SystemMetrics {
            sys: System::new(),
            refresh_interval,
            cached: None,
            first_call: true,
        }
    }

    /// Return the current snapshot, refreshing inline if stale.
    ///
    /// The very first call always returns a fresh sample with `cpu_pct = 0`
    /// (sysinfo's CPU% is a delta since the last refresh, so there is no
    /// prior sample to diff against).
    pub fn current(&mut self) -> SystemMetricsSnapshot {
        let is_stale = match &self.cached {
            None => true,
            Some(s) => s.updated_at.elapsed() >= self.refresh_interval,
        };

        if is_stale {
            self.sys.refresh_cpu_usage();
            self.sys.refresh_memory();

            let cpu_pct = if self.first_call {
                self.first_call = false;
                0.0
            } else {
                coerce_finite(self.sys.global_cpu_usage() as f64)
            };

            let total_mem = self.sys.total_memory();
            let used_mem = self.sys.used_memory();
            let mem_pct = if total_mem == 0 {
                0.0
            } else {
                coerce_finite(used_mem as f64 / total_mem as f64 * 100.0)
            };

            let cpu_temp_f = read_cpu_temp_f();
            let disk_free_mb = read_disk_free_mb();

            let snapshot = SystemMetricsSnapshot {
                cpu_pct,
                mem_pct,
                cpu_temp_f,
                disk_free_mb,
                updated_at: Instant::now(),
            };
            self.cached = Some(snapshot);
            snapshot
        } else {
            self.cached.expect("checked Some above")
        }
    }
}

fn coerce_finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Best-effort CPU temperature in whole degrees Fahrenheit. Collapses to 0
/// when no thermal component is available (spec §4.4 "all failures
/// collapse to 0").
fn read_cpu_temp_f() -> i64 {
    let components = sysinfo::Components::new_with_refreshed_list();
    components
        .iter()
        .find(|c| {
            let label = c.label().to_ascii_lowercase();
            label.contains("cpu") || label.contains("soc") || label.contains("package")
        })
        .and_then(|c| c.temperature())
        .filter(|c| c.is_finite())
        .map(|celsius| (celsius as f64 * 9.0 / 5.0 + 32.0).round() as i64)
        .unwrap_or(0)
}

fn read_disk_free_mb() -> u64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .map(sysinfo::Disk::available_space)
        .max()
        .map(|bytes| bytes / (1024 * 1024))
        .unwrap_or(0)
}
