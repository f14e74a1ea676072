//! Background producer that decouples slow probe I/O from row emission
//! (spec §4.2).
//!
//! A single OS thread loops over the configured probes, blocking inside
//! each `sample()` call. Readers take a short lock for a field-by-field
//! copy and never block on probe I/O — the contract is "exactly one
//! producer, many readers, no torn reads" (spec §9).

use super::probe::SensorProbe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// The cache's last successfully-sampled value per field. Fields default
/// to 0 until a probe that measures them succeeds at least once (spec §3
/// "missing sensor values default to 0 rather than absent").
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorFields {
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
    pub equivalent_co2_ppm: f64,
    pub total_voc_ppb: f64,
    pub pressure: f64,
    pub temperature_icp: f64,
}

/// A consistent copy of the cache's current state.
#[derive(Debug, Clone, Copy)]
pub struct SensorSnapshot {
    pub values: SensorFields,
    pub update_count: u64,
    /// True when no probe has succeeded within the configured stale
    /// threshold. The scheduler may surface this in health but keeps
    /// emitting rows regardless (spec §4.2).
    pub stale: bool,
}

struct Shared {
    fields: Mutex<SensorFields>,
    update_count: AtomicU64,
    last_success: Mutex<Option<Instant>>,
    stale_threshold: Duration,
}

/// Handle to the running background worker. Dropping this without calling
/// [`SensorCache::shutdown`] leaves the worker thread detached; prefer an
/// explicit shutdown so the thread can be joined.
pub struct SensorCache {
    shared: Arc<Shared>,
    shutdown_tx: mpsc::Sender<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl SensorCache {
    /// Start the background worker over `probes`, sampling every
    /// `sample_period` (default 5s per spec §4.2/§6).
    pub fn start(
        probes: Vec<Box<dyn SensorProbe>>,
        sample_period: Duration,
        stale_threshold: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            fields: Mutex::new(SensorFields::default()),
            update_count: AtomicU64::new(0),
            last_success: Mutex::new(None),
            stale_threshold,
        });
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let worker_shared = shared.clone();
        let join_handle = std::thread::spawn(move || {
            run_worker(worker_shared, probes, sample_period, &shutdown_rx);
        });

        SensorCache {
            shared,
            shutdown_tx,
            join_handle: Some(join_handle),
        }
    }

    /// Return a consistent copy of the current snapshot. Never blocks on
    /// probe I/O. Before any successful probe cycle, returns zeros with
    /// `update_count == 0` (spec §4.2) -- callers should not distinguish
    /// this case from a genuine all-zero reading.
    pub fn snapshot(&self) -> SensorSnapshot {
        let values = *self.shared.fields.lock().expect("sensor fields lock poisoned");
        let update_count = self.shared.update_count.load(Ordering::Acquire);
        let stale = match *self.shared.last_success.lock().expect("last_success lock poisoned") {
            Some(t) => t.elapsed() > self.shared.stale_threshold,
            None => false,
        };
        SensorSnapshot {
            values,
            update_count,
            stale,
        }
    }

    /// Signal the worker to stop after its current round and join it,
    /// waiting up to `timeout`. Returns `true` if the worker exited cleanly
    /// within the timeout.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.join_handle.take() {
            join_with_timeout(handle, timeout)
        } else {
            true
        }
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    // std::thread has no native join-with-timeout; poll via a short sleep
    // loop bounded by `timeout` instead of blocking indefinitely.
    let deadline = Instant::now() + timeout;
    let mut handle = Some(handle);
    loop {
        if handle.as_ref().is_some_and(JoinHandle::is_finished) {
            let _ = handle.take().expect("checked Some above").join();
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn run_worker(
    shared: Arc<Shared>,
    mut probes: Vec<Box<dyn SensorProbe>>,
    sample_period: Duration,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    loop {
        for probe in &mut probes {
            match probe.sample() {
                Ok(reading) => {
                    apply_reading(&shared, reading);
                }
                Err(e) => {
                    debug!(probe = probe.name(), error = %e, "probe sample failed");
                }
            }
        }

        match shutdown_rx.recv_timeout(sample_period) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }
}

fn apply_reading(shared: &Shared, reading: super::probe::ProbeReading) {
    {
        let mut fields = shared.fields.lock().expect("sensor fields lock poisoned");
        if let Some(v) = reading.temperature {
            fields.temperature = coerce_finite(v);
        }
        if let Some(v) = reading.humidity {
            fields.humidity = coerce_finite(v);
        }
        if let Some(v) = reading.co2 {
            fields.co2 = coerce_finite(v);
        }
        if let Some(v) = reading.equivalent_co2_ppm {
            fields.equivalent_co2_ppm = coerce_finite(v);
        }
        if let Some(v) = reading.total_voc_ppb {
            fields.total_voc_ppb = coerce_finite(v);
        }
        if let Some(v) = reading.pressure {
            fields.pressure = coerce_finite(v);
        }
        if let Some(v) = reading.temperature_icp {
            fields.temperature_icp = coerce_finite(v);
        }
    }
    shared.update_count.fetch_add(1, Ordering::AcqRel);
    *shared.last_success.lock().expect("last_success lock poisoned") = Some(Instant::now());
}

fn coerce_finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
