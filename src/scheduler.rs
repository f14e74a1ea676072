//! `BatchScheduler` — the blocking driver loop (spec §4.8).

use crate::ingest::client::IngestClient;
use crate::reading::ReadingAssembler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// Cooperative cancellation flag shared between the supervisor's signal
/// handler and the scheduler loop (spec §4.8, §4.9).
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        CancelSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Running totals reported in the periodic statistics snapshot (spec §4.8
/// step 4, §14 "throughput statistics").
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub rows_sent: u64,
    pub batches_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub last_offset: u64,
}

const SNAPSHOT_EVERY_N_BATCHES: u64 = 10;

pub struct BatchScheduler {
    batch_size: usize,
    intra_batch_delay: Duration,
    inter_batch_interval: Duration,
    stats: SchedulerStats,
    window_started: std::time::Instant,
    window_rows: u64,
}

impl BatchScheduler {
    pub fn new(batch_size: usize, intra_batch_delay: Duration, inter_batch_interval: Duration) -> Self {
        BatchScheduler {
            batch_size,
            intra_batch_delay,
            inter_batch_interval,
            stats: SchedulerStats::default(),
            window_started: std::time::Instant::now(),
            window_rows: 0,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Blocking driver loop. Returns once `cancel` is observed and any
    /// in-flight append completes. Never starts a new batch after
    /// cancellation is observed (spec §4.8).
    pub async fn run(
        &mut self,
        assembler: &mut ReadingAssembler<'_>,
        client: &IngestClient,
        cancel: &CancelSignal,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut batch = Vec::with_capacity(self.batch_size);
            for i in 0..self.batch_size {
                batch.push(assembler.assemble());
                if i + 1 < self.batch_size {
                    sleep(self.intra_batch_delay).await;
                }
            }

            match client.append_batch(&batch).await {
                Ok(outcome) => {
                    self.stats.rows_sent += outcome.rows_sent as u64;
                    self.stats.batches_sent += 1;
                    self.stats.bytes_sent += outcome.bytes_sent as u64;
                    self.stats.last_offset = outcome.last_offset;
                    self.window_rows += outcome.rows_sent as u64;
                }
                Err(e) => {
                    self.stats.errors += 1;
                    tracing::warn!(error = %e, "batch append failed, batch dropped");
                }
            }

            if self.stats.batches_sent > 0 && self.stats.batches_sent % SNAPSHOT_EVERY_N_BATCHES == 0 {
                self.emit_snapshot();
            }

            if cancel.is_cancelled() {
                return;
            }
            sleep_cancellable(self.inter_batch_interval, cancel).await;
            if cancel.is_cancelled() {
                return;
            }
        }
    }

    fn emit_snapshot(&mut self) {
        let elapsed = self.window_started.elapsed().as_secs_f64().max(0.001);
        let rows_per_sec = self.window_rows as f64 / elapsed;
        info!(
            rows_sent = self.stats.rows_sent,
            batches_sent = self.stats.batches_sent,
            bytes_sent = self.stats.bytes_sent,
            errors = self.stats.errors,
            last_offset = self.stats.last_offset,
            rows_per_sec,
            "scheduler statistics snapshot"
        );
        self.window_started = std::time::Instant::now();
        self.window_rows = 0;
    }
}

/// Sleeps for `duration` but wakes early (in short slices) if `cancel`
/// fires, so the inter-batch pause "interrupts immediately" per spec §5.
async fn sleep_cancellable(duration: Duration, cancel: &CancelSignal) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return;
        }
        let step = remaining.min(SLICE);
        sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;
    use crate::identity::HostIdentity;
    use crate::metrics::SystemMetrics;
    use crate::sensor::cache::SensorCache;
    use crate::sensor::probe::SensorProbe;
    use crate::token::TokenSource;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn connected_client(server: &MockServer) -> IngestClient {
        Mock::given(method("GET"))
            .and(path("/v2/streaming/hostname"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ingest_host": server.uri().trim_start_matches("http://")})))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/streaming/databases/db/schemas/sch/pipes/pipe1/channels/edge-1:open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_continuation_token": "ct0"})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/streaming/data/databases/db/schemas/sch/pipes/pipe1/channels/edge-1/rows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_continuation_token": "ctN"})))
            .mount(server)
            .await;

        let account = AccountConfig {
            user: "u".to_owned(),
            account: "acct".to_owned(),
            url: server.uri(),
            role: "role".to_owned(),
            database: "db".to_owned(),
            schema: "sch".to_owned(),
            pipe: "pipe1".to_owned(),
            channel_name: "edge-1".to_owned(),
        };
        IngestClient::connect(account, TokenSource::static_bearer("tok")).await.unwrap()
    }

    #[tokio::test]
    async fn run_stops_promptly_when_cancelled_before_first_batch() {
        let server = MockServer::start().await;
        let client = connected_client(&server).await;
        let probes: Vec<Box<dyn SensorProbe>> = vec![];
        let cache = SensorCache::start(probes, Duration::from_secs(5), Duration::from_secs(30));
        let mut metrics = SystemMetrics::new(Duration::from_secs(60));
        let identity = HostIdentity::resolve();
        let mut assembler = ReadingAssembler::new(&cache, &mut metrics, &identity, std::time::Instant::now());

        let cancel = CancelSignal::new();
        cancel.cancel();
        let mut scheduler = BatchScheduler::new(3, Duration::from_millis(1), Duration::from_secs(5));
        scheduler.run(&mut assembler, &client, &cancel).await;

        assert_eq!(scheduler.stats().batches_sent, 0);
        assert!(cache.shutdown(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn run_completes_one_batch_then_stops_on_cancel() {
        let server = MockServer::start().await;
        let client = connected_client(&server).await;
        let probes: Vec<Box<dyn SensorProbe>> = vec![];
        let cache = SensorCache::start(probes, Duration::from_secs(5), Duration::from_secs(30));
        let mut metrics = SystemMetrics::new(Duration::from_secs(60));
        let identity = HostIdentity::resolve();
        let mut assembler = ReadingAssembler::new(&cache, &mut metrics, &identity, std::time::Instant::now());

        let cancel = CancelSignal::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_clone.cancel();
        });

        let mut scheduler = BatchScheduler::new(2, Duration::from_millis(1), Duration::from_millis(5));
        scheduler.run(&mut assembler, &client, &cancel).await;

        assert!(scheduler.stats().batches_sent >= 1);
        assert_eq!(scheduler.stats().rows_sent, scheduler.stats().batches_sent * 2);
        assert!(cache.shutdown(Duration::from_secs(2)));
    }
}
