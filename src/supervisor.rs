//! `Supervisor` — owns the process lifecycle (spec §4.9).
//!
//! Builds every component, installs the signal handlers that fire the
//! scheduler's cancellation signal, runs the scheduler to completion, then
//! tears components down in order.

use crate::config::{Config, CredentialSource};
use crate::error::FatalError;
use crate::identity::HostIdentity;
use crate::ingest::client::IngestClient;
use crate::metrics::SystemMetrics;
use crate::reading::ReadingAssembler;
use crate::scheduler::{BatchScheduler, CancelSignal};
use crate::sensor::cache::SensorCache;
use crate::sensor::probe::SensorProbe;
use crate::token::{SignedTokenParams, TokenSource};
use std::time::{Duration, Instant};
use tracing::info;

const SENSOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Supervisor { config }
    }

    /// Run the agent until a termination signal is received. `probes` is
    /// supplied by the caller (`main`) so tests can substitute fixtures.
    pub async fn run(self, probes: Vec<Box<dyn SensorProbe>>) -> Result<(), FatalError> {
        let process_start = Instant::now();
        let identity = HostIdentity::resolve();
        info!(hostname = identity.hostname(), ip = identity.ipv4(), mac = identity.mac(), "resolved host identity");

        let sensor_cache = SensorCache::start(
            probes,
            Duration::from_secs_f64(self.config.runtime.sensor_refresh_seconds),
            Duration::from_secs_f64(self.config.runtime.sensor_refresh_seconds * 3.0),
        );
        let mut system_metrics = SystemMetrics::new(Duration::from_secs_f64(self.config.runtime.system_refresh_seconds));

        let token = build_token_source(&self.config)?;

        let client = IngestClient::connect(self.config.account.clone(), token)
            .await
            .map_err(|e| FatalError::ChannelOpen(e.to_string()))?;

        let mut assembler = ReadingAssembler::new(&sensor_cache, &mut system_metrics, &identity, process_start);
        let mut scheduler = BatchScheduler::new(
            self.config.runtime.batch_size,
            self.config.runtime.intra_batch_delay(),
            self.config.runtime.inter_batch_interval(),
        );

        let cancel = CancelSignal::new();
        let signal_cancel = cancel.clone();
        let signal_task = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            signal_cancel.cancel();
        });

        scheduler.run(&mut assembler, &client, &cancel).await;
        signal_task.abort();

        let stats = scheduler.stats();
        info!(
            rows_sent = stats.rows_sent,
            batches_sent = stats.batches_sent,
            bytes_sent = stats.bytes_sent,
            errors = stats.errors,
            last_offset = stats.last_offset,
            "final statistics"
        );

        if !sensor_cache.shutdown(SENSOR_SHUTDOWN_TIMEOUT) {
            tracing::warn!("sensor cache worker did not join within timeout");
        }
        client.close().await;

        Ok(())
    }
}

fn build_token_source(config: &Config) -> Result<TokenSource, FatalError> {
    match &config.credential {
        CredentialSource::StaticBearer(token) => Ok(TokenSource::static_bearer(token.clone())),
        CredentialSource::SignedKeyFile(path) => {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                FatalError::Auth(crate::token::TokenError::KeyFileIo(path.clone(), e.to_string()))
            })?;
            let params = SignedTokenParams {
                account: config.account.account.clone(),
                user: config.account.user.clone(),
                role: config.account.role.clone(),
                oauth_url: format!("{}/oauth/token-request", config.account.url.trim_end_matches('/')),
                private_key_pem: pem,
            };
            TokenSource::signed(params).map_err(FatalError::Auth)
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), mirroring the teacher's
/// `server::main::shutdown_signal` helper.
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, RuntimeConfig};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn run_completes_at_least_one_batch_then_exits_on_immediate_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/streaming/hostname"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ingest_host": server.uri().trim_start_matches("http://")})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/streaming/databases/db/schemas/sch/pipes/pipe1/channels/edge-1:open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_continuation_token": "ct0"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/streaming/data/databases/db/schemas/sch/pipes/pipe1/channels/edge-1/rows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_continuation_token": "ctN"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/streaming/databases/db/schemas/sch/pipes/pipe1:close"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = Config {
            account: AccountConfig {
                user: "u".to_owned(),
                account: "acct".to_owned(),
                url: server.uri(),
                role: "role".to_owned(),
                database: "db".to_owned(),
                schema: "sch".to_owned(),
                pipe: "pipe1".to_owned(),
                channel_name: "edge-1".to_owned(),
            },
            credential: CredentialSource::StaticBearer("tok".to_owned()),
            runtime: RuntimeConfig {
                batch_size: 1,
                interval_seconds: 0.01,
                fast: true,
                sensor_refresh_seconds: 5.0,
                system_refresh_seconds: 60.0,
            },
        };

        let supervisor = Supervisor::new(config);
        // `run` only returns on a shutdown signal in production; drive it
        // here with a timeout instead of sending a real signal.
        let result = tokio::time::timeout(Duration::from_secs(3), supervisor.run(vec![])).await;
        assert!(result.is_err(), "run() blocks until a signal arrives by design");
    }
}
