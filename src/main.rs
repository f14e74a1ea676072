use clap::Parser;
use std::path::PathBuf;
use thermal_streamer::config::{self, CliOverrides};
use thermal_streamer::sensor::probe::SensorProbe;
use thermal_streamer::supervisor::Supervisor;
use tracing::info;

/// Edge agent: samples I2C environmental sensors and streams rows to the
/// configured ingestion pipe.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[arg(long, default_value = "/etc/thermal-streamer/config.toml")]
    config: PathBuf,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    interval: Option<f64>,
    #[arg(long)]
    fast: bool,
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "thermal-streamer starting");

    let overrides = CliOverrides {
        batch_size: cli.batch_size,
        interval: cli.interval,
        fast: cli.fast,
        verbose: cli.verbose,
    };

    let cfg = match config::load_config_from_path(&cli.config, &overrides) {
        Ok(cfg) => {
            info!(
                account = %cfg.account.account,
                pipe = %cfg.account.pipe,
                channel = %cfg.account.channel_name,
                batch_size = cfg.runtime.batch_size,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // Concrete I2C hardware bindings are host-specific and live outside
    // this crate; wire real `SensorProbe` implementations in here.
    let probes: Vec<Box<dyn SensorProbe>> = Vec::new();

    let supervisor = Supervisor::new(cfg);
    match supervisor.run(probes).await {
        Ok(()) => {
            info!("thermal-streamer exited cleanly");
        }
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
