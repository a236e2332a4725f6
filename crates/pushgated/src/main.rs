//! pushgated: the push-based metrics relay daemon.
//!
//! Accepts metric pushes from short-lived jobs and exposes them for
//! scraping. Optionally persists groups to disk, or clears them on a
//! fixed schedule.
//!
//! # Usage
//!
//! ```text
//! pushgated --web.listen-address :9091 --clear.interval 10m
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use pushgated::config::{duration_arg, Config};

#[derive(Parser)]
#[command(name = "pushgated", version, about = "Push-based metrics relay")]
struct Cli {
    /// Address to listen on for the web interface and API.
    #[arg(long = "web.listen-address", default_value = "0.0.0.0:9091")]
    listen_address: String,

    /// Path under which to expose metrics.
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    telemetry_path: String,

    /// URL under which the relay is externally reachable.
    #[arg(long = "web.external-url", default_value = "")]
    external_url: String,

    /// Prefix for all routes. Defaults to the path of the external URL.
    #[arg(long = "web.route-prefix", default_value = "")]
    route_prefix: String,

    /// File to persist metrics to. Empty keeps metrics in memory only.
    #[arg(long = "persistence.file", default_value = "")]
    persistence_file: String,

    /// Minimum interval between writes of the persistence file.
    #[arg(long = "persistence.interval", default_value = "5m", value_parser = duration_arg)]
    persistence_interval: Duration,

    /// Interval at which all groups are deleted. 0 disables clearing.
    #[arg(long = "clear.interval", default_value = "0m", value_parser = duration_arg)]
    clear_interval: Duration,

    /// Log output format.
    #[arg(long = "log.format", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            listen_address: self.listen_address,
            telemetry_path: self.telemetry_path,
            external_url: self.external_url,
            route_prefix: self.route_prefix,
            persistence_file: Some(self.persistence_file)
                .filter(|f| !f.is_empty())
                .map(PathBuf::from),
            persistence_interval: self.persistence_interval,
            clear_interval: self.clear_interval,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pushgated=debug,pushgate=debug"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    pushgated::run(cli.into_config()).await
}
