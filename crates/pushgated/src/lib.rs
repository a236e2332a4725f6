//! pushgated library: configuration and relay lifecycle, shared by the
//! binary and its integration tests.

pub mod config;
pub mod relay;

pub use config::{Config, ConfigError};
pub use relay::{Phase, Relay, DRAIN_GRACE};

use tokio::net::TcpListener;
use tracing::{error, info};

/// Run the relay until SIGINT or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let relay = Relay::start(config.clone())?;

    let addr = config.bind_address();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listener");
            relay.abort().await;
            return Err(e.into());
        }
    };

    relay.serve(listener, shutdown_signal()).await
}

/// Completes on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "signal received"),
        _ = terminate => info!(signal = "SIGTERM", "signal received"),
    }
}
