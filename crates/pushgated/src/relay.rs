//! Relay lifecycle: Starting → Serving → Draining → ShuttingDown → Stopped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pushgate_api::{build_router, RouterConfig};
use pushgate_clear::ClearScheduler;
use pushgate_store::{DiskMetricStore, MetricStore};

use crate::config::Config;

/// Time in-flight requests get to finish once the listener is closed.
pub const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Serving,
    Draining,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        })
    }
}

fn enter(phase: Phase) {
    info!(%phase, "relay phase");
}

/// A started relay: store open and background loops running, not yet
/// serving.
pub struct Relay {
    config: Config,
    route_prefix: String,
    store: Arc<DiskMetricStore>,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Validate `config`, open the store, and launch the clear scheduler
    /// and persistence loop as configured.
    pub fn start(config: Config) -> anyhow::Result<Self> {
        enter(Phase::Starting);

        let scheduler_enabled = config.validate()?;
        let route_prefix = config.effective_route_prefix()?;

        let store = Arc::new(DiskMetricStore::open(
            config.persistence_file.as_deref(),
            config.persistence_interval,
        )?);
        info!(
            persistence = ?config.persistence_file,
            groups = store.get_metric_families_map().len(),
            "metric store opened"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut background = Vec::new();

        if scheduler_enabled {
            let scheduler = ClearScheduler::new(store.clone(), config.clear_interval);
            let rx = shutdown_rx.clone();
            background.push(tokio::spawn(async move { scheduler.run(rx).await }));
        } else {
            debug!("clear scheduler disabled");
        }

        if store.persistence_path().is_some() {
            let persister = Arc::clone(&store);
            let rx = shutdown_rx.clone();
            background.push(tokio::spawn(async move { persister.run(rx).await }));
        }

        Ok(Self {
            config,
            route_prefix,
            store,
            shutdown_tx,
            background,
        })
    }

    pub fn store(&self) -> Arc<dyn MetricStore> {
        self.store.clone()
    }

    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    /// Serve on `listener` until `signal` completes, then drain and stop.
    pub async fn serve(
        mut self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send,
    ) -> anyhow::Result<()> {
        let router = build_router(
            self.store(),
            &RouterConfig {
                route_prefix: self.route_prefix.clone(),
                telemetry_path: self.config.telemetry_path.clone(),
                flags: self.config.flags(),
            },
        );

        enter(Phase::Serving);
        match listener.local_addr() {
            Ok(addr) => info!(%addr, prefix = %self.route_prefix, "listening"),
            Err(e) => warn!(error = %e, "listener address unavailable"),
        }

        let mut stop_accepting = self.shutdown_tx.subscribe();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = stop_accepting.changed().await;
        });
        let mut server = tokio::spawn(async move { server.await });

        let server_done = tokio::select! {
            _ = signal => {
                info!("shutdown signal received");
                false
            }
            res = &mut server => {
                match res {
                    Ok(Ok(())) => error!("server exited unexpectedly"),
                    Ok(Err(e)) => error!(error = %e, "server failed"),
                    Err(e) => error!(error = %e, "server task panicked"),
                }
                true
            }
        };

        enter(Phase::Draining);
        self.stop_background().await;

        if !server_done {
            match tokio::time::timeout(DRAIN_GRACE, &mut server).await {
                Ok(_) => debug!("in-flight requests drained"),
                Err(_) => {
                    warn!(
                        grace_ms = DRAIN_GRACE.as_millis() as u64,
                        "drain grace elapsed, aborting server"
                    );
                    server.abort();
                }
            }
        }

        self.shutdown_store();
        Ok(())
    }

    /// Stop without serving, e.g. after a failed bind.
    pub async fn abort(mut self) {
        self.stop_background().await;
        self.shutdown_store();
    }

    /// Cancel the background loops and wait for them to exit.
    async fn stop_background(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "background task failed");
            }
        }
    }

    fn shutdown_store(self) {
        enter(Phase::ShuttingDown);
        if let Err(e) = self.store.shutdown() {
            error!(error = %e, "metric store shutdown failed");
        }
        enter(Phase::Stopped);
    }
}
