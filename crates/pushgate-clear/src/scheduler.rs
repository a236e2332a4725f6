//! Clear scheduler: runs the group clearer on a fixed interval until
//! cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use pushgate_store::MetricStore;

use crate::clear::clear_all;

/// Shortest interval the scheduler may be configured with.
pub const MIN_CLEAR_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically clears every group of a shared store.
pub struct ClearScheduler {
    store: Arc<dyn MetricStore>,
    interval: Duration,
}

impl ClearScheduler {
    /// Create a scheduler. `interval` must already be validated against
    /// `MIN_CLEAR_INTERVAL`.
    pub fn new(store: Arc<dyn MetricStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the clear loop until shutdown signal.
    ///
    /// The first clear happens one full interval after start. A clear that
    /// overruns the interval is followed by a single immediate tick, then
    /// the original schedule resumes. A clear in progress when the signal
    /// arrives finishes first; none starts afterwards.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "clear scheduler started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("clear scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // Store calls may block; keep them off the async workers.
                    let store = Arc::clone(&self.store);
                    match tokio::task::spawn_blocking(move || clear_all(store.as_ref())).await {
                        Ok(cleared) => info!(cleared, "scheduled clear finished"),
                        Err(e) => error!(error = %e, "scheduled clear failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    use pushgate_store::*;

    use super::*;

    fn push(store: &DiskMetricStore, job: &str) {
        let mut family = MetricFamily::new("up", MetricType::Gauge);
        family.samples.push(Sample {
            name: "up".to_string(),
            labels: BTreeMap::new(),
            value: 1.0,
            timestamp_ms: None,
        });
        store
            .submit_write_request(WriteRequest {
                labels: GroupingKey::for_job(job),
                timestamp: SystemTime::now(),
                metric_families: [("up".to_string(), family)].into(),
                replace: true,
            })
            .unwrap();
    }

    fn spawn_scheduler(
        store: Arc<DiskMetricStore>,
        interval: Duration,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let scheduler = ClearScheduler::new(store, interval);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        (tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn first_clear_waits_one_interval() {
        let store = Arc::new(DiskMetricStore::in_memory());
        push(&store, "a");
        let (tx, handle) = spawn_scheduler(store.clone(), MIN_CLEAR_INTERVAL);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(store.get_metric_families_map().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get_metric_families_map().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn clears_on_every_tick() {
        let store = Arc::new(DiskMetricStore::in_memory());
        let (tx, handle) = spawn_scheduler(store.clone(), Duration::from_secs(120));

        push(&store, "a");
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(store.get_metric_families_map().is_empty());

        push(&store, "b");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.get_metric_families_map().len(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.get_metric_families_map().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_clear_after_cancellation() {
        let store = Arc::new(DiskMetricStore::in_memory());
        let (tx, handle) = spawn_scheduler(store.clone(), MIN_CLEAR_INTERVAL);

        tx.send(true).unwrap();
        handle.await.unwrap();

        push(&store, "a");
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(store.get_metric_families_map().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_stops_scheduler() {
        let store = Arc::new(DiskMetricStore::in_memory());
        let (tx, handle) = spawn_scheduler(store, MIN_CLEAR_INTERVAL);
        drop(tx);
        handle.await.unwrap();
    }

    /// Store whose snapshot reports each clear start, then blocks until the
    /// test releases it.
    struct GatedStore {
        inner: MockMetricStore,
        started: tokio::sync::mpsc::UnboundedSender<()>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl MetricStore for GatedStore {
        fn submit_write_request(&self, req: WriteRequest) -> StoreResult<()> {
            self.inner.submit_write_request(req)
        }

        fn get_metric_families_map(&self) -> GroupingKeyToMetricGroup {
            self.started.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            self.inner.get_metric_families_map()
        }

        fn get_metric_families(&self) -> Vec<MetricFamily> {
            self.inner.get_metric_families()
        }

        fn healthy(&self) -> StoreResult<()> {
            self.inner.healthy()
        }

        fn ready(&self) -> StoreResult<()> {
            self.inner.ready()
        }

        fn shutdown(&self) -> StoreResult<()> {
            self.inner.shutdown()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_clear_gets_one_catch_up_tick() {
        let (started_tx, mut started) = tokio::sync::mpsc::unbounded_channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: MockMetricStore::new(),
            started: started_tx,
            release: std::sync::Mutex::new(release_rx),
        });

        let start = Instant::now();
        let (tx, rx) = watch::channel(false);
        let scheduler = ClearScheduler::new(store, MIN_CLEAR_INTERVAL);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        // First clear on the grid, then held past the 120s tick.
        started.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(90)).await;
        release.send(()).unwrap();

        // The missed tick fires once, immediately.
        started.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(150));
        release.send(()).unwrap();

        // Later clears stay on the original grid.
        started.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        release.send(()).unwrap();

        started.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(240));
        release.send(()).unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let (_tx, rx) = watch::channel(true);
        let scheduler = ClearScheduler::new(Arc::new(MockMetricStore::new()), MIN_CLEAR_INTERVAL);
        scheduler.run(rx).await;
    }
}
