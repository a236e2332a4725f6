//! DiskMetricStore: the production `MetricStore`.
//!
//! Groups live in memory behind a `parking_lot::RwLock`. When a persistence
//! file is configured, the whole map is written to a redb database by the
//! persistence loop (`run`) whenever it changed, and once more on shutdown.
//! Persisted groups are loaded back on open.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{flatten_groups, MetricStore, PUSH_TIME_METRIC};
use crate::tables::GROUPS;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

struct Inner {
    groups: GroupingKeyToMetricGroup,
    /// Changed since the last successful persistence write.
    dirty: bool,
    closed: bool,
}

struct Persistence {
    db: Database,
    path: PathBuf,
}

/// In-memory metric store with optional redb persistence.
pub struct DiskMetricStore {
    inner: RwLock<Inner>,
    persistence: Option<Persistence>,
    interval: Duration,
}

impl DiskMetricStore {
    /// Open a store. With `path`, groups persisted there earlier are loaded
    /// and `interval` paces the persistence loop.
    pub fn open(path: Option<&Path>, interval: Duration) -> StoreResult<Self> {
        let (groups, persistence) = match path {
            Some(path) => {
                let db = Database::create(path).map_err(map_err!(Open))?;
                ensure_tables(&db)?;
                let groups = load_groups(&db)?;
                info!(?path, groups = groups.len(), "persisted metric groups loaded");
                (
                    groups,
                    Some(Persistence {
                        db,
                        path: path.to_path_buf(),
                    }),
                )
            }
            None => (BTreeMap::new(), None),
        };

        Ok(Self {
            inner: RwLock::new(Inner {
                groups,
                dirty: false,
                closed: false,
            }),
            persistence,
            interval,
        })
    }

    /// A purely in-memory store.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner {
                groups: BTreeMap::new(),
                dirty: false,
                closed: false,
            }),
            persistence: None,
            interval: Duration::ZERO,
        }
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.path.as_path())
    }

    /// Write all groups to the persistence file if anything changed.
    ///
    /// Returns the number of groups written, or `None` when there was
    /// nothing to do.
    pub fn persist(&self) -> StoreResult<Option<usize>> {
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };

        let groups = {
            let mut inner = self.inner.write();
            if !inner.dirty {
                return Ok(None);
            }
            inner.dirty = false;
            inner.groups.clone()
        };

        if let Err(e) = write_groups(&persistence.db, &groups) {
            self.inner.write().dirty = true;
            return Err(e);
        }
        debug!(groups = groups.len(), "metric groups persisted");
        Ok(Some(groups.len()))
    }

    /// Run the persistence loop until shutdown signal.
    ///
    /// Returns immediately for a store without a persistence file.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        info!(
            path = ?persistence.path,
            interval_secs = self.interval.as_secs(),
            "persistence loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.persist() {
                        error!(error = %e, "writing persistence file failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("persistence loop shutting down");
                    break;
                }
            }
        }
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.inner.read().closed {
            return Err(StoreError::ShutDown);
        }
        Ok(())
    }
}

impl MetricStore for DiskMetricStore {
    fn submit_write_request(&self, req: WriteRequest) -> StoreResult<()> {
        validate_grouping_key(&req.labels)?;

        if req.is_tombstone() {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(StoreError::ShutDown);
            }
            if inner.groups.remove(&req.labels).is_some() {
                inner.dirty = true;
                debug!(labels = %req.labels, "metric group deleted");
            }
            return Ok(());
        }

        let families = sanitize_families(&req.labels, req.metric_families)?;
        let pushed_at = unix_millis(req.timestamp);

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::ShutDown);
        }
        check_type_consistency(&inner.groups, &req.labels, &families)?;

        let group = inner
            .groups
            .entry(req.labels.clone())
            .or_insert_with(|| MetricGroup {
                labels: req.labels.clone(),
                metric_families: BTreeMap::new(),
                last_push_ms: pushed_at,
            });
        if req.replace {
            group.metric_families = families;
        } else {
            group.metric_families.extend(families);
        }
        group.last_push_ms = pushed_at;
        inner.dirty = true;

        debug!(labels = %req.labels, replace = req.replace, "metric group updated");
        Ok(())
    }

    fn get_metric_families_map(&self) -> GroupingKeyToMetricGroup {
        self.inner.read().groups.clone()
    }

    fn get_metric_families(&self) -> Vec<MetricFamily> {
        let inner = self.inner.read();
        flatten_groups(inner.groups.values())
    }

    fn healthy(&self) -> StoreResult<()> {
        self.check_open()
    }

    fn ready(&self) -> StoreResult<()> {
        self.check_open()
    }

    fn shutdown(&self) -> StoreResult<()> {
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
        }
        if let Some(n) = self.persist()? {
            info!(groups = n, "final persistence write done");
        }
        info!("metric store shut down");
        Ok(())
    }
}

// ── Write validation ───────────────────────────────────────────────

fn validate_grouping_key(labels: &GroupingKey) -> StoreResult<()> {
    match labels.job() {
        Some(job) if !job.is_empty() => {}
        _ => {
            return Err(StoreError::InvalidGroupingKey(
                "job label missing or empty".to_string(),
            ));
        }
    }
    if let Some((name, _)) = labels.iter().find(|(name, _)| !is_valid_label_name(name)) {
        return Err(StoreError::InvalidGroupingKey(format!(
            "invalid label name {name:?}"
        )));
    }
    Ok(())
}

/// Attach the grouping labels to every sample, rejecting samples that carry
/// a grouping label with a different value.
fn sanitize_families(
    labels: &GroupingKey,
    mut families: BTreeMap<String, MetricFamily>,
) -> StoreResult<BTreeMap<String, MetricFamily>> {
    if families.contains_key(PUSH_TIME_METRIC) {
        return Err(StoreError::ReservedName(PUSH_TIME_METRIC.to_string()));
    }
    for family in families.values_mut() {
        for sample in &mut family.samples {
            for (name, value) in labels.iter() {
                match sample.labels.get(name) {
                    Some(found) if found != value => {
                        return Err(StoreError::LabelConflict {
                            metric: sample.name.clone(),
                            label: name.to_string(),
                            found: found.clone(),
                            expected: value.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        sample.labels.insert(name.to_string(), value.to_string());
                    }
                }
            }
        }
    }
    Ok(families)
}

/// A family name must keep one type across all groups.
fn check_type_consistency(
    groups: &GroupingKeyToMetricGroup,
    labels: &GroupingKey,
    families: &BTreeMap<String, MetricFamily>,
) -> StoreResult<()> {
    for (key, group) in groups {
        if key == labels {
            continue;
        }
        for (name, family) in families {
            if let Some(existing) = group.metric_families.get(name) {
                if existing.metric_type != family.metric_type {
                    return Err(StoreError::InconsistentType {
                        name: name.clone(),
                        existing: existing.metric_type.to_string(),
                        pushed: family.metric_type.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

// ── redb access ────────────────────────────────────────────────────

fn ensure_tables(db: &Database) -> StoreResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(GROUPS).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

fn load_groups(db: &Database) -> StoreResult<GroupingKeyToMetricGroup> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
    let mut groups = BTreeMap::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let group: MetricGroup =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        groups.insert(group.labels.clone(), group);
    }
    Ok(groups)
}

fn write_groups(db: &Database, groups: &GroupingKeyToMetricGroup) -> StoreResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    txn.delete_table(GROUPS).map_err(map_err!(Table))?;
    {
        let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        for group in groups.values() {
            let key = group.labels.table_key();
            let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
    }
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn gauge(name: &str, value: f64) -> MetricFamily {
        let mut family = MetricFamily::new(name, MetricType::Gauge);
        family.samples.push(Sample {
            name: name.to_string(),
            labels: BTreeMap::new(),
            value,
            timestamp_ms: None,
        });
        family
    }

    fn push(labels: GroupingKey, families: Vec<MetricFamily>, replace: bool) -> WriteRequest {
        WriteRequest {
            labels,
            timestamp: SystemTime::now(),
            metric_families: families.into_iter().map(|f| (f.name.clone(), f)).collect(),
            replace,
        }
    }

    fn key(job: &str, instance: &str) -> GroupingKey {
        GroupingKey::for_job(job).with("instance", instance)
    }

    #[test]
    fn submit_and_snapshot() {
        let store = DiskMetricStore::in_memory();
        store
            .submit_write_request(push(key("j", "i"), vec![gauge("temp", 21.5)], true))
            .unwrap();

        let groups = store.get_metric_families_map();
        assert_eq!(groups.len(), 1);
        let group = &groups[&key("j", "i")];
        let sample = &group.metric_families["temp"].samples[0];
        assert_eq!(sample.labels.get("job").map(String::as_str), Some("j"));
        assert_eq!(sample.labels.get("instance").map(String::as_str), Some("i"));
    }

    #[test]
    fn tombstone_removes_group() {
        let store = DiskMetricStore::in_memory();
        store
            .submit_write_request(push(key("j", "i"), vec![gauge("temp", 1.0)], true))
            .unwrap();
        store
            .submit_write_request(WriteRequest::tombstone(key("j", "i")))
            .unwrap();
        assert!(store.get_metric_families_map().is_empty());

        // Tombstoning a missing group is fine.
        store
            .submit_write_request(WriteRequest::tombstone(key("j", "i")))
            .unwrap();
    }

    #[test]
    fn post_merges_and_put_replaces() {
        let store = DiskMetricStore::in_memory();
        store
            .submit_write_request(push(key("j", "i"), vec![gauge("a", 1.0), gauge("b", 2.0)], true))
            .unwrap();

        store
            .submit_write_request(push(key("j", "i"), vec![gauge("b", 3.0)], false))
            .unwrap();
        let group = &store.get_metric_families_map()[&key("j", "i")];
        assert_eq!(group.metric_families.len(), 2);
        assert_eq!(group.metric_families["b"].samples[0].value, 3.0);

        store
            .submit_write_request(push(key("j", "i"), vec![gauge("c", 4.0)], true))
            .unwrap();
        let group = &store.get_metric_families_map()[&key("j", "i")];
        assert_eq!(group.metric_families.keys().collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn rejects_conflicting_grouping_label() {
        let store = DiskMetricStore::in_memory();
        let mut family = gauge("temp", 1.0);
        family.samples[0]
            .labels
            .insert("instance".to_string(), "other".to_string());

        let err = store
            .submit_write_request(push(key("j", "i"), vec![family], true))
            .unwrap_err();
        assert!(matches!(err, StoreError::LabelConflict { .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn rejects_type_change_across_groups() {
        let store = DiskMetricStore::in_memory();
        store
            .submit_write_request(push(key("a", "1"), vec![gauge("temp", 1.0)], true))
            .unwrap();

        let mut counter = gauge("temp", 2.0);
        counter.metric_type = MetricType::Counter;
        let err = store
            .submit_write_request(push(key("b", "2"), vec![counter.clone()], true))
            .unwrap_err();
        assert!(matches!(err, StoreError::InconsistentType { .. }));

        // The same group may change its own type.
        store
            .submit_write_request(push(key("a", "1"), vec![counter], true))
            .unwrap();
    }

    #[test]
    fn rejects_reserved_name_and_missing_job() {
        let store = DiskMetricStore::in_memory();
        let err = store
            .submit_write_request(push(key("j", "i"), vec![gauge(PUSH_TIME_METRIC, 1.0)], true))
            .unwrap_err();
        assert!(matches!(err, StoreError::ReservedName(_)));

        let no_job = GroupingKey::new().with("instance", "i");
        let err = store
            .submit_write_request(push(no_job, vec![gauge("temp", 1.0)], true))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidGroupingKey(_)));
    }

    #[test]
    fn exposition_view_includes_push_time() {
        let store = DiskMetricStore::in_memory();
        store
            .submit_write_request(push(key("j", "i"), vec![gauge("temp", 1.0)], true))
            .unwrap();
        let names: Vec<String> = store
            .get_metric_families()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec![PUSH_TIME_METRIC.to_string(), "temp".to_string()]);
    }

    #[test]
    fn shutdown_closes_store() {
        let store = DiskMetricStore::in_memory();
        assert!(store.healthy().is_ok());
        store.shutdown().unwrap();
        // Idempotent.
        store.shutdown().unwrap();

        assert!(matches!(store.healthy(), Err(StoreError::ShutDown)));
        assert!(matches!(store.ready(), Err(StoreError::ShutDown)));
        let err = store
            .submit_write_request(push(key("j", "i"), vec![gauge("temp", 1.0)], true))
            .unwrap_err();
        assert!(matches!(err, StoreError::ShutDown));
    }

    #[test]
    fn persisted_groups_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.redb");

        {
            let store = DiskMetricStore::open(Some(&path), Duration::from_secs(300)).unwrap();
            store
                .submit_write_request(push(key("j", "i"), vec![gauge("temp", f64::INFINITY)], true))
                .unwrap();
            store.shutdown().unwrap();
        }

        let store = DiskMetricStore::open(Some(&path), Duration::from_secs(300)).unwrap();
        let groups = store.get_metric_families_map();
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[&key("j", "i")].metric_families["temp"].samples[0].value,
            f64::INFINITY
        );
    }

    #[test]
    fn persist_skips_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.redb");
        let store = DiskMetricStore::open(Some(&path), Duration::from_secs(300)).unwrap();

        assert_eq!(store.persist().unwrap(), None);
        store
            .submit_write_request(push(key("j", "i"), vec![gauge("temp", 1.0)], true))
            .unwrap();
        assert_eq!(store.persist().unwrap(), Some(1));
        assert_eq!(store.persist().unwrap(), None);
    }

    #[test]
    fn deleted_groups_do_not_come_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.redb");

        {
            let store = DiskMetricStore::open(Some(&path), Duration::from_secs(300)).unwrap();
            store
                .submit_write_request(push(key("a", "1"), vec![gauge("temp", 1.0)], true))
                .unwrap();
            store
                .submit_write_request(push(key("b", "2"), vec![gauge("temp", 2.0)], true))
                .unwrap();
            store.persist().unwrap();
            store
                .submit_write_request(WriteRequest::tombstone(key("a", "1")))
                .unwrap();
            store.shutdown().unwrap();
        }

        let store = DiskMetricStore::open(Some(&path), Duration::from_secs(300)).unwrap();
        let groups = store.get_metric_families_map();
        assert_eq!(groups.keys().cloned().collect::<Vec<_>>(), vec![key("b", "2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_persists_on_interval_and_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.redb");
        let store = std::sync::Arc::new(
            DiskMetricStore::open(Some(&path), Duration::from_secs(60)).unwrap(),
        );
        store
            .submit_write_request(push(key("j", "i"), vec![gauge("temp", 1.0)], true))
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let loop_store = store.clone();
        let handle = tokio::spawn(async move { loop_store.run(rx).await });

        tokio::time::sleep(Duration::from_secs(61)).await;
        // Already written by the loop.
        assert_eq!(store.persist().unwrap(), None);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
