//! Group clearer: tombstones every group present in a store snapshot.

use tracing::{debug, warn};

use pushgate_store::{MetricStore, WriteRequest};

/// Submit a tombstone for every group in a fresh snapshot of `store`.
///
/// Groups pushed after the snapshot was taken survive. A push that lands
/// between the snapshot and the tombstone for its own key is lost.
///
/// Returns the number of tombstones the store accepted. Rejected ones are
/// logged and skipped.
pub fn clear_all<S: MetricStore + ?Sized>(store: &S) -> usize {
    let groups = store.get_metric_families_map();
    let total = groups.len();
    let mut cleared = 0;

    for group in groups.into_values() {
        let labels = group.labels;
        match store.submit_write_request(WriteRequest::tombstone(labels.clone())) {
            Ok(()) => cleared += 1,
            Err(e) => warn!(%labels, error = %e, "tombstone rejected"),
        }
    }

    debug!(cleared, total, "cleared metric groups");
    cleared
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    use pushgate_store::*;

    use super::*;

    fn gauge(name: &str) -> MetricFamily {
        let mut family = MetricFamily::new(name, MetricType::Gauge);
        family.samples.push(Sample {
            name: name.to_string(),
            labels: BTreeMap::new(),
            value: 1.0,
            timestamp_ms: None,
        });
        family
    }

    fn push(store: &dyn MetricStore, job: &str, instance: &str) {
        let family = gauge("up");
        store
            .submit_write_request(WriteRequest {
                labels: GroupingKey::for_job(job).with("instance", instance),
                timestamp: SystemTime::now(),
                metric_families: [(family.name.clone(), family)].into(),
                replace: true,
            })
            .unwrap();
    }

    fn group(job: &str, instance: &str) -> MetricGroup {
        MetricGroup {
            labels: GroupingKey::for_job(job).with("instance", instance),
            metric_families: [("up".to_string(), gauge("up"))].into(),
            last_push_ms: 0,
        }
    }

    #[test]
    fn clears_every_group() {
        let store = DiskMetricStore::in_memory();
        push(&store, "a", "1");
        push(&store, "b", "2");
        assert_eq!(store.get_metric_families_map().len(), 2);

        assert_eq!(clear_all(&store), 2);
        assert!(store.get_metric_families_map().is_empty());
    }

    #[test]
    fn clearing_twice_is_harmless() {
        let store = DiskMetricStore::in_memory();
        push(&store, "a", "1");

        clear_all(&store);
        assert!(store.get_metric_families_map().is_empty());
        assert_eq!(clear_all(&store), 0);
        assert!(store.get_metric_families_map().is_empty());
    }

    #[test]
    fn submits_exact_labels_as_tombstones() {
        let store = MockMetricStore::with_groups([group("a", "1"), group("b", "2")]);

        clear_all(&store);

        let requests = store.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(WriteRequest::is_tombstone));
        let labels: Vec<GroupingKey> = requests.into_iter().map(|r| r.labels).collect();
        assert_eq!(
            labels,
            vec![
                GroupingKey::for_job("a").with("instance", "1"),
                GroupingKey::for_job("b").with("instance", "2"),
            ]
        );
    }

    #[test]
    fn failed_tombstones_do_not_stop_the_rest() {
        let store = MockMetricStore::with_groups([group("a", "1"), group("b", "2")]);
        store.fail_writes(true);

        assert_eq!(clear_all(&store), 0);
        assert_eq!(store.requests().len(), 2);
    }

    #[test]
    fn works_through_trait_object() {
        let store: std::sync::Arc<dyn MetricStore> = std::sync::Arc::new(DiskMetricStore::in_memory());
        push(store.as_ref(), "j", "i");
        assert_eq!(store.get_metric_families_map().len(), 1);

        clear_all(store.as_ref());
        assert!(store.get_metric_families_map().is_empty());
    }
}
