//! The `MetricStore` capability consumed by the clearer, the scheduler,
//! and the HTTP handlers.

use std::collections::BTreeMap;

use crate::error::StoreResult;
use crate::types::*;

/// Name of the synthetic gauge exposing each group's last push time.
pub const PUSH_TIME_METRIC: &str = "push_time_seconds";

const PUSH_TIME_HELP: &str = "Last Unix time when this group was changed in the relay.";

/// Concurrency-safe map from grouping key to metric group.
///
/// Implementations own all locking; callers may invoke every method from
/// any number of tasks at once.
pub trait MetricStore: Send + Sync {
    /// Upsert the addressed group, or drop it if the request is a tombstone.
    fn submit_write_request(&self, req: WriteRequest) -> StoreResult<()>;

    /// Point-in-time copy of all groups.
    fn get_metric_families_map(&self) -> GroupingKeyToMetricGroup;

    /// All families across groups, merged by name, for exposition.
    fn get_metric_families(&self) -> Vec<MetricFamily>;

    fn healthy(&self) -> StoreResult<()>;

    fn ready(&self) -> StoreResult<()>;

    /// Flush and release resources. Calling it twice is a no-op.
    fn shutdown(&self) -> StoreResult<()>;
}

/// Merge the families of `groups` by name and append one
/// `push_time_seconds` sample per group.
///
/// Help text and type come from the first group carrying a family.
pub fn flatten_groups<'a>(groups: impl IntoIterator<Item = &'a MetricGroup>) -> Vec<MetricFamily> {
    let mut merged: BTreeMap<String, MetricFamily> = BTreeMap::new();
    let mut push_time = MetricFamily::new(PUSH_TIME_METRIC, MetricType::Gauge);
    push_time.help = Some(PUSH_TIME_HELP.to_string());

    for group in groups {
        for family in group.metric_families.values() {
            merged
                .entry(family.name.clone())
                .and_modify(|existing| existing.samples.extend(family.samples.iter().cloned()))
                .or_insert_with(|| family.clone());
        }
        push_time.samples.push(Sample {
            name: PUSH_TIME_METRIC.to_string(),
            labels: group.labels.as_map().clone(),
            value: group.last_push_seconds(),
            timestamp_ms: None,
        });
    }

    if !push_time.samples.is_empty() {
        merged.insert(push_time.name.clone(), push_time);
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(job: &str, family: &str, value: f64) -> MetricGroup {
        let mut f = MetricFamily::new(family, MetricType::Gauge);
        f.samples.push(Sample {
            name: family.to_string(),
            labels: [("job".to_string(), job.to_string())].into(),
            value,
            timestamp_ms: None,
        });
        MetricGroup {
            labels: GroupingKey::for_job(job),
            metric_families: [(family.to_string(), f)].into(),
            last_push_ms: 1_500,
        }
    }

    #[test]
    fn flatten_empty() {
        assert!(flatten_groups(std::iter::empty()).is_empty());
    }

    #[test]
    fn flatten_merges_same_family_across_groups() {
        let groups = [group("a", "temp", 1.0), group("b", "temp", 2.0)];
        let families = flatten_groups(&groups);

        let temp = families.iter().find(|f| f.name == "temp").unwrap();
        assert_eq!(temp.samples.len(), 2);

        let push_time = families.iter().find(|f| f.name == PUSH_TIME_METRIC).unwrap();
        assert_eq!(push_time.samples.len(), 2);
        assert_eq!(push_time.samples[0].value, 1.5);
    }
}
