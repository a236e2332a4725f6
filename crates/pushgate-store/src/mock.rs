//! A scripted `MetricStore` for tests.
//!
//! Snapshots return whatever groups the test installed; write requests are
//! recorded instead of applied.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::{flatten_groups, MetricStore};
use crate::types::*;

#[derive(Default)]
pub struct MockMetricStore {
    groups: Mutex<GroupingKeyToMetricGroup>,
    requests: Mutex<Vec<WriteRequest>>,
    fail_writes: AtomicBool,
    shutdown_calls: AtomicUsize,
}

impl MockMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose snapshots return `groups`.
    pub fn with_groups(groups: impl IntoIterator<Item = MetricGroup>) -> Self {
        let mock = Self::new();
        mock.set_groups(groups);
        mock
    }

    pub fn set_groups(&self, groups: impl IntoIterator<Item = MetricGroup>) {
        *self.groups.lock() = groups
            .into_iter()
            .map(|g| (g.labels.clone(), g))
            .collect();
    }

    /// Make every following write fail with `StoreError::Write`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// All write requests submitted so far, oldest first.
    pub fn requests(&self) -> Vec<WriteRequest> {
        self.requests.lock().clone()
    }

    pub fn last_write_request(&self) -> Option<WriteRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

impl MetricStore for MockMetricStore {
    fn submit_write_request(&self, req: WriteRequest) -> StoreResult<()> {
        self.requests.lock().push(req);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("mock write failure".to_string()));
        }
        Ok(())
    }

    fn get_metric_families_map(&self) -> GroupingKeyToMetricGroup {
        self.groups.lock().clone()
    }

    fn get_metric_families(&self) -> Vec<MetricFamily> {
        flatten_groups(self.groups.lock().values())
    }

    fn healthy(&self) -> StoreResult<()> {
        Ok(())
    }

    fn ready(&self) -> StoreResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> StoreResult<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
