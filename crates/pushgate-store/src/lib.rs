//! pushgate-store: the metric store behind the pushgate relay.
//!
//! Defines the `MetricStore` capability (upsert, tombstone, snapshot,
//! health, shutdown), the data model it operates on, and two
//! implementations: `DiskMetricStore` for production and
//! `MockMetricStore` for tests.
//!
//! # Architecture
//!
//! ```text
//! MetricStore (trait, Send + Sync)
//!   ├── DiskMetricStore
//!   │   ├── RwLock<GroupingKey → MetricGroup>
//!   │   └── optional redb file, written by run() and on shutdown()
//!   └── MockMetricStore (scripted snapshots, recorded writes)
//! ```
//!
//! A `WriteRequest` with no metric families is a tombstone and drops the
//! addressed group.

pub mod disk;
pub mod error;
pub mod mock;
pub mod store;
pub mod tables;
pub mod types;

pub use disk::DiskMetricStore;
pub use error::{StoreError, StoreResult};
pub use mock::MockMetricStore;
pub use store::{flatten_groups, MetricStore, PUSH_TIME_METRIC};
pub use types::*;
