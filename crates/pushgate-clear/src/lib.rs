//! pushgate-clear: expiring metric groups.
//!
//! `clear_all` tombstones every group present in a store snapshot.
//! `ClearScheduler` runs it on a fixed interval as an independent task and
//! stops when its shutdown channel fires.
//!
//! # Architecture
//!
//! ```text
//! ClearScheduler::run(shutdown)
//!   └── every interval (missed ticks coalesced)
//!       └── spawn_blocking(clear_all)
//!           ├── store.get_metric_families_map()
//!           └── store.submit_write_request(tombstone) per group
//! ```

pub mod clear;
pub mod scheduler;

pub use clear::clear_all;
pub use scheduler::{ClearScheduler, MIN_CLEAR_INTERVAL};
