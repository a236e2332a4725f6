//! pushgate-api: HTTP surface of the relay.
//!
//! Routes push and delete requests into a shared `MetricStore` and exposes
//! its contents in the Prometheus text format. Every route is mounted under
//! the effective route prefix `P` computed by [`resolve_route_prefix`].
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | PUT | `P/metrics/job/{job}[/{*labels}]` | Replace a group |
//! | PUT | `P/metrics/job/{job}/` | Same as without the trailing `/` |
//! | POST | `P/metrics/job/{job}[/{*labels}]` | Merge into a group |
//! | DELETE | `P/metrics/job/{job}[/{*labels}]` | Delete a group |
//! | DELETE | `P/metrics/all` | Delete every group |
//! | GET | `P/-/healthy`, `P/-/ready` | Store health checks |
//! | GET | `P{telemetry_path}` | Text exposition |
//! | GET | `P/status`, `P/` | JSON status |

pub mod error;
pub mod exposition;
pub mod grouping;
pub mod handlers;
pub mod prefix;
pub mod stats;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, put, MethodRouter};
use axum::Router;

use pushgate_store::MetricStore;

pub use error::ApiError;
pub use prefix::{external_url_path, resolve_route_prefix};
pub use stats::RelayStats;

/// Shared state for relay handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn MetricStore>,
    pub stats: Arc<RelayStats>,
    /// Effective configuration, reported by `/status`.
    pub flags: Arc<BTreeMap<String, String>>,
}

/// Routing inputs resolved at startup.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Effective prefix: empty, or `/`-led without a trailing `/`.
    pub route_prefix: String,
    pub telemetry_path: String,
    pub flags: BTreeMap<String, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_prefix: String::new(),
            telemetry_path: "/metrics".to_string(),
            flags: BTreeMap::new(),
        }
    }
}

/// Build the complete relay router.
pub fn build_router(store: Arc<dyn MetricStore>, config: &RouterConfig) -> Router {
    let stats = Arc::new(RelayStats::new());
    let state = ApiState {
        store,
        stats: Arc::clone(&stats),
        flags: Arc::new(config.flags.clone()),
    };
    let p = config.route_prefix.as_str();

    let group_route = || -> MethodRouter<ApiState> {
        put(handlers::push_replace)
            .post(handlers::push_merge)
            .delete(handlers::delete_group)
    };

    Router::new()
        .route(&format!("{p}/metrics/job/{{job}}"), group_route())
        .route(&format!("{p}/metrics/job/{{job}}/"), group_route())
        .route(&format!("{p}/metrics/job/{{job}}/{{*labels}}"), group_route())
        .route(&format!("{p}/metrics/all"), delete(handlers::delete_all))
        .route(&format!("{p}/-/healthy"), get(handlers::healthy))
        .route(&format!("{p}/-/ready"), get(handlers::ready))
        .route(
            &format!("{p}{}", config.telemetry_path),
            get(handlers::metrics),
        )
        .route(&format!("{p}/status"), get(handlers::status))
        .route(&format!("{p}/"), get(handlers::status))
        .layer(middleware::from_fn_with_state(stats, stats::track_requests))
        .with_state(state)
}
