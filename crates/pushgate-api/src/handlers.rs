//! Relay HTTP handlers.
//!
//! Push and delete handlers turn requests into `WriteRequest`s for the
//! shared `MetricStore`; the rest expose its contents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::{debug, info};

use pushgate_clear::clear_all;
use pushgate_store::*;

use crate::error::ApiError;
use crate::exposition::{parse_text, render_text, TEXT_CONTENT_TYPE};
use crate::grouping::grouping_key_from_path;
use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    data: T,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

const PROTOBUF_CONTENT_TYPE: &str = "application/vnd.google.protobuf";

fn grouping_key(params: &HashMap<String, String>) -> Result<GroupingKey, ApiError> {
    let job = params.get("job").map(String::as_str).unwrap_or_default();
    grouping_key_from_path(job, params.get("labels").map(String::as_str))
        .map_err(ApiError::BadRequest)
}

fn push(
    state: &ApiState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &str,
    replace: bool,
) -> Result<StatusCode, ApiError> {
    let key = grouping_key(params)?;

    if let Some(ct) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| ct.starts_with(PROTOBUF_CONTENT_TYPE))
    {
        return Err(ApiError::UnsupportedMediaType(ct.to_string()));
    }

    let metric_families = parse_text(body)?;
    if metric_families.is_empty() && !replace {
        debug!(group = %key, "empty POST body, nothing to merge");
        return Ok(StatusCode::ACCEPTED);
    }

    let families = metric_families.len();
    state.store.submit_write_request(WriteRequest {
        labels: key.clone(),
        timestamp: SystemTime::now(),
        metric_families,
        replace,
    })?;
    debug!(group = %key, families, replace, "push accepted");

    Ok(StatusCode::ACCEPTED)
}

// ── Push / delete ──────────────────────────────────────────────

/// PUT /metrics/job/{job}[/{*labels}]
pub async fn push_replace(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    push(&state, &params, &headers, &body, true)
}

/// POST /metrics/job/{job}[/{*labels}]
pub async fn push_merge(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    push(&state, &params, &headers, &body, false)
}

/// DELETE /metrics/job/{job}[/{*labels}]
pub async fn delete_group(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let key = grouping_key(&params)?;
    state
        .store
        .submit_write_request(WriteRequest::tombstone(key.clone()))?;
    debug!(group = %key, "group deleted");
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /metrics/all
pub async fn delete_all(State(state): State<ApiState>) -> Result<StatusCode, ApiError> {
    let store = Arc::clone(&state.store);
    let cleared = tokio::task::spawn_blocking(move || clear_all(store.as_ref()))
        .await
        .map_err(|e| ApiError::Internal(format!("clear task failed: {e}")))?;
    info!(cleared, "all groups deleted on request");
    Ok(StatusCode::ACCEPTED)
}

// ── Health ─────────────────────────────────────────────────────

fn health_response(result: StoreResult<()>) -> impl IntoResponse {
    match result {
        Ok(()) => (StatusCode::OK, "OK".to_string()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /-/healthy
pub async fn healthy(State(state): State<ApiState>) -> impl IntoResponse {
    health_response(state.store.healthy())
}

/// GET /-/ready
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    health_response(state.store.ready())
}

// ── Exposition ─────────────────────────────────────────────────

/// GET {telemetry_path}
///
/// Pushed families win over relay self-metrics of the same name.
pub async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let mut families = state.store.get_metric_families();
    let pushed: HashSet<String> = families.iter().map(|f| f.name.clone()).collect();
    families.extend(
        state
            .stats
            .families()
            .into_iter()
            .filter(|f| !pushed.contains(&f.name)),
    );

    (
        [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
        render_text(&families),
    )
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
pub struct GroupStatus {
    pub labels: GroupingKey,
    pub last_push_ms: u64,
    pub families: Vec<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub groups: Vec<GroupStatus>,
    pub flags: BTreeMap<String, String>,
}

/// GET /status and GET /
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let groups = state
        .store
        .get_metric_families_map()
        .into_values()
        .map(|group| GroupStatus {
            families: group.metric_families.keys().cloned().collect(),
            labels: group.labels,
            last_push_ms: group.last_push_ms,
        })
        .collect();

    ApiResponse::ok(StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        groups,
        flags: state.flags.as_ref().clone(),
    })
}
