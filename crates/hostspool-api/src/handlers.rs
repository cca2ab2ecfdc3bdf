//! REST API handlers.
//!
//! Each handler calls the `HostsPoolManager` and returns JSON responses.
//! Manager calls hit redb and may probe host connections, so they run on
//! the blocking pool, never on the async workers.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use hostspool_core::config::HOSTS_POOL_LOCATION_TYPE;
use hostspool_manager::{HostSpec, HostsPoolManager, PoolError, PoolResult};
use hostspool_state::{Connection, LocationConfig};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn status_of(err: &PoolError) -> StatusCode {
    match err.root() {
        PoolError::HostNotFound { .. }
        | PoolError::LocationNotFound(_)
        | PoolError::AllocationNotFound { .. } => StatusCode::NOT_FOUND,
        PoolError::DuplicateName(_)
        | PoolError::HostAllocated(_)
        | PoolError::OutdatedCheckpoint { .. } => StatusCode::CONFLICT,
        PoolError::FilterSyntax { .. }
        | PoolError::InvalidHostName(_)
        | PoolError::InvalidProperty { .. }
        | PoolError::UnsupportedPlacementPolicy(_)
        | PoolError::MultiplePlacementPolicies(_)
        | PoolError::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn pool_error(err: PoolError) -> Response {
    let status = status_of(&err);
    debug!(%status, error = %err, "request failed");
    error_response(&err.to_string(), status).into_response()
}

/// Run a manager call on the blocking pool.
async fn blocking<T, F>(state: &ApiState, call: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&HostsPoolManager) -> PoolResult<T> + Send + 'static,
{
    let manager = state.manager.clone();
    match tokio::task::spawn_blocking(move || call(&manager)).await {
        Ok(result) => result.map_err(pool_error),
        Err(e) => {
            error!(error = %e, "manager task failed");
            Err(error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR).into_response())
        }
    }
}

// ── Locations ──────────────────────────────────────────────────

/// Location body; the name comes from the path.
#[derive(Deserialize)]
pub struct LocationBody {
    #[serde(rename = "type")]
    pub location_type: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// GET /locations
pub async fn list_locations(State(state): State<ApiState>) -> impl IntoResponse {
    match blocking(&state, |m| m.locations()).await {
        Ok(locations) => {
            let names: Vec<String> = locations.into_iter().map(|l| l.name).collect();
            ApiResponse::ok(names).into_response()
        }
        Err(resp) => resp,
    }
}

/// GET /locations/{name}
pub async fn get_location(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match blocking(&state, move |m| m.get_location(&name)).await {
        Ok(location) => ApiResponse::ok(location).into_response(),
        Err(resp) => resp,
    }
}

/// PUT /locations/{name}
pub async fn create_location(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<LocationBody>,
) -> impl IntoResponse {
    let location = LocationConfig {
        name,
        location_type: body
            .location_type
            .unwrap_or_else(|| HOSTS_POOL_LOCATION_TYPE.to_string()),
        properties: body.properties,
    };
    let stored = location.clone();
    match blocking(&state, move |m| m.create_location(&stored)).await {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(location)).into_response(),
        Err(resp) => resp,
    }
}

/// PATCH /locations/{name}
pub async fn update_location(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<LocationBody>,
) -> impl IntoResponse {
    let lookup = name.clone();
    let current = match blocking(&state, move |m| m.get_location(&lookup)).await {
        Ok(location) => location,
        Err(resp) => return resp,
    };
    let location = LocationConfig {
        name,
        location_type: body.location_type.unwrap_or(current.location_type),
        properties: body.properties,
    };
    let stored = location.clone();
    match blocking(&state, move |m| m.update_location(&stored)).await {
        Ok(()) => ApiResponse::ok(location).into_response(),
        Err(resp) => resp,
    }
}

/// DELETE /locations/{name}
pub async fn delete_location(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match blocking(&state, move |m| m.delete_location(&name)).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(resp) => resp,
    }
}

// ── Pool ───────────────────────────────────────────────────────

/// GET /hosts_pool/{location}?filter=...&filter=...
pub async fn list_hosts(
    State(state): State<ApiState>,
    Path(location): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    let filters: Vec<String> = params
        .into_iter()
        .filter(|(k, _)| k == "filter")
        .map(|(_, v)| v)
        .collect();
    let listed = blocking(&state, move |m| {
        let filters: Vec<&str> = filters.iter().map(String::as_str).collect();
        m.list(&location, &filters)
    })
    .await;
    match listed {
        Ok(list) => ApiResponse::ok(list).into_response(),
        Err(resp) => resp,
    }
}

/// Whole-pool declaration.
#[derive(Deserialize)]
pub struct ApplyRequest {
    /// Pool checkpoint read from the last listing.
    pub checkpoint: u64,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
}

/// PUT /hosts_pool/{location}
pub async fn apply_hosts(
    State(state): State<ApiState>,
    Path(location): Path<String>,
    Json(req): Json<ApplyRequest>,
) -> impl IntoResponse {
    match blocking(&state, move |m| m.apply(&location, &req.hosts, req.checkpoint)).await {
        Ok(checkpoint) => ApiResponse::ok(serde_json::json!({ "checkpoint": checkpoint })).into_response(),
        Err(resp) => resp,
    }
}

// ── Hosts ──────────────────────────────────────────────────────

/// GET /hosts_pool/{location}/{host}
pub async fn get_host(
    State(state): State<ApiState>,
    Path((location, host)): Path<(String, String)>,
) -> impl IntoResponse {
    match blocking(&state, move |m| m.get_host(&location, &host)).await {
        Ok(host) => ApiResponse::ok(host).into_response(),
        Err(resp) => resp,
    }
}

#[derive(Deserialize)]
pub struct AddHostRequest {
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// PUT /hosts_pool/{location}/{host}
pub async fn add_host(
    State(state): State<ApiState>,
    Path((location, host)): Path<(String, String)>,
    Json(req): Json<AddHostRequest>,
) -> impl IntoResponse {
    let name = host.clone();
    match blocking(&state, move |m| m.add(&location, &name, req.connection, req.labels)).await {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(host)).into_response(),
        Err(resp) => resp,
    }
}

/// Partial host update: connection fields left empty are kept.
#[derive(Deserialize)]
pub struct UpdateHostRequest {
    pub connection: Option<Connection>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub remove_labels: Vec<String>,
}

/// PATCH /hosts_pool/{location}/{host}
pub async fn update_host(
    State(state): State<ApiState>,
    Path((location, host)): Path<(String, String)>,
    Json(req): Json<UpdateHostRequest>,
) -> impl IntoResponse {
    let updated = blocking(&state, move |m| {
        if let Some(connection) = &req.connection {
            m.update_connection(&location, &host, connection)?;
        }
        let mut warnings = Vec::new();
        if !req.labels.is_empty() {
            warnings = m.add_labels(&location, &host, &req.labels)?;
        }
        if !req.remove_labels.is_empty() {
            m.remove_labels(&location, &host, &req.remove_labels)?;
        }
        Ok((m.get_host(&location, &host)?, warnings))
    })
    .await;
    match updated {
        Ok((stored, warnings)) => {
            ApiResponse::ok(serde_json::json!({ "host": stored, "warnings": warnings }))
                .into_response()
        }
        Err(resp) => resp,
    }
}

/// DELETE /hosts_pool/{location}/{host}
pub async fn remove_host(
    State(state): State<ApiState>,
    Path((location, host)): Path<(String, String)>,
) -> impl IntoResponse {
    match blocking(&state, move |m| m.remove(&location, &host)).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(resp) => resp,
    }
}
