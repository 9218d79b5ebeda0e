//! Instance CRUD and lifecycle verb handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use aegis_shared::errors::AegisError;

use crate::types::{InstanceRecord, InstanceSpec, InstanceState, PortProtocol};

use super::{ApiError, AppState};

#[derive(Deserialize)]
pub struct CreateRequest {
    #[serde(flatten)]
    spec: InstanceSpec,
    /// POST /v1/instances is create+start; `"start": false` opts out.
    #[serde(default = "default_true")]
    start: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create(
    State(manager): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<InstanceRecord>), ApiError> {
    let record = manager.create(request.spec).await?;
    let record = if request.start {
        manager.start(record.id.as_str()).await?
    } else {
        record
    };
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    state: Option<String>,
}

pub async fn list(
    State(manager): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<InstanceRecord>>, ApiError> {
    let state = query
        .state
        .as_deref()
        .map(InstanceState::parse)
        .transpose()?;
    Ok(Json(manager.list(state)?))
}

pub async fn get(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(manager.get(&id)?))
}

pub async fn destroy(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager.destroy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(manager.start(&id).await?))
}

pub async fn stop(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(manager.stop(&id).await?))
}

pub async fn disable(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(manager.disable(&id).await?))
}

pub async fn pause(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(manager.pause(&id).await?))
}

pub async fn resume(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(manager.resume(&id).await?))
}

#[derive(Deserialize)]
pub struct ExposeRequest {
    guest_port: u16,
    #[serde(default)]
    public_port: Option<u16>,
    #[serde(default)]
    protocol: Option<PortProtocol>,
}

pub async fn expose(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExposeRequest>,
) -> Result<Json<Value>, ApiError> {
    let bound = manager
        .expose(&id, request.guest_port, request.public_port, request.protocol)
        .await?;
    Ok(Json(json!({
        "guest_port": bound.guest_port,
        "public_port": bound.public_port,
        "protocol": bound.protocol,
    })))
}

pub async fn unexpose(
    State(manager): State<AppState>,
    Path((id, port)): Path<(String, u16)>,
) -> Result<StatusCode, ApiError> {
    manager.unexpose(&id, port).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PruneQuery {
    older_than: String,
}

pub async fn prune(
    State(manager): State<AppState>,
    Query(query): Query<PruneQuery>,
) -> Result<Json<Value>, ApiError> {
    let older_than = parse_duration(&query.older_than)?;
    let pruned = manager.prune(older_than).await?;
    let count = pruned.len();
    Ok(Json(json!({
        "pruned": pruned,
        "count": count,
    })))
}

/// Accepts `90s`, `15m`, `24h`, `7d`, or bare seconds.
pub(super) fn parse_duration(raw: &str) -> Result<std::time::Duration, AegisError> {
    let raw = raw.trim();
    let (number, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| AegisError::Validation(format!("bad duration \"{raw}\"")))?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => {
            return Err(AegisError::Validation(format!(
                "bad duration unit in \"{raw}\" (use s/m/h/d)"
            )))
        }
    };
    Ok(std::time::Duration::from_secs(secs))
}
