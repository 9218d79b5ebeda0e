//! Workspace, secret, kit and status handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use aegis_shared::errors::AegisError;

use super::{ApiError, AppState};

/// `GET /v1/workspace` — system-managed workspace directories.
pub async fn workspace_list(
    State(manager): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let dir = manager.config().layout().workspaces_dir();
    let mut workspaces = Vec::new();
    if dir.exists() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| AegisError::Io(format!("read {}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                workspaces.push(json!({
                    "name": entry.file_name().to_string_lossy(),
                    "path": entry.path(),
                }));
            }
        }
    }
    Ok(Json(json!({"workspaces": workspaces})))
}

#[derive(Deserialize)]
pub struct WorkspaceCreateRequest {
    name: String,
}

/// `POST /v1/workspace` — create a named workspace directory.
pub async fn workspace_create(
    State(manager): State<AppState>,
    Json(request): Json<WorkspaceCreateRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.name.is_empty()
        || request
            .name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    {
        return Err(AegisError::Validation(format!(
            "workspace name \"{}\" must be alphanumeric with - or _",
            request.name
        ))
        .into());
    }
    let path = manager
        .config()
        .layout()
        .workspaces_dir()
        .join(&request.name);
    std::fs::create_dir_all(&path)
        .map_err(|e| AegisError::Io(format!("create {}: {e}", path.display())))?;
    Ok((StatusCode::CREATED, Json(json!({"path": path}))))
}

/// `GET /v1/secrets` — names and creation times, never values.
pub async fn secret_list(State(manager): State<AppState>) -> Result<Json<Value>, ApiError> {
    let secrets: Vec<Value> = manager
        .vault()
        .list()?
        .into_iter()
        .map(|(name, created_at)| json!({"name": name, "created_at": created_at}))
        .collect();
    Ok(Json(json!({"secrets": secrets})))
}

/// `GET /v1/secrets/{name}` — existence and metadata only.
pub async fn secret_get(
    State(manager): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match manager.vault().exists(&name)? {
        Some(created_at) => Ok(Json(json!({"name": name, "created_at": created_at}))),
        None => Err(AegisError::NotFound(format!("secret \"{name}\"")).into()),
    }
}

#[derive(Deserialize)]
pub struct SecretPutRequest {
    value: String,
}

/// `PUT /v1/secrets/{name}` — atomic upsert.
pub async fn secret_put(
    State(manager): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SecretPutRequest>,
) -> Result<StatusCode, ApiError> {
    manager.vault().put(&name, request.value.as_bytes())?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/secrets/{name}` — tolerant of absent names.
pub async fn secret_delete(
    State(manager): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager.vault().delete(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/kits`.
pub async fn kits(State(manager): State<AppState>) -> Json<Value> {
    let kits: Vec<Value> = manager
        .kits()
        .iter()
        .map(|(name, kit)| {
            json!({
                "name": name,
                "image": kit.image,
                "command": kit.command,
                "capabilities": kit.capabilities,
            })
        })
        .collect();
    Json(json!({"kits": kits}))
}

/// `GET /v1/status`.
pub async fn status(State(manager): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = manager.status()?;
    Ok(Json(serde_json::to_value(report).map_err(AegisError::from)?))
}
