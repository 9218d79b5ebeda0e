//! Streaming endpoints (NDJSON) and the tether surface.

use std::collections::HashSet;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use aegis_shared::tether::TetherFrame;

use crate::tether::TetherQuery;

use super::{ApiError, AppState};

/// NDJSON content type shared by every streaming endpoint.
const NDJSON: &str = "application/x-ndjson";

/// One NDJSON line: the serialized value plus the mandatory trailing
/// newline.
fn line(value: &Value) -> Vec<u8> {
    let mut buf = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    buf.push(b'\n');
    buf
}

fn ndjson_response(body: Body) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, NDJSON)
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[derive(Deserialize)]
pub struct ExecRequest {
    argv: Vec<String>,
    /// Wake a paused instance before running. Default on.
    #[serde(default = "default_true")]
    auto_wake: bool,
}

fn default_true() -> bool {
    true
}

/// `POST /v1/instances/{id}/exec` — interleaved stdout/stderr frames, then
/// `{done: true, exit_code}`. The caller cancels by closing the stream.
pub async fn exec(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Response, ApiError> {
    let mut rx = manager.exec(&id, request.argv, request.auto_wake).await?;

    let stream = async_stream::stream! {
        while let Some(value) = rx.recv().await {
            let done = value.get("done").is_some() || value.get("error").is_some();
            yield Ok::<_, std::io::Error>(line(&value));
            if done {
                break;
            }
        }
    };
    Ok(ndjson_response(Body::from_stream(stream)))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    follow: Option<u8>,
}

/// `GET /v1/instances/{id}/logs[?follow=1]` — existing NDJSON lines, then
/// (with follow) live lines as they are appended.
pub async fn logs(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let record = manager.get(&id)?;
    let id = record.id.as_str().to_string();
    let follow = query.follow.unwrap_or(0) == 1;

    // Register interest before the file read: a line appended in between
    // would otherwise land in neither the replay nor the live stream. The
    // seam is at-least-once — a line may appear twice, never not at all.
    let live = follow.then(|| manager.logs().subscribe(&id));
    let existing = manager.logs().read_existing(&id)?;

    let stream = async_stream::stream! {
        for text in existing {
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => yield Ok::<_, std::io::Error>(line(&value)),
                Err(_) => continue,
            }
        }
        if let Some(mut rx) = live {
            loop {
                match rx.recv().await {
                    Ok(text) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => yield Ok(line(&value)),
                            Err(_) => continue,
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        yield Ok(line(&json!({"error": format!("log stream lagged, {n} lines dropped")})));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    };
    Ok(ndjson_response(Body::from_stream(stream)))
}

/// `POST /v1/instances/{id}/tether` — inject one frame; returns its seq.
pub async fn tether_send(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Json(frame): Json<TetherFrame>,
) -> Result<Json<Value>, ApiError> {
    let seq = manager.tether_send(&id, frame).await?;
    Ok(Json(json!({"seq": seq})))
}

#[derive(Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    after_seq: u64,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    session: Option<String>,
    /// Comma-separated frame type set.
    #[serde(default)]
    types: Option<String>,
    #[serde(default)]
    reply_to: Option<String>,
    /// Long-poll timeout; zero means return immediately.
    #[serde(default = "default_poll_timeout")]
    timeout_ms: u64,
}

fn default_poll_timeout() -> u64 {
    25_000
}

/// `GET /v1/instances/{id}/tether/poll` — event-driven long-poll.
pub async fn tether_poll(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Value>, ApiError> {
    let types: HashSet<String> = query
        .types
        .as_deref()
        .map(|raw| raw.split(',').map(str::trim).map(str::to_string).collect())
        .unwrap_or_default();

    let tether_query = TetherQuery {
        after_seq: query.after_seq,
        limit: query.limit,
        session_channel: query.channel,
        session_id: query.session,
        types,
        reply_to_msg_id: query.reply_to,
    };
    let wait = (query.timeout_ms > 0).then(|| Duration::from_millis(query.timeout_ms));
    let frames = manager.tether_poll(&id, tether_query, wait).await?;
    Ok(Json(json!({"frames": frames})))
}
