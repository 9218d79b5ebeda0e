//! Per-instance life-event logs.
//!
//! Every instance has an append-only NDJSON file at `data/logs/<id>.ndjson`
//! plus an in-memory broadcast channel for `logs?follow=1` subscribers. The
//! channel is pre-created at instance create time so subscribers attached
//! before the first boot never miss output. Guest stdout/stderr from the
//! main command and lifecycle transitions both land here.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use aegis_shared::errors::{AegisError, AegisResult};

use crate::config::Layout;

/// Follow-subscriber fanout capacity; laggards drop oldest lines.
const FOLLOW_CAP: usize = 1024;

/// Hub over all per-instance logs.
#[derive(Clone)]
pub struct LogHub {
    layout: Layout,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl LogHub {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pre-create the subscription channel and log file for an instance.
    pub fn ensure(&self, instance_id: &str) -> AegisResult<()> {
        self.sender(instance_id);
        let path = self.layout.instance_log_path(instance_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AegisError::Io(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AegisError::Io(format!("open {}: {e}", path.display())))?;
        Ok(())
    }

    /// Record a lifecycle event.
    pub fn event(&self, instance_id: &str, event: &str, detail: Value) {
        self.append_json(
            instance_id,
            json!({
                "ts": Utc::now(),
                "event": event,
                "detail": detail,
            }),
        );
    }

    /// Record one chunk of guest process output.
    pub fn output(&self, instance_id: &str, stream: &str, data: &str) {
        self.append_json(
            instance_id,
            json!({
                "ts": Utc::now(),
                "event": "output",
                "stream": stream,
                "data": data,
            }),
        );
    }

    /// Append an arbitrary JSON object as one NDJSON line.
    pub fn append_json(&self, instance_id: &str, value: Value) {
        let line = match serde_json::to_string(&value) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(instance = instance_id, error = %e, "unserializable log event");
                return;
            }
        };

        let path = self.layout.instance_log_path(instance_id);
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = written {
            tracing::warn!(instance = instance_id, error = %e, "life-event log write failed");
        }

        let _ = self.sender(instance_id).send(line);
    }

    /// Live stream of future log lines.
    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<String> {
        self.sender(instance_id).subscribe()
    }

    /// Existing log contents, one NDJSON line per entry.
    pub fn read_existing(&self, instance_id: &str) -> AegisResult<Vec<String>> {
        let path = self.layout.instance_log_path(instance_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| AegisError::Io(format!("read {}: {e}", path.display())))?;
        Ok(raw.lines().map(str::to_string).collect())
    }

    /// Drop the channel and delete the file (destroy/prune path).
    pub fn remove(&self, instance_id: &str) {
        self.channels.lock().remove(instance_id);
        let _ = std::fs::remove_file(self.layout.instance_log_path(instance_id));
    }

    fn sender(&self, instance_id: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(FOLLOW_CAP).0)
            .clone()
    }
}
