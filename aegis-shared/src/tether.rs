//! Tether frame envelope — the agent ↔ host conversation bus.
//!
//! Frames travel in both directions over the control channel
//! (`tether.frame` notifications) and over the HTTP tether endpoints. The
//! type string partitions direction: `user.*` and `control.*` flow host→guest
//! (ingress), everything else guest→host (egress). The per-instance `seq` is
//! assigned by the host-side store, never by the producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope version understood by this build.
pub const TETHER_VERSION: u32 = 1;

/// Which way a frame travels relative to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host → guest (`user.*`, `control.*`).
    Ingress,
    /// Guest → host (`assistant.*`, `status.*`, `event.*`, `error`).
    Egress,
}

/// Conversation coordinates a frame belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TetherSession {
    /// Transport surface, e.g. `"cli"`, `"web"`, `"mcp"`.
    pub channel: String,
    /// Opaque session identifier within the channel.
    pub id: String,
}

/// One envelope of the agent ↔ host message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherFrame {
    pub v: u32,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub ts: DateTime<Utc>,
    pub session: TetherSession,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    /// Host-assigned, strictly monotonic per instance. `None` until the
    /// store has accepted the frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl TetherFrame {
    pub fn new(frame_type: impl Into<String>, session: TetherSession, payload: Value) -> Self {
        Self {
            v: TETHER_VERSION,
            frame_type: frame_type.into(),
            ts: Utc::now(),
            session,
            msg_id: None,
            seq: None,
            payload,
        }
    }

    /// Direction implied by the type string, `None` for unknown families.
    pub fn direction(&self) -> Option<Direction> {
        let t = self.frame_type.as_str();
        if t.starts_with("user.") || t.starts_with("control.") {
            Some(Direction::Ingress)
        } else if t.starts_with("assistant.")
            || t.starts_with("status.")
            || t.starts_with("event.")
            || t == "error"
        {
            Some(Direction::Egress)
        } else {
            None
        }
    }
}
