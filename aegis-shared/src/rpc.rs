//! Newline-framed JSON-RPC 2.0 over any [`AsyncRead`]/[`AsyncWrite`] stream.
//!
//! Exactly one complete JSON object per LF-terminated line. Requests carry a
//! monotonically assigned numeric id quoted by the matching response;
//! notifications carry no id. Readers scan to the newline and parse the whole
//! line — partial objects never cross a frame boundary.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version string stamped on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Maximum accepted line length (4 MiB). Guards the reader against a
/// misbehaving peer streaming an unterminated object.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Methods the host calls on the guest harness.
pub mod methods {
    pub const EXEC_START: &str = "exec.start";
    pub const SIGNAL_SEND: &str = "signal.send";
    pub const GUEST_LIST_CHILDREN: &str = "guest.list_children";
    pub const GUEST_SPAWN: &str = "guest.spawn";
    pub const GUEST_STOP_CHILD: &str = "guest.stop_child";
    pub const WORKSPACE_READ: &str = "workspace.read";
    pub const WORKSPACE_WRITE: &str = "workspace.write";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Notifications the guest harness sends to the host.
pub mod notifications {
    pub const READY: &str = "ready";
    pub const EXEC_OUTPUT: &str = "exec.output";
    pub const EXEC_EXIT: &str = "exec.exit";
    pub const TETHER_FRAME: &str = "tether.frame";
    pub const KEEPALIVE: &str = "keepalive";
    pub const KEEPALIVE_RELEASE: &str = "keepalive.release";
    pub const PORT_LISTEN: &str = "port.listen";
}

/// Outbound call with an id awaiting a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error member of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Reply quoting the request id; exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: Value::Null,
            }),
        }
    }
}

/// Fire-and-forget message without an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Any decoded wire message.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Classify one parsed line. `method` + `id` → request, bare `id` →
    /// response, bare `method` → notification.
    pub fn from_value(value: Value) -> io::Result<Message> {
        let raw: RawMessage = serde_json::from_value(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(Message::Request(Request {
                jsonrpc: raw.jsonrpc,
                id,
                method,
                params: raw.params,
            })),
            (Some(method), None) => Ok(Message::Notification(Notification {
                jsonrpc: raw.jsonrpc,
                method,
                params: raw.params,
            })),
            (None, Some(id)) => Ok(Message::Response(Response {
                jsonrpc: raw.jsonrpc,
                id,
                result: raw.result,
                error: raw.error,
            })),
            (None, None) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message carries neither method nor id",
            )),
        }
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Writes one message as a single LF-terminated line and flushes.
pub async fn write_message(
    w: &mut (impl AsyncWrite + Unpin),
    msg: &impl Serialize,
) -> io::Result<()> {
    let mut line =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await
}

/// Reads the next message, skipping blank lines. Returns `None` on EOF.
pub async fn read_message(r: &mut (impl AsyncBufRead + Unpin)) -> io::Result<Option<Message>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = r.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_LINE_BYTES} byte limit"),
            ));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        return Message::from_value(value).map(Some);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn request_round_trip() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let req = Request::new(7, methods::EXEC_START, json!({"argv": ["ls", "-la"]}));
        write_message(&mut tx, &req).await.unwrap();
        drop(tx);

        let mut rx = BufReader::new(rx);
        match read_message(&mut rx).await.unwrap().unwrap() {
            Message::Request(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.method, methods::EXEC_START);
                assert_eq!(r.params["argv"][0], "ls");
            }
            other => panic!("expected request, got {other:?}"),
        }
        assert!(read_message(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn response_quotes_request_id() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        write_message(&mut tx, &Response::result(42, json!({"ok": true})))
            .await
            .unwrap();
        write_message(&mut tx, &Response::error(43, -32601, "no such method"))
            .await
            .unwrap();
        drop(tx);

        let mut rx = BufReader::new(rx);
        match read_message(&mut rx).await.unwrap().unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, 42);
                assert_eq!(r.result.unwrap()["ok"], true);
            }
            other => panic!("expected response, got {other:?}"),
        }
        match read_message(&mut rx).await.unwrap().unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, 43);
                assert_eq!(r.error.unwrap().code, -32601);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notification_has_no_id() {
        let line = format!(
            "{}\n",
            json!({"jsonrpc": "2.0", "method": "ready", "params": {"pid": 1}})
        );
        let mut rx = BufReader::new(line.as_bytes());
        match read_message(&mut rx).await.unwrap().unwrap() {
            Message::Notification(n) => assert_eq!(n.method, notifications::READY),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let lines = format!(
            "\n\n{}\n",
            json!({"jsonrpc": "2.0", "method": "keepalive"})
        );
        let mut rx = BufReader::new(lines.as_bytes());
        assert!(matches!(
            read_message(&mut rx).await.unwrap().unwrap(),
            Message::Notification(_)
        ));
    }

    #[tokio::test]
    async fn rejects_message_without_method_or_id() {
        let line = "{\"jsonrpc\": \"2.0\"}\n";
        let mut rx = BufReader::new(line.as_bytes());
        assert!(read_message(&mut rx).await.is_err());
    }

    #[tokio::test]
    async fn rejects_garbage_line() {
        let mut rx = BufReader::new(&b"not json at all\n"[..]);
        assert!(read_message(&mut rx).await.is_err());
    }

    #[tokio::test]
    async fn every_written_line_is_one_object() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        write_message(&mut tx, &Notification::new("keepalive", Value::Null))
            .await
            .unwrap();
        write_message(&mut tx, &Notification::new("keepalive.release", Value::Null))
            .await
            .unwrap();
        drop(tx);

        use tokio::io::AsyncReadExt;
        let mut raw = String::new();
        rx.read_to_string(&mut raw).await.unwrap();
        for line in raw.lines() {
            let v: Value = serde_json::from_str(line).expect("each line parses standalone");
            assert!(v.get("method").is_some());
        }
        assert!(raw.ends_with('\n'));
    }
}
