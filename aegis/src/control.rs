//! Host side of the guest control channel.
//!
//! One [`ControlChannel`] per live harness connection: a single reader task
//! demultiplexes responses to in-flight calls by JSON-RPC id and fans
//! notifications out on a broadcast channel; a single writer half serializes
//! outbound requests. The unix listener itself outlives individual
//! connections — harnesses reconnect across pause/resume and the endpoint
//! just accepts again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use aegis_shared::errors::{AegisError, AegisResult};
use aegis_shared::rpc::{self, notifications, Message, Notification, Request, Response};

/// Notification fanout capacity; a lagging subscriber drops old frames.
const NOTIFY_CAP: usize = 512;

/// Default per-call deadline. `exec.start` acknowledgement also uses this —
/// the exec output itself is unbounded and arrives as notifications.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// A live, framed JSON-RPC connection to the in-guest harness.
pub struct ControlChannel {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    next_id: AtomicU64,
    pending: Pending,
    notifications: broadcast::Sender<Notification>,
    closed_rx: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl ControlChannel {
    /// Wrap an accepted harness connection.
    pub fn new(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self::from_io(read, write)
    }

    /// Generic constructor, used directly by tests over in-memory pipes.
    pub fn from_io(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAP);
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            BufReader::new(read),
            Arc::clone(&pending),
            notify_tx.clone(),
            closed_tx,
        ));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(write)),
            next_id: AtomicU64::new(1),
            pending,
            notifications: notify_tx,
            closed_rx,
            reader,
        }
    }

    /// Issue a request and await the matching response.
    pub async fn call(&self, method: &str, params: Value) -> AegisResult<Value> {
        self.call_with_timeout(method, params, CALL_TIMEOUT).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> AegisResult<Value> {
        if *self.closed_rx.borrow() {
            return Err(AegisError::Backend("control channel closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = Request::new(id, method, params);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = rpc::write_message(&mut *writer, &request).await {
                self.pending.lock().remove(&id);
                return Err(AegisError::Backend(format!("control channel write: {e}")));
            }
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(AegisError::Backend(
                    "control channel closed mid-call".into(),
                ))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(AegisError::Backend(format!(
                    "guest did not answer {method} within {}s",
                    timeout.as_secs()
                )));
            }
        };

        match (response.result, response.error) {
            (Some(result), None) => Ok(result),
            (_, Some(err)) => Err(AegisError::Backend(format!(
                "guest rejected {method}: {} (code {})",
                err.message, err.code
            ))),
            (None, None) => Ok(Value::Null),
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> AegisResult<()> {
        let note = Notification::new(method, params);
        let mut writer = self.writer.lock().await;
        rpc::write_message(&mut *writer, &note)
            .await
            .map_err(|e| AegisError::Backend(format!("control channel write: {e}")))
    }

    /// Live stream of guest notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Whether the transport has dropped.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves when the transport drops. While the VM is alive this is a
    /// fatal lifecycle event; during pause/resume it is the expected
    /// transport reset.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the harness `ready` announcement.
    pub async fn wait_ready(&self, timeout: Duration) -> AegisResult<Value> {
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, rx.recv()).await;
            match next {
                Ok(Ok(note)) if note.method == notifications::READY => {
                    return Ok(note.params);
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(AegisError::Backend(
                        "control channel closed before ready".into(),
                    ));
                }
                Err(_) => {
                    return Err(AegisError::Backend(format!(
                        "harness did not announce ready within {}s",
                        timeout.as_secs()
                    )));
                }
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: impl AsyncBufRead + Unpin,
    pending: Pending,
    notify_tx: broadcast::Sender<Notification>,
    closed_tx: watch::Sender<bool>,
) {
    loop {
        match rpc::read_message(&mut reader).await {
            Ok(Some(Message::Response(response))) => {
                let waiter = pending.lock().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(id = response.id, "response for unknown call id");
                    }
                }
            }
            Ok(Some(Message::Notification(note))) => {
                let _ = notify_tx.send(note);
            }
            Ok(Some(Message::Request(request))) => {
                // Guests only notify; a stray request gets a proper error so
                // a confused harness can see its mistake.
                tracing::warn!(method = %request.method, "unexpected request from guest");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "control channel read failed");
                break;
            }
        }
    }

    // Fail every in-flight call; their oneshot receivers observe the drop.
    pending.lock().clear();
    let _ = closed_tx.send(true);
}

/// Pre-bound host listener the guest harness dials. Lives for the whole VM
/// lifetime so reconnects after pause/resume land on the same path.
pub struct ControlEndpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl ControlEndpoint {
    /// Bind (replacing any stale socket file) before the hypervisor spawns,
    /// so the guest can never connect into the void.
    pub fn bind(path: &Path) -> AegisResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| AegisError::Io(format!("remove stale {}: {e}", path.display())))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AegisError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| AegisError::Backend(format!("bind {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the next harness connection within the deadline.
    pub async fn accept(&self, timeout: Duration) -> AegisResult<ControlChannel> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(ControlChannel::new(stream)),
            Ok(Err(e)) => Err(AegisError::Backend(format!(
                "accept on {}: {e}",
                self.path.display()
            ))),
            Err(_) => Err(AegisError::Backend(format!(
                "harness did not connect within {}s",
                timeout.as_secs()
            ))),
        }
    }
}

impl Drop for ControlEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};

    /// Fake guest: reads one request, answers it.
    async fn echo_guest(
        read: impl AsyncRead + Unpin,
        mut write: impl AsyncWrite + Unpin,
    ) {
        let mut reader = TokioBufReader::new(read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let req: Request = serde_json::from_str(&line).unwrap();
        let resp = Response::result(req.id, json!({"echo": req.method}));
        let mut out = serde_json::to_vec(&resp).unwrap();
        out.push(b'\n');
        write.write_all(&out).await.unwrap();
        write.flush().await.unwrap();
    }

    #[tokio::test]
    async fn call_matches_response_by_id() {
        let (host_io, guest_io) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (guest_read, guest_write) = tokio::io::split(guest_io);

        tokio::spawn(echo_guest(guest_read, guest_write));

        let channel = ControlChannel::from_io(host_read, host_write);
        let result = channel.call("guest.list_children", json!({})).await.unwrap();
        assert_eq!(result["echo"], "guest.list_children");
    }

    #[tokio::test]
    async fn error_response_surfaces_as_backend() {
        let (host_io, guest_io) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (guest_read, mut guest_write) = tokio::io::split(guest_io);

        tokio::spawn(async move {
            let mut reader = TokioBufReader::new(guest_read);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Request = serde_json::from_str(&line).unwrap();
            let resp = Response::error(req.id, -32601, "no such method");
            let mut out = serde_json::to_vec(&resp).unwrap();
            out.push(b'\n');
            guest_write.write_all(&out).await.unwrap();
        });

        let channel = ControlChannel::from_io(host_read, host_write);
        let err = channel.call("bogus", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("no such method"), "{err}");
    }

    #[tokio::test]
    async fn notifications_fan_out() {
        let (host_io, guest_io) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (_guest_read, mut guest_write) = tokio::io::split(guest_io);

        let channel = ControlChannel::from_io(host_read, host_write);
        let mut sub = channel.subscribe();

        let note = Notification::new(notifications::TETHER_FRAME, json!({"seq": 1}));
        let mut out = serde_json::to_vec(&note).unwrap();
        out.push(b'\n');
        guest_write.write_all(&out).await.unwrap();
        guest_write.flush().await.unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.method, notifications::TETHER_FRAME);
        assert_eq!(received.params["seq"], 1);
    }

    #[tokio::test]
    async fn wait_ready_sees_announcement() {
        let (host_io, guest_io) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (_guest_read, mut guest_write) = tokio::io::split(guest_io);

        let channel = ControlChannel::from_io(host_read, host_write);

        tokio::spawn(async move {
            for method in ["keepalive", "ready"] {
                let note = Notification::new(method, json!({}));
                let mut out = serde_json::to_vec(&note).unwrap();
                out.push(b'\n');
                guest_write.write_all(&out).await.unwrap();
            }
        });

        channel.wait_ready(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn transport_drop_fails_in_flight_calls() {
        let (host_io, guest_io) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_io);

        let channel = ControlChannel::from_io(host_read, host_write);
        // Guest vanishes without answering.
        drop(guest_io);

        let err = channel.call("shutdown", json!({})).await.unwrap_err();
        assert!(matches!(err, AegisError::Backend(_)));
        channel.wait_closed().await;
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn endpoint_accepts_reconnects_on_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let endpoint = ControlEndpoint::bind(&path).unwrap();

        for _ in 0..2 {
            let dial = path.clone();
            let client =
                tokio::spawn(async move { UnixStream::connect(dial).await.unwrap() });
            let channel = endpoint.accept(Duration::from_secs(5)).await.unwrap();
            let stream = client.await.unwrap();
            drop(stream);
            channel.wait_closed().await;
        }
    }
}
