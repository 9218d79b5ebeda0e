//! Public-facing TCP router.
//!
//! One listener per exposed public port (owned by the expose table); every
//! accepted connection lands in [`Router::dispatch`], which asks the
//! lifecycle side to wake the instance if needed and hand back a backend
//! stream, then splices the two full-duplex. The router deliberately holds
//! no instance state — only ids — so the ownership cycle with the lifecycle
//! manager is broken by the [`RouterBackend`] seam.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use aegis_shared::errors::{AegisError, AegisResult};

/// Stream to the guest side of a connection.
pub enum BackendConn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Pins an instance to `running` while connections are open. The lifecycle
/// side hands one out per dispatched connection; dropping it decrements the
/// count and re-arms the idle timers.
pub struct ConnGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnGuard {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Guard for paths that need no accounting (tests, internal dials).
    pub fn noop() -> Self {
        Self { on_drop: None }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// What the router needs from the lifecycle side: wake the instance if it
/// is paused (or enabled and stopped), resolve the backend address for the
/// guest port, dial it, and account for the active connection.
#[async_trait]
pub trait RouterBackend: Send + Sync {
    async fn connect(
        &self,
        instance_id: &str,
        guest_port: u16,
    ) -> AegisResult<(BackendConn, ConnGuard)>;
}

/// Dispatches accepted public connections to guests.
#[derive(Clone)]
pub struct Router {
    backend: Arc<Mutex<Option<Arc<dyn RouterBackend>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(Mutex::new(None)),
        }
    }

    /// Late-bound to break construction-order cycles: the lifecycle manager
    /// registers an adapter once it exists. The adapter holds the manager
    /// weakly, so this is not an ownership cycle.
    pub fn bind_backend(&self, backend: Arc<dyn RouterBackend>) {
        *self.backend.lock() = Some(backend);
    }

    /// Serve one accepted public connection to completion.
    pub async fn dispatch(
        &self,
        instance_id: &str,
        guest_port: u16,
        mut client: TcpStream,
    ) {
        let backend = self.backend.lock().clone();
        let Some(backend) = backend else {
            tracing::warn!(instance = instance_id, "router dispatch before backend bound");
            let _ = client.shutdown().await;
            return;
        };

        let (conn, _guard) = match backend.connect(instance_id, guest_port).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(
                    instance = instance_id,
                    guest_port,
                    error = %e,
                    "wake/dial failed, closing public connection"
                );
                let _ = client.shutdown().await;
                return;
            }
        };

        let result = match conn {
            BackendConn::Tcp(mut upstream) => {
                tokio::io::copy_bidirectional(&mut client, &mut upstream)
                    .await
                    .map(|_| ())
            }
            BackendConn::Unix(mut upstream) => {
                tokio::io::copy_bidirectional(&mut client, &mut upstream)
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = result {
            tracing::debug!(instance = instance_id, guest_port, error = %e, "splice ended with error");
        }
        // _guard drops here: connection count decremented, idle timer re-armed.
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial helper used by the lifecycle side when implementing
/// [`RouterBackend::connect`]. Understands the two backend address schemes:
/// `tcp:<ip>:<port>` (tap networking, direct dial) and `unix:<path>`
/// (userspace networking; a one-line JSON preamble names the guest port on
/// the multiplex socket).
pub async fn dial_backend(backend_addr: &str, guest_port: u16) -> AegisResult<BackendConn> {
    if let Some(addr) = backend_addr.strip_prefix("tcp:") {
        // Dial failures are transient: a freshly woken guest may not be
        // accepting yet.
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| AegisError::Io(format!("dial {addr}: {e}")))?;
        return Ok(BackendConn::Tcp(stream));
    }
    if let Some(path) = backend_addr.strip_prefix("unix:") {
        let mut stream = UnixStream::connect(path)
            .await
            .map_err(|e| AegisError::Io(format!("dial {path}: {e}")))?;
        let preamble = format!("{{\"port\":{guest_port}}}\n");
        stream
            .write_all(preamble.as_bytes())
            .await
            .map_err(|e| AegisError::Io(format!("preamble to {path}: {e}")))?;
        return Ok(BackendConn::Unix(stream));
    }
    Err(AegisError::Backend(format!(
        "unrecognized backend address '{backend_addr}'"
    )))
}

impl BackendConn {
    /// Split into read/write halves for manual splicing in tests.
    pub fn into_split(
        self,
    ) -> (
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    ) {
        match self {
            BackendConn::Tcp(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
            BackendConn::Unix(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::{TcpListener, UnixListener};

    struct EchoBackend {
        addr: String,
    }

    #[async_trait]
    impl RouterBackend for EchoBackend {
        async fn connect(
            &self,
            _instance_id: &str,
            guest_port: u16,
        ) -> AegisResult<(BackendConn, ConnGuard)> {
            let conn = dial_backend(&self.addr, guest_port).await?;
            Ok((conn, ConnGuard::noop()))
        }
    }

    #[tokio::test]
    async fn dispatch_splices_both_directions() {
        // "Guest": TCP echo server.
        let guest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let guest_addr = guest.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = guest.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let router = Router::new();
        router.bind_backend(Arc::new(EchoBackend {
            addr: format!("tcp:{guest_addr}"),
        }));

        // Public side.
        let public = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public_addr = public.local_addr().unwrap();
        let router_task = {
            let router = router.clone();
            tokio::spawn(async move {
                let (stream, _) = public.accept().await.unwrap();
                router.dispatch("i-1", 80, stream).await;
            })
        };

        let mut client = TcpStream::connect(public_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        router_task.await.unwrap();
    }

    #[tokio::test]
    async fn unix_dial_sends_port_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            line
        });

        let addr = format!("unix:{}", path.display());
        let _conn = dial_backend(&addr, 8080).await.unwrap();
        let preamble = server.await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(preamble.trim()).unwrap();
        assert_eq!(parsed["port"], 8080);
    }

    #[tokio::test]
    async fn guard_runs_on_drop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let guard = ConnGuard::new(move || {
            let _ = tx.send(());
        });
        drop(guard);
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[tokio::test]
    async fn dispatch_without_backend_closes_connection() {
        let router = Router::new();
        let public = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = public.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = public.accept().await.unwrap();
            router.dispatch("i-1", 80, stream).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        // Server closes promptly; read returns 0 bytes.
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        task.await.unwrap();
    }
}
