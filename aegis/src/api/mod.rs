//! REST control API over the per-user unix socket.
//!
//! Paths are stable client contract; streaming endpoints (logs, exec,
//! tether frames) emit NDJSON — one complete JSON object per line, flushed
//! per event — and surface stream errors as a final `{"error": "…"}` line.

mod error;
mod instances;
mod misc;
mod streams;

use std::path::Path;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router as AxumRouter;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use aegis_shared::errors::{AegisError, AegisResult};

use crate::lifecycle::InstanceManager;

pub use error::ApiError;

/// Shared handler state.
pub type AppState = Arc<InstanceManager>;

/// Assemble the `/v1` surface.
pub fn build_router(manager: AppState) -> AxumRouter {
    AxumRouter::new()
        .route(
            "/v1/instances",
            post(instances::create).get(instances::list),
        )
        .route("/v1/instances/prune", post(instances::prune))
        .route(
            "/v1/instances/:id",
            get(instances::get).delete(instances::destroy),
        )
        .route("/v1/instances/:id/start", post(instances::start))
        .route("/v1/instances/:id/stop", post(instances::stop))
        .route("/v1/instances/:id/disable", post(instances::disable))
        .route("/v1/instances/:id/pause", post(instances::pause))
        .route("/v1/instances/:id/resume", post(instances::resume))
        .route("/v1/instances/:id/expose", post(instances::expose))
        .route(
            "/v1/instances/:id/expose/:port",
            delete(instances::unexpose),
        )
        .route("/v1/instances/:id/exec", post(streams::exec))
        .route("/v1/instances/:id/logs", get(streams::logs))
        .route("/v1/instances/:id/tether", post(streams::tether_send))
        .route(
            "/v1/instances/:id/tether/poll",
            get(streams::tether_poll),
        )
        .route(
            "/v1/workspace",
            get(misc::workspace_list).post(misc::workspace_create),
        )
        .route("/v1/secrets", get(misc::secret_list))
        .route(
            "/v1/secrets/:name",
            get(misc::secret_get)
                .put(misc::secret_put)
                .delete(misc::secret_delete),
        )
        .route("/v1/kits", get(misc::kits))
        .route("/v1/status", get(misc::status))
        .with_state(manager)
}

/// Bind the control socket, replacing a stale file.
pub fn bind_control_socket(path: &Path) -> AegisResult<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| AegisError::Fatal(format!("remove stale {}: {e}", path.display())))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AegisError::Fatal(format!("create {}: {e}", parent.display())))?;
    }
    UnixListener::bind(path)
        .map_err(|e| AegisError::Fatal(format!("bind {}: {e}", path.display())))
}

/// Serve the API until the shutdown token fires. Each connection gets its
/// own task; in-flight requests finish on their own time.
pub async fn serve(
    manager: AppState,
    listener: UnixListener,
    shutdown: CancellationToken,
) -> AegisResult<()> {
    let app = build_router(manager);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = shutdown.cancelled() => return Ok(()),
        };
        let (stream, _addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "control socket accept failed");
                continue;
            }
        };

        let app = app.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                app.clone().oneshot(request)
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "control connection ended with error");
            }
        });
    }
}
