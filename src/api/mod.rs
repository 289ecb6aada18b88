//! The stateless HTTP front-end: authentication, job submission, and live log streaming.
//!
//! Authenticated routes carry a `route_layer` auth middleware; the health route is added after
//! the layer so it stays open without a credential; `serve` wires `axum::serve` to a graceful
//! shutdown signal.

mod auth;
mod handlers;
mod streaming;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

/// Upper bound on a submitted project archive; rejected with `413` beyond this.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

use crate::runtime::ContainerRuntime;
use crate::store::Store;

pub use auth::AuthedUser;

/// Shared state handed to every handler and to the auth middleware.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub spool_dir: PathBuf,
    pub namespace_prefix: String,
    pub queued_stream_timeout: Duration,
}

/// Build the router. Every route except `/healthz` requires a valid bearer API key.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/submit-stream", post(handlers::submit_stream))
        .route("/submit-async", post(handlers::submit_async))
        .route("/jobs/{id}/stream", get(handlers::stream_job))
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/jobs", get(handlers::list_jobs))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Bind `addr` and serve the router until `shutdown` fires.
pub async fn serve(
    state: ApiState,
    addr: std::net::SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
            tracing::info!("API shutting down");
        })
        .await
}
