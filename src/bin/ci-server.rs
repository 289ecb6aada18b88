//! Server binary: runs the API, the Controller, or both, per `--role`.
//!
//! One binary by default; `runs_api`/`runs_controller` let an operator split API and Controller
//! into separate processes behind the same `ci-server` binary if desired.

use std::sync::Arc;

use ci_runner::api::{self, ApiState};
use ci_runner::config::ServerConfig;
use ci_runner::controller::Controller;
use ci_runner::runtime::DockerRuntime;
use ci_runner::store::PostgresStore;
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = ServerConfig::load()?;

    let store: Arc<PostgresStore> = Arc::new(PostgresStore::connect(&config.database_url).await?);
    store.run_migrations().await?;

    tokio::fs::create_dir_all(&config.spool_dir).await?;

    let mut handles = Vec::new();
    let mut shutdown_senders = Vec::new();

    if config.runs_controller() {
        let runtime = Arc::new(DockerRuntime::connect(config.docker_image.clone()).await?);
        let controller = Controller::new(
            store.clone(),
            runtime,
            config.spool_dir.clone(),
            config.namespace_prefix.clone(),
            config.reconcile_interval(),
        );
        let (tx, rx) = oneshot::channel();
        shutdown_senders.push(tx);
        handles.push(tokio::spawn(async move {
            controller.run(rx).await;
        }));
    }

    if config.runs_api() {
        let runtime = Arc::new(DockerRuntime::connect(config.docker_image.clone()).await?);
        let state = ApiState {
            store: store.clone(),
            runtime,
            spool_dir: config.spool_dir.clone(),
            namespace_prefix: config.namespace_prefix.clone(),
            queued_stream_timeout: config.queued_stream_timeout(),
        };
        let addr: std::net::SocketAddr = config.bind_addr.parse()?;
        let (tx, rx) = oneshot::channel();
        shutdown_senders.push(tx);
        handles.push(tokio::spawn(async move {
            if let Err(e) = api::serve(state, addr, rx).await {
                tracing::error!(error = %e, "API server exited with an error");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    for tx in shutdown_senders {
        let _ = tx.send(());
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
