//! Docker-backed [`ContainerRuntime`], grounded on bollard's container lifecycle calls:
//! `create_container`/`HostConfig`/`start_container` carry the creation and start steps, and a
//! run-to-completion `wait_container` is replaced with a one-shot `inspect_container` poll,
//! since the Controller calls `status` once per reconciliation pass rather than blocking for
//! container exit.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::HostConfig;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerStatus, ObservedContainer};

/// Fixed mount point for the extracted project tree inside every job container.
const WORKSPACE_MOUNT: &str = "/workspace";

/// Installs dependencies, then runs the project's test suite with verbose output on stdout.
/// Projects submitted to this runner are expected to carry a `Cargo.toml` manifest; `cargo test`
/// both resolves and builds dependencies and runs the suite.
const TEST_COMMAND: &str = "cargo fetch --locked 2>&1 || cargo fetch; cargo test --verbose";

pub struct DockerRuntime {
    docker: Docker,
    image: String,
}

impl DockerRuntime {
    /// Connect to the local Docker Engine. Tries `DOCKER_HOST`/the default Unix socket first,
    /// then the Docker Desktop socket under `$HOME/.docker/run/docker.sock`.
    pub async fn connect(image: String) -> Result<Self, RuntimeError> {
        if let Ok(docker) = Docker::connect_with_local_defaults() {
            if docker.ping().await.is_ok() {
                return Ok(Self { docker, image });
            }
        }

        if let Some(home) = std::env::var_os("HOME") {
            let desktop_sock = Path::new(&home).join(".docker/run/docker.sock");
            if desktop_sock.exists() {
                if let Ok(docker) =
                    Docker::connect_with_socket(&desktop_sock.to_string_lossy(), 120, bollard::API_DEFAULT_VERSION)
                {
                    if docker.ping().await.is_ok() {
                        return Ok(Self { docker, image });
                    }
                }
            }
        }

        Err(RuntimeError::Unavailable(
            "no reachable Docker socket (checked DOCKER_HOST, /var/run/docker.sock, ~/.docker/run/docker.sock)"
                .to_string(),
        ))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, name: &str, workspace: &Path) -> Result<String, RuntimeError> {
        let workspace_str = workspace.display().to_string();

        let host_config = HostConfig {
            binds: Some(vec![format!("{workspace_str}:{WORKSPACE_MOUNT}:ro")]),
            memory: Some(1024 * 1024 * 1024),
            cpu_shares: Some(1024),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(HashMap::from([("/tmp".to_string(), "size=512M".to_string())])),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), TEST_COMMAND.to_string()]),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;

        Ok(response.id)
    }

    async fn status(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        let inspect = match self.docker.inspect_container(name, None).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                return Ok(None);
            }
            Err(e) => return Err(RuntimeError::Docker(e)),
        };

        let state = inspect.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            return Ok(Some(ContainerStatus::Running));
        }
        Ok(Some(ContainerStatus::Exited {
            exit_code: state.exit_code.unwrap_or(-1),
        }))
    }

    fn stream_logs(&self, name: &str, follow: bool) -> BoxStream<'static, Result<String, RuntimeError>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.docker
            .logs(name, Some(options))
            .map(|chunk| match chunk {
                Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) => {
                    Ok(String::from_utf8_lossy(&message).into_owned())
                }
                Ok(_) => Ok(String::new()),
                Err(e) => Err(RuntimeError::Docker(e)),
            })
            .filter(|item| stream::ready(!matches!(item, Ok(s) if s.is_empty())))
            .boxed()
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let result = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn list_namespace(&self, namespace_prefix: &str) -> Result<Vec<ObservedContainer>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![namespace_prefix.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|ns| ns.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                if !name.starts_with(namespace_prefix) {
                    return None;
                }
                let id = c.id?;
                let status = if c.state.as_deref() == Some("running") {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Exited {
                        exit_code: c
                            .status
                            .as_deref()
                            .and_then(|s| s.split("Exited (").nth(1))
                            .and_then(|s| s.split(')').next())
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(-1),
                    }
                };
                Some(ObservedContainer { name, id, status })
            })
            .collect())
    }
}
