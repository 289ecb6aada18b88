//! The container runtime capability interface and its Docker-backed implementation.
//!
//! Modeled the same way as [`crate::store::Store`]: a small async trait injected at process
//! start, shaped around the Controller's needs (create-then-poll-status-then-tail-logs,
//! list-by-namespace for orphan detection) rather than a synchronous run-to-completion call.

mod archive;
mod docker;

pub use archive::extract_zip;
pub use docker::DockerRuntime;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::RuntimeError;

/// The runtime's view of one of our containers, keyed by the deterministic name the Controller
/// assigned it at creation (see `Job::container_name`).
#[derive(Debug, Clone)]
pub struct ObservedContainer {
    pub name: String,
    pub id: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited { exit_code: i64 },
}

/// A do-nothing runtime for tests that only exercise the Store/auth/HTTP layers and never touch
/// container lifecycle.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use futures::StreamExt;
    use futures::stream;

    pub struct NullRuntime;

    #[async_trait]
    impl ContainerRuntime for NullRuntime {
        async fn create_and_start(&self, _name: &str, _workspace: &std::path::Path) -> Result<String, RuntimeError> {
            Ok("null".to_string())
        }

        async fn status(&self, _name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
            Ok(None)
        }

        fn stream_logs(&self, _name: &str, _follow: bool) -> BoxStream<'static, Result<String, RuntimeError>> {
            stream::empty().boxed()
        }

        async fn remove(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn list_namespace(&self, _namespace_prefix: &str) -> Result<Vec<ObservedContainer>, RuntimeError> {
            Ok(Vec::new())
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container named `name`, mounting `workspace` read-only, running the fixed
    /// install-then-test command, and start it. Returns the runtime-assigned container id.
    async fn create_and_start(&self, name: &str, workspace: &std::path::Path) -> Result<String, RuntimeError>;

    /// Current status of a container by name, or `None` if the runtime has no such container.
    async fn status(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError>;

    /// Tail a container's combined stdout/stderr. `follow = true` keeps the stream open for
    /// new output; `false` reads what's buffered and closes. Each item is one decoded chunk,
    /// not necessarily a whole line.
    fn stream_logs(&self, name: &str, follow: bool) -> BoxStream<'static, Result<String, RuntimeError>>;

    /// Remove a container by name. Idempotent: removing an already-absent container is not
    /// an error.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// All containers whose name starts with `namespace_prefix` (the Controller's "observed"
    /// input for orphan detection).
    async fn list_namespace(&self, namespace_prefix: &str) -> Result<Vec<ObservedContainer>, RuntimeError>;
}
