//! The reconciliation controller: a singleton, level-triggered loop that converges the
//! container runtime to the job state declared in the Store.
//!
//! A `oneshot` shutdown signal is awaited alongside the loop's own tick so the controller owns
//! the runtime handle for its whole lifetime and releases it cleanly on shutdown.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ControllerError, RuntimeError};
use crate::model::{Job, JobEvent, JobEventType, JobStatus};
use crate::runtime::{ContainerRuntime, ContainerStatus};
use crate::store::Store;

/// Per-job operation timeout, so a single hung runtime call can't stall the whole pass.
const JOB_OP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Controller {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    spool_dir: PathBuf,
    namespace_prefix: String,
    reconcile_interval: Duration,
}

impl Controller {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        spool_dir: PathBuf,
        namespace_prefix: String,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            spool_dir,
            namespace_prefix,
            reconcile_interval,
        }
    }

    /// Run reconciliation passes on `reconcile_interval` until `shutdown` fires. Passes never
    /// overlap: each tick awaits the previous pass's completion before starting the next.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::error!(error = %e, "reconciliation pass failed");
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("controller shutting down");
                    return;
                }
            }
        }
    }

    /// Execute one reconciliation pass. Idempotent: running it twice on an unchanged world is a
    /// no-op the second time. Per-job failures are logged and leave that job to be retried next
    /// pass; only a failure to read the desired/observed sets at all aborts the pass.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<(), ControllerError> {
        let active = self.store.list_active_jobs().await?;
        let observed = self.runtime.list_namespace(&self.namespace_prefix).await?;
        let observed_by_name: std::collections::HashMap<_, _> =
            observed.iter().map(|c| (c.name.clone(), c.status)).collect();

        // Phase 1: terminal transitions for jobs already running, so exited/lost containers
        // are resolved (and their capacity freed) before we launch anything new.
        for job in active.iter().filter(|j| j.status == JobStatus::Running) {
            let name = job.container_name(&self.namespace_prefix);
            if let Err(e) = self.reconcile_running(job, observed_by_name.get(&name).copied()).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to reconcile running job");
            }
        }

        // Phase 2: new creations for queued jobs.
        for job in active.iter().filter(|j| j.status == JobStatus::Queued) {
            if let Err(e) = self.reconcile_queued(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to reconcile queued job");
            }
        }

        // Phase 3: orphan cleanup. Anything in the runtime's namespace that doesn't belong to a
        // currently-active job is either a stray container from a finished job or a true orphan;
        // either way it gets removed. Re-read active jobs since phase 1/2 may have changed them.
        let active_after = self.store.list_active_jobs().await?;
        let active_names: HashSet<String> = active_after
            .iter()
            .map(|j| j.container_name(&self.namespace_prefix))
            .collect();

        for container in &observed {
            if !active_names.contains(&container.name) {
                if let Err(e) = self.runtime.remove(&container.name).await {
                    tracing::warn!(container = %container.name, error = %e, "failed to remove orphan container");
                }
            }
        }

        // Terminal jobs' stashed zips are removed at container-creation time on the happy path;
        // this sweep catches the failure path where creation never got that far.
        let all_jobs = self.store.list_jobs(None).await?;
        for job in all_jobs.iter().filter(|j| j.status.is_terminal()) {
            remove_stash(Path::new(&job.zip_file_path));
        }

        Ok(())
    }

    async fn reconcile_running(
        &self,
        job: &Job,
        observed_status: Option<ContainerStatus>,
    ) -> Result<(), ControllerError> {
        match observed_status {
            Some(ContainerStatus::Running) => Ok(()),
            Some(ContainerStatus::Exited { exit_code }) => {
                let success = exit_code == 0;
                self.append_event(job.id, JobEventType::Complete, None, Some(success))
                    .await;
                self.store.complete_job(job.id, success, Utc::now()).await?;
                Ok(())
            }
            None => {
                self.append_event(
                    job.id,
                    JobEventType::Log,
                    Some("Container lost during execution".to_string()),
                    None,
                )
                .await;
                self.append_event(job.id, JobEventType::Complete, None, Some(false))
                    .await;
                self.store.complete_job(job.id, false, Utc::now()).await?;
                Ok(())
            }
        }
    }

    async fn reconcile_queued(&self, job: &Job) -> Result<(), ControllerError> {
        let result = tokio::time::timeout(JOB_OP_TIMEOUT, self.create_and_start(job)).await;

        match result {
            Ok(Ok(container_id)) => {
                self.store
                    .update_job_status(job.id, JobStatus::Running, Some(Utc::now()), Some(&container_id))
                    .await?;
                Ok(())
            }
            Ok(Err(e)) => {
                self.append_event(job.id, JobEventType::Log, Some(e.to_string()), None)
                    .await;
                self.append_event(job.id, JobEventType::Complete, None, Some(false))
                    .await;
                self.store.complete_job(job.id, false, Utc::now()).await?;
                Ok(())
            }
            Err(_) => {
                tracing::warn!(job_id = %job.id, "container creation timed out, will retry next pass");
                Ok(())
            }
        }
    }

    async fn create_and_start(&self, job: &Job) -> Result<String, RuntimeError> {
        let scratch = self.spool_dir.join(format!("extract-{}", job.id));
        let zip_path = PathBuf::from(&job.zip_file_path);

        // Extraction walks every entry in the archive with blocking filesystem calls; run it on
        // the blocking pool so it doesn't stall the runtime's worker threads, which the API also
        // shares for request handling.
        let extract_dir = scratch.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&extract_dir)?;
            crate::runtime::extract_zip(&zip_path, &extract_dir)
        })
        .await
        .map_err(|e| RuntimeError::CreateFailed(format!("extraction task panicked: {e}")))??;

        let name = job.container_name(&self.namespace_prefix);
        let container_id = self.runtime.create_and_start(&name, &scratch).await?;

        // The container holds its own copy; the stash is no longer needed.
        remove_stash(Path::new(&job.zip_file_path));

        Ok(container_id)
    }

    async fn append_event(
        &self,
        job_id: Uuid,
        event_type: JobEventType,
        data: Option<String>,
        success: Option<bool>,
    ) {
        let event = JobEvent {
            id: 0,
            job_id,
            event_type,
            data,
            success,
            sequence: 0,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.append_job_event(job_id, event).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to persist job event");
        }
    }
}

fn remove_stash(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove stashed zip");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ObservedContainer;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory fake of the container runtime, so Controller tests don't need Docker.
    #[derive(Default)]
    struct FakeRuntime {
        containers: Mutex<HashMap<String, ContainerStatus>>,
    }

    impl FakeRuntime {
        fn set(&self, name: &str, status: ContainerStatus) {
            self.containers.lock().unwrap().insert(name.to_string(), status);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_and_start(&self, name: &str, _workspace: &Path) -> Result<String, RuntimeError> {
            self.containers
                .lock()
                .unwrap()
                .insert(name.to_string(), ContainerStatus::Running);
            Ok(format!("fake-{name}"))
        }

        async fn status(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
            Ok(self.containers.lock().unwrap().get(name).copied())
        }

        fn stream_logs(&self, _name: &str, _follow: bool) -> BoxStream<'static, Result<String, RuntimeError>> {
            stream::empty().boxed()
        }

        async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
            self.containers.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_namespace(&self, namespace_prefix: &str) -> Result<Vec<ObservedContainer>, RuntimeError> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name.starts_with(namespace_prefix))
                .map(|(name, status)| ObservedContainer {
                    name: name.clone(),
                    id: format!("fake-{name}"),
                    status: *status,
                })
                .collect())
        }
    }

    fn test_zip(dir: &Path) -> String {
        let path = dir.join("project.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("Cargo.toml", options).unwrap();
        writer.finish().unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn new_controller(store: Arc<MemoryStore>, runtime: Arc<FakeRuntime>, spool_dir: &Path) -> Controller {
        Controller::new(
            store,
            runtime,
            spool_dir.to_path_buf(),
            "ci".to_string(),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn queued_job_gets_a_container_and_transitions_to_running() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::default());
        let user = store.create_user("Ada", "ada@example.com").await.unwrap();
        let job = Job::new(user.id, test_zip(tmp.path()));
        store.create_job(&job).await.unwrap();

        let controller = new_controller(store.clone(), runtime.clone(), tmp.path()).await;
        controller.reconcile_once().await.unwrap();

        let reloaded = store.get_job(job.id, None).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Running);
        assert!(reloaded.container_id.is_some());
    }

    #[tokio::test]
    async fn running_job_completes_when_container_exits_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::default());
        let user = store.create_user("Ada", "ada@example.com").await.unwrap();
        let job = Job::new(user.id, test_zip(tmp.path()));
        store.create_job(&job).await.unwrap();
        store
            .update_job_status(job.id, JobStatus::Running, Some(Utc::now()), Some("c1"))
            .await
            .unwrap();
        let name = job.container_name("ci");
        runtime.set(&name, ContainerStatus::Exited { exit_code: 0 });

        let controller = new_controller(store.clone(), runtime.clone(), tmp.path()).await;
        controller.reconcile_once().await.unwrap();

        let reloaded = store.get_job(job.id, None).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
        assert_eq!(reloaded.success, Some(true));
    }

    #[tokio::test]
    async fn running_job_fails_when_container_nonzero_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::default());
        let user = store.create_user("Ada", "ada@example.com").await.unwrap();
        let job = Job::new(user.id, test_zip(tmp.path()));
        store.create_job(&job).await.unwrap();
        store
            .update_job_status(job.id, JobStatus::Running, Some(Utc::now()), Some("c1"))
            .await
            .unwrap();
        let name = job.container_name("ci");
        runtime.set(&name, ContainerStatus::Exited { exit_code: 1 });

        let controller = new_controller(store.clone(), runtime.clone(), tmp.path()).await;
        controller.reconcile_once().await.unwrap();

        let reloaded = store.get_job(job.id, None).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert_eq!(reloaded.success, Some(false));
    }

    #[tokio::test]
    async fn running_job_with_missing_container_is_marked_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::default());
        let user = store.create_user("Ada", "ada@example.com").await.unwrap();
        let job = Job::new(user.id, test_zip(tmp.path()));
        store.create_job(&job).await.unwrap();
        store
            .update_job_status(job.id, JobStatus::Running, Some(Utc::now()), Some("c1"))
            .await
            .unwrap();
        // No corresponding entry registered in the fake runtime: container is "lost".

        let controller = new_controller(store.clone(), runtime.clone(), tmp.path()).await;
        controller.reconcile_once().await.unwrap();

        let reloaded = store.get_job(job.id, None).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert_eq!(reloaded.success, Some(false));

        let events = store.list_job_events(job.id).await.unwrap();
        assert!(events.iter().any(|e| e.data.as_deref() == Some("Container lost during execution")));
    }

    #[tokio::test]
    async fn orphan_containers_outside_the_active_set_get_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::default());
        runtime.set("ci-job-stray", ContainerStatus::Running);

        let controller = new_controller(store.clone(), runtime.clone(), tmp.path()).await;
        controller.reconcile_once().await.unwrap();

        assert!(runtime.status("ci-job-stray").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconciling_twice_on_an_unchanged_world_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::default());
        let user = store.create_user("Ada", "ada@example.com").await.unwrap();
        let job = Job::new(user.id, test_zip(tmp.path()));
        store.create_job(&job).await.unwrap();

        let controller = new_controller(store.clone(), runtime.clone(), tmp.path()).await;
        controller.reconcile_once().await.unwrap();
        let after_first = store.get_job(job.id, None).await.unwrap().unwrap();

        controller.reconcile_once().await.unwrap();
        let after_second = store.get_job(job.id, None).await.unwrap().unwrap();

        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.container_id, after_second.container_id);
    }
}
