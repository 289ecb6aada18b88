//! The durable store capability interface and its implementations.
//!
//! Modeled as an async trait injected at process start, so the Controller and API depend on an
//! interface rather than a concrete backing database.

mod embedded;
mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ApiKey, Job, JobEvent, JobStatus, MintedApiKey, User};

#[async_trait]
pub trait Store: Send + Sync {
    // --- Users ---
    async fn create_user(&self, name: &str, email: &str) -> Result<User, StoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    async fn set_user_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;

    // --- API keys ---
    async fn create_api_key(&self, user_id: Uuid, name: &str) -> Result<MintedApiKey, StoreError>;
    async fn get_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>, StoreError>;
    async fn list_api_keys(&self, user_id: Option<Uuid>) -> Result<Vec<ApiKey>, StoreError>;
    async fn revoke_api_key(&self, id: Uuid) -> Result<(), StoreError>;
    async fn touch_api_key(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    // --- Jobs ---
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, id: Uuid, user_id: Option<Uuid>) -> Result<Option<Job>, StoreError>;
    async fn list_jobs(&self, user_id: Option<Uuid>) -> Result<Vec<Job>, StoreError>;
    /// Jobs in a non-terminal status, across all users (the Controller's "desired" input).
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError>;
    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        start_time: Option<DateTime<Utc>>,
        container_id: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn complete_job(
        &self,
        id: Uuid,
        success: bool,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- Job events ---
    async fn append_job_event(&self, job_id: Uuid, event: JobEvent) -> Result<(), StoreError>;
    async fn list_job_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, StoreError>;
}
