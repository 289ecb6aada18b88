//! An in-process `Store` implementation backed by `Mutex`-guarded maps.
//!
//! Exists purely for fast Controller/API unit tests that don't need a real Postgres instance;
//! `PostgresStore` is what actually runs in production. Mirrors `PostgresStore`'s semantics
//! exactly (unique email, monotone status transitions, user-scoped filtering, per-job event
//! sequencing) so tests against one generalize to the other.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ApiKey, Job, JobEvent, JobStatus, MintedApiKey, User};
use crate::store::Store;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    api_keys: HashMap<Uuid, ApiKey>,
    jobs: HashMap<Uuid, Job>,
    job_events: HashMap<Uuid, Vec<JobEvent>>,
    next_event_id: i64,
}

/// An in-memory `Store`. Cheap to construct; one instance per test.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, name: &str, email: &str) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.values().any(|u| u.email == email) {
            return Err(StoreError::AlreadyExists);
        }
        let user = User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
            is_active: true,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().unwrap().users.get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.inner.lock().unwrap().users.values().cloned().collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn set_user_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.is_active = active;
        Ok(())
    }

    async fn create_api_key(&self, user_id: Uuid, name: &str) -> Result<MintedApiKey, StoreError> {
        let (secret, key_hash) = crate::keys::mint();
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.contains_key(&user_id) {
            return Err(StoreError::NotFound);
        }
        let record = ApiKey {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            key_hash,
            created_at: Utc::now(),
            last_used_at: None,
            is_active: true,
        };
        inner.api_keys.insert(record.id, record.clone());
        Ok(MintedApiKey { record, secret })
    }

    async fn get_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .api_keys
            .values()
            .find(|k| k.key_hash == hash)
            .cloned())
    }

    async fn list_api_keys(&self, user_id: Option<Uuid>) -> Result<Vec<ApiKey>, StoreError> {
        let mut keys: Vec<ApiKey> = self
            .inner
            .lock()
            .unwrap()
            .api_keys
            .values()
            .filter(|k| user_id.is_none_or(|uid| k.user_id == uid))
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn revoke_api_key(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.api_keys.get_mut(&id).ok_or(StoreError::NotFound)?;
        key.is_active = false;
        Ok(())
    }

    async fn touch_api_key(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.api_keys.get_mut(&id).ok_or(StoreError::NotFound)?;
        key.last_used_at = Some(at);
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid, user_id: Option<Uuid>) -> Result<Option<Job>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .get(&id)
            .filter(|j| user_id.is_none_or(|uid| j.user_id == uid))
            .cloned())
    }

    async fn list_jobs(&self, user_id: Option<Uuid>) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| user_id.is_none_or(|uid| j.user_id == uid))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        start_time: Option<DateTime<Utc>>,
        container_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: job.status.to_string(),
                to: status.to_string(),
            });
        }
        job.status = status;
        if start_time.is_some() {
            job.start_time = start_time;
        }
        if let Some(cid) = container_id {
            job.container_id = Some(cid.to_string());
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        id: Uuid,
        success: bool,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        let next = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if !job.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: job.status.to_string(),
                to: next.to_string(),
            });
        }
        job.status = next;
        job.success = Some(success);
        job.end_time = Some(end_time);
        Ok(())
    }

    async fn append_job_event(&self, job_id: Uuid, mut event: JobEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_event_id += 1;
        event.id = inner.next_event_id;
        event.job_id = job_id;
        let events = inner.job_events.entry(job_id).or_default();
        event.sequence = events.last().map(|e| e.sequence + 1).unwrap_or(1);
        events.push(event);
        Ok(())
    }

    async fn list_job_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .job_events
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let s = store();
        s.create_user("Ada", "ada@example.com").await.unwrap();
        let err = s
            .create_user("Ada Two", "ada@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[tokio::test]
    async fn job_status_transitions_are_validated() {
        let s = store();
        let user = s.create_user("Ada", "ada@example.com").await.unwrap();
        let job = Job::new(user.id, "/spool/a.zip".into());
        s.create_job(&job).await.unwrap();

        s.update_job_status(job.id, JobStatus::Running, Some(Utc::now()), Some("c1"))
            .await
            .unwrap();
        s.complete_job(job.id, true, Utc::now()).await.unwrap();

        let err = s
            .update_job_status(job.id, JobStatus::Running, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn job_events_get_monotone_sequence_numbers() {
        let s = store();
        let user = s.create_user("Ada", "ada@example.com").await.unwrap();
        let job = Job::new(user.id, "/spool/a.zip".into());
        s.create_job(&job).await.unwrap();

        for _ in 0..3 {
            s.append_job_event(
                job.id,
                JobEvent {
                    id: 0,
                    job_id: job.id,
                    event_type: crate::model::JobEventType::Log,
                    data: Some("line".into()),
                    success: None,
                    sequence: 0,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        }

        let events = s.list_job_events(job.id).await.unwrap();
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn list_active_jobs_excludes_terminal() {
        let s = store();
        let user = s.create_user("Ada", "ada@example.com").await.unwrap();
        let queued = Job::new(user.id, "/spool/a.zip".into());
        let done = Job::new(user.id, "/spool/b.zip".into());
        s.create_job(&queued).await.unwrap();
        s.create_job(&done).await.unwrap();
        s.update_job_status(done.id, JobStatus::Running, Some(Utc::now()), Some("c1"))
            .await
            .unwrap();
        s.complete_job(done.id, true, Utc::now()).await.unwrap();

        let active = s.list_active_jobs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, queued.id);
    }
}
