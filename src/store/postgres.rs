//! PostgreSQL-backed implementation of [`super::Store`].
//!
//! Connection pooling via `deadpool_postgres::Pool`, row-to-struct mapping via `row.get("column")`,
//! and unique-violation-to-`AlreadyExists` mapping on insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::error::StoreError;
use crate::keys;
use crate::model::{ApiKey, Job, JobEvent, JobEventType, JobStatus, MintedApiKey, User};

use super::Store;

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let mut cfg = Config::new();
        cfg.url = Some(database_url.to_string());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        // Fail fast if the database is unreachable rather than on the first real request.
        let _ = pool.get().await?;
        Ok(Self { pool })
    }

    /// Run embedded SQL migrations. Call once at process startup before accepting traffic.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let client = &mut *conn;
        crate::store::embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_user(&self, name: &str, email: &str) -> Result<User, StoreError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        conn.execute(
            "INSERT INTO users (id, name, email, created_at, is_active) VALUES ($1, $2, $3, $4, true)",
            &[&id, &name, &email, &created_at],
        )
        .await
        .map_err(|e| {
            if e.as_db_error()
                .is_some_and(|d| d.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
            {
                StoreError::AlreadyExists
            } else {
                StoreError::Database(e)
            }
        })?;

        Ok(User {
            id,
            name: name.to_string(),
            email: email.to_string(),
            created_at,
            is_active: true,
        })
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, name, email, created_at, is_active FROM users WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.map(row_to_user))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, name, email, created_at, is_active FROM users WHERE email = $1",
                &[&email],
            )
            .await?;
        Ok(row.map(row_to_user))
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, name, email, created_at, is_active FROM users ORDER BY created_at",
                &[],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_user).collect())
    }

    async fn set_user_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET is_active = $2 WHERE id = $1",
            &[&id, &active],
        )
        .await?;
        Ok(())
    }

    async fn create_api_key(&self, user_id: Uuid, name: &str) -> Result<MintedApiKey, StoreError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let (secret, key_hash) = keys::mint();

        conn.execute(
            r#"
            INSERT INTO api_keys (id, user_id, name, key_hash, created_at, last_used_at, is_active)
            VALUES ($1, $2, $3, $4, $5, NULL, true)
            "#,
            &[&id, &user_id, &name, &key_hash, &created_at],
        )
        .await?;

        Ok(MintedApiKey {
            record: ApiKey {
                id,
                user_id,
                name: name.to_string(),
                key_hash,
                created_at,
                last_used_at: None,
                is_active: true,
            },
            secret,
        })
    }

    async fn get_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT id, user_id, name, key_hash, created_at, last_used_at, is_active
                FROM api_keys WHERE key_hash = $1
                "#,
                &[&hash],
            )
            .await?;
        Ok(row.map(row_to_api_key))
    }

    async fn list_api_keys(&self, user_id: Option<Uuid>) -> Result<Vec<ApiKey>, StoreError> {
        let conn = self.conn().await?;
        let rows = if let Some(user_id) = user_id {
            conn.query(
                r#"
                SELECT id, user_id, name, key_hash, created_at, last_used_at, is_active
                FROM api_keys WHERE user_id = $1 ORDER BY created_at
                "#,
                &[&user_id],
            )
            .await?
        } else {
            conn.query(
                r#"
                SELECT id, user_id, name, key_hash, created_at, last_used_at, is_active
                FROM api_keys ORDER BY created_at
                "#,
                &[],
            )
            .await?
        };
        Ok(rows.into_iter().map(row_to_api_key).collect())
    }

    async fn revoke_api_key(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute("UPDATE api_keys SET is_active = false WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn touch_api_key(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        // Best-effort: a failure to record last-used-at must never fail the request.
        let _ = conn
            .execute(
                "UPDATE api_keys SET last_used_at = $2 WHERE id = $1",
                &[&id, &at],
            )
            .await;
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let status = job.status.to_string();
        conn.execute(
            r#"
            INSERT INTO jobs (
                id, user_id, status, success, start_time, end_time, container_id,
                zip_file_path, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            &[
                &job.id,
                &job.user_id,
                &status,
                &job.success,
                &job.start_time,
                &job.end_time,
                &job.container_id,
                &job.zip_file_path,
                &job.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid, user_id: Option<Uuid>) -> Result<Option<Job>, StoreError> {
        let conn = self.conn().await?;
        let row = if let Some(user_id) = user_id {
            conn.query_opt(
                &format!("{JOB_SELECT} WHERE id = $1 AND user_id = $2"),
                &[&id, &user_id],
            )
            .await?
        } else {
            conn.query_opt(&format!("{JOB_SELECT} WHERE id = $1"), &[&id])
                .await?
        };
        row.map(row_to_job).transpose()
    }

    async fn list_jobs(&self, user_id: Option<Uuid>) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn().await?;
        let rows = if let Some(user_id) = user_id {
            conn.query(
                &format!("{JOB_SELECT} WHERE user_id = $1 ORDER BY created_at DESC"),
                &[&user_id],
            )
            .await?
        } else {
            conn.query(&format!("{JOB_SELECT} ORDER BY created_at DESC"), &[])
                .await?
        };
        rows.into_iter().map(row_to_job).collect()
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!("{JOB_SELECT} WHERE status IN ('queued', 'running') ORDER BY created_at"),
                &[],
            )
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        start_time: Option<DateTime<Utc>>,
        container_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let txn = conn.transaction().await?;

        let current: String = txn
            .query_opt("SELECT status FROM jobs WHERE id = $1 FOR UPDATE", &[&id])
            .await?
            .ok_or(StoreError::NotFound)?
            .get("status");
        let current: JobStatus = current
            .parse()
            .map_err(|_| StoreError::Migration(format!("unknown job status in row: {current}")))?;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        let status_str = status.to_string();
        txn.execute(
            r#"
            UPDATE jobs SET
                status = $2,
                start_time = COALESCE($3, start_time),
                container_id = COALESCE($4, container_id)
            WHERE id = $1
            "#,
            &[&id, &status_str, &start_time, &container_id],
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn complete_job(
        &self,
        id: Uuid,
        success: bool,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let txn = conn.transaction().await?;

        let current: String = txn
            .query_opt("SELECT status FROM jobs WHERE id = $1 FOR UPDATE", &[&id])
            .await?
            .ok_or(StoreError::NotFound)?
            .get("status");
        let current: JobStatus = current
            .parse()
            .map_err(|_| StoreError::Migration(format!("unknown job status in row: {current}")))?;
        let next = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if !current.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        let status = next.to_string();
        txn.execute(
            r#"
            UPDATE jobs SET status = $2, success = $3, end_time = $4 WHERE id = $1
            "#,
            &[&id, &status, &success, &end_time],
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn append_job_event(&self, job_id: Uuid, event: JobEvent) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let event_type = match event.event_type {
            JobEventType::Log => "log",
            JobEventType::Complete => "complete",
        };
        conn.execute(
            r#"
            INSERT INTO job_events (job_id, event_type, data, success, sequence, created_at)
            VALUES ($1, $2, $3, $4, (
                SELECT COALESCE(MAX(sequence), 0) + 1 FROM job_events WHERE job_id = $1
            ), $5)
            "#,
            &[
                &job_id,
                &event_type,
                &event.data,
                &event.success,
                &event.timestamp,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_job_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT id, job_id, event_type, data, success, sequence, created_at
                FROM job_events WHERE job_id = $1 ORDER BY sequence ASC
                "#,
                &[&job_id],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_job_event).collect())
    }
}

const JOB_SELECT: &str = r#"
    SELECT id, user_id, status, success, start_time, end_time, container_id, zip_file_path, created_at
    FROM jobs
"#;

fn row_to_user(row: tokio_postgres::Row) -> User {
    User {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        created_at: row.get("created_at"),
        is_active: row.get("is_active"),
    }
}

fn row_to_api_key(row: tokio_postgres::Row) -> ApiKey {
    ApiKey {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        key_hash: row.get("key_hash"),
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
        is_active: row.get("is_active"),
    }
}

fn row_to_job(row: tokio_postgres::Row) -> Result<Job, StoreError> {
    let status_str: String = row.get("status");
    let status = status_str
        .parse()
        .map_err(|_| StoreError::Migration(format!("unknown job status in row: {status_str}")))?;
    Ok(Job {
        id: row.get("id"),
        user_id: row.get("user_id"),
        status,
        success: row.get("success"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        container_id: row.get("container_id"),
        zip_file_path: row.get("zip_file_path"),
        created_at: row.get("created_at"),
    })
}

fn row_to_job_event(row: tokio_postgres::Row) -> JobEvent {
    let event_type_str: String = row.get("event_type");
    JobEvent {
        id: row.get("id"),
        job_id: row.get("job_id"),
        event_type: match event_type_str.as_str() {
            "complete" => JobEventType::Complete,
            _ => JobEventType::Log,
        },
        data: row.get("data"),
        success: row.get("success"),
        sequence: row.get("sequence"),
        timestamp: row.get("created_at"),
    }
}
