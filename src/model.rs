//! Core entities: User, ApiKey, Job, JobEvent and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// A freshly minted key: the hash is what gets stored, `secret` is shown exactly once.
pub struct MintedApiKey {
    pub record: ApiKey,
    pub secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Monotone transition check: backward transitions, and sideways moves into a different
    /// terminal state, are both forbidden.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Queued) => true,
            (Queued, Running) => true,
            (Queued, Failed) => true,
            (Running, Running) => true,
            (Running, Completed) => true,
            (Running, Failed) => true,
            (a, b) if a == b && a.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            other => return Err(format!("unknown job status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub success: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub container_id: Option<String>,
    pub zip_file_path: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(user_id: Uuid, zip_file_path: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: JobStatus::Queued,
            success: None,
            start_time: None,
            end_time: None,
            container_id: None,
            zip_file_path,
            created_at: Utc::now(),
        }
    }

    /// The container name this job reconciles against, partitioned by `namespace_prefix` so
    /// multiple deployments can share one Docker host.
    pub fn container_name(&self, namespace_prefix: &str) -> String {
        format!("{namespace_prefix}-job-{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Log,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: Uuid,
    pub event_type: JobEventType,
    pub data: Option<String>,
    pub success: Option<bool>,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
}

/// The wire shape streamed to HTTP clients as line-delimited `data: <json>\n\n` events.
/// `Deserialize` is derived too so the client CLI can decode the same shape it serializes
/// server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "job_id")]
    JobId { job_id: Uuid },
    #[serde(rename = "log")]
    Log { data: String },
    #[serde(rename = "complete")]
    Complete { success: bool },
}
