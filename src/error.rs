//! Error taxonomy for the store, the runtime client, and the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors surfaced by the [`crate::store::Store`] trait.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("already exists")]
    AlreadyExists,

    #[error("not found")]
    NotFound,

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

impl StoreError {
    /// True if the Postgres error underneath is a unique-violation (SQLSTATE 23505).
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::AlreadyExists => true,
            StoreError::Database(e) => e
                .as_db_error()
                .is_some_and(|db| db.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION),
            _ => false,
        }
    }
}

/// Errors surfaced by the container runtime client.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container creation failed: {0}")]
    CreateFailed(String),

    #[error("container start failed: {0}")]
    StartFailed(String),

    #[error("container not found")]
    ContainerNotFound,

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("invalid archive entry: {0}")]
    InvalidArchiveEntry(String),
}

/// Errors that abort an entire reconciliation pass, as opposed to a single job's reconciliation
/// (those are logged and retried next pass, never propagated here).
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// The taxonomy named in the spec's error-handling design, used at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    AuthRequired,

    #[error("invalid credential")]
    AuthInvalid,

    #[error("user inactive")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("runtime unavailable")]
    RuntimeUnavailable,

    #[error("transient store error")]
    Transient,

    #[error("internal error")]
    Fatal,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::AlreadyExists => ApiError::Conflict("already exists".into()),
            StoreError::InvalidTransition { from, to } => {
                ApiError::InvalidInput(format!("cannot transition from {from} to {to}"))
            }
            other if other.is_conflict() => ApiError::Conflict(other.to_string()),
            _ => ApiError::Transient,
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(_: RuntimeError) -> Self {
        ApiError::RuntimeUnavailable
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::AuthRequired | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::RuntimeUnavailable | ApiError::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Never leak internal detail beyond the kind; log the real error at the call site.
        (status, self.to_string()).into_response()
    }
}
