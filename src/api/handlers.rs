//! Endpoint handlers. All but [`healthz`] run behind the auth `route_layer` in `api::router`.

use axum::Json;
use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::streaming;
use crate::api::{ApiState, AuthedUser};
use crate::error::ApiError;
use crate::model::{Job, StreamEvent};

pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
}

pub async fn submit_async(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job = stash_and_create_job(&state, user_id, multipart).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id: job.id })))
}

pub async fn submit_stream(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    multipart: Multipart,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let job = stash_and_create_job(&state, user_id, multipart).await?;
    let events = streaming::open(state, job.id, false, true);
    Ok(sse_response(events))
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    from_beginning: bool,
}

pub async fn stream_job(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    state
        .store
        .get_job(id, Some(user_id))
        .await?
        .ok_or(ApiError::NotFound)?;

    let events = streaming::open(state, id, params.from_beginning, false);
    Ok(sse_response(events))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .store
        .get_job(id, Some(user_id))
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(job))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state.store.list_jobs(Some(user_id)).await?;
    Ok(Json(jobs))
}

fn sse_response(
    events: impl futures::Stream<Item = StreamEvent> + Send + 'static,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    use futures::StreamExt;
    let mapped = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Sse::new(mapped).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)).text(""))
}

async fn stash_and_create_job(
    state: &ApiState,
    user_id: Uuid,
    mut multipart: Multipart,
) -> Result<Job, ApiError> {
    let mut bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?
    {
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        if !data.is_empty() {
            bytes = Some(data);
        }
    }
    let bytes = bytes.ok_or_else(|| ApiError::InvalidInput("missing zip upload".to_string()))?;

    let mut job = Job::new(user_id, String::new());
    tokio::fs::create_dir_all(&state.spool_dir)
        .await
        .map_err(|e| ApiError::InvalidInput(format!("spool directory unavailable: {e}")))?;
    let path = state.spool_dir.join(format!("{}.zip", job.id));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ApiError::InvalidInput(format!("failed to stash upload: {e}")))?;
    job.zip_file_path = path.to_string_lossy().into_owned();

    state.store.create_job(&job).await?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::runtime::test_support::NullRuntime;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> ApiState {
        ApiState {
            store: Arc::new(MemoryStore::new()),
            runtime: Arc::new(NullRuntime),
            spool_dir: std::env::temp_dir().join(format!("ci-runner-test-{}", Uuid::new_v4())),
            namespace_prefix: "ci".to_string(),
            queued_stream_timeout: Duration::from_millis(200),
        }
    }

    fn multipart_body(boundary: &str, file_bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"project.zip\"\r\n");
        body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
        body.extend_from_slice(file_bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    #[tokio::test]
    async fn healthz_requires_no_auth() {
        let router = router(test_state());
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn jobs_list_requires_auth() {
        let router = router(test_state());
        let req = Request::builder().uri("/jobs").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submit_async_persists_a_queued_job_owned_by_the_caller() {
        let state = test_state();
        let user = state.store.create_user("Ada", "ada@example.com").await.unwrap();
        let minted = state.store.create_api_key(user.id, "default").await.unwrap();
        let router = router(state.clone());

        let boundary = "XBOUNDARY";
        let req = Request::builder()
            .method("POST")
            .uri("/submit-async")
            .header("authorization", format!("Bearer {}", minted.secret))
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(multipart_body(boundary, b"pretend zip bytes")))
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let jobs = state.store.list_jobs(Some(user.id)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, crate::model::JobStatus::Queued);
    }

    #[tokio::test]
    async fn get_job_404s_for_a_job_owned_by_another_user() {
        let state = test_state();
        let alice = state.store.create_user("Alice", "alice@example.com").await.unwrap();
        let bob = state.store.create_user("Bob", "bob@example.com").await.unwrap();
        let bob_key = state.store.create_api_key(bob.id, "default").await.unwrap();

        let job = Job::new(alice.id, "/spool/a.zip".to_string());
        state.store.create_job(&job).await.unwrap();

        let router = router(state.clone());
        let req = Request::builder()
            .uri(format!("/jobs/{}", job.id))
            .header("authorization", format!("Bearer {}", bob_key.secret))
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
