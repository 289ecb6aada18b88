//! Bearer API key authentication middleware: extract the credential, hash it, look it up, and
//! attach the resolved user to the request. Keyed against the durable `api_keys` table, with an
//! owning-user activity check layered on top of the key's own active flag.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use uuid::Uuid;

use crate::api::ApiState;
use crate::error::ApiError;
use crate::keys;

/// The authenticated caller's user id, attached to the request by [`auth_middleware`] and
/// pulled out by handlers via `Extension<AuthedUser>`.
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser(pub Uuid);

pub async fn auth_middleware(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthRequired)?;
    let secret = header.strip_prefix("Bearer ").ok_or(ApiError::AuthRequired)?;

    let hash = keys::hash_secret(secret);
    let key = state
        .store
        .get_api_key_by_hash(&hash)
        .await?
        .ok_or(ApiError::AuthInvalid)?;
    if !key.is_active {
        return Err(ApiError::AuthInvalid);
    }

    let user = state
        .store
        .get_user(key.user_id)
        .await?
        .ok_or(ApiError::AuthInvalid)?;
    if !user.is_active {
        return Err(ApiError::Forbidden);
    }

    // Best-effort: a failure to record last-used-at must never fail the request.
    let _ = state.store.touch_api_key(key.id, Utc::now()).await;

    request.extensions_mut().insert(AuthedUser(user.id));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::NullRuntime;
    use crate::store::MemoryStore;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> ApiState {
        ApiState {
            store: std::sync::Arc::new(MemoryStore::new()),
            runtime: std::sync::Arc::new(NullRuntime),
            spool_dir: PathBuf::from("/tmp"),
            namespace_prefix: "ci".to_string(),
            queued_stream_timeout: Duration::from_secs(1),
        }
    }

    fn protected_router(state: ApiState) -> Router {
        Router::new()
            .route("/protected", get(|| async { "ok" }))
            .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn missing_credential_is_rejected() {
        let router = protected_router(test_state());
        let req = HttpRequest::builder().uri("/protected").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let router = protected_router(test_state());
        let req = HttpRequest::builder()
            .uri("/protected")
            .header("authorization", "Bearer ci_bogus")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_credential_is_accepted() {
        let state = test_state();
        let user = state.store.create_user("Ada", "ada@example.com").await.unwrap();
        let minted = state.store.create_api_key(user.id, "default").await.unwrap();

        let router = protected_router(state);
        let req = HttpRequest::builder()
            .uri("/protected")
            .header("authorization", format!("Bearer {}", minted.secret))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn inactive_user_is_forbidden() {
        let state = test_state();
        let user = state.store.create_user("Ada", "ada@example.com").await.unwrap();
        let minted = state.store.create_api_key(user.id, "default").await.unwrap();
        state.store.set_user_active(user.id, false).await.unwrap();

        let router = protected_router(state);
        let req = HttpRequest::builder()
            .uri("/protected")
            .header("authorization", format!("Bearer {}", minted.secret))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn revoked_key_is_rejected() {
        let state = test_state();
        let user = state.store.create_user("Ada", "ada@example.com").await.unwrap();
        let minted = state.store.create_api_key(user.id, "default").await.unwrap();
        state.store.revoke_api_key(minted.record.id).await.unwrap();

        let router = protected_router(state);
        let req = HttpRequest::builder()
            .uri("/protected")
            .header("authorization", format!("Bearer {}", minted.secret))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
