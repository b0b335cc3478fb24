//! HTTP handlers for the rate limit API.
//!
//! Every decision, allow or deny, carries `X-RateLimit-Remaining`,
//! `X-RateLimit-Reset` and `Retry-After` headers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::error::TollgateError;
use crate::ratelimit::{ApiGuard, ApiUsage, CheckRequest, Decision, RateLimitEngine};
use crate::tenancy::CredentialValidator;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RateLimitEngine>,
    pub guard: Arc<ApiGuard>,
    pub credentials: Arc<dyn CredentialValidator>,
}

/// Error body returned with every non-decision response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// A request failure mapped to an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<TollgateError> for ApiError {
    fn from(e: TollgateError) -> Self {
        let status = match &e {
            TollgateError::Validation(_) => StatusCode::BAD_REQUEST,
            TollgateError::Credential(_) => StatusCode::UNAUTHORIZED,
            TollgateError::QuotaExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            TollgateError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => {
                error!(error = %e, "Unexpected error serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/check", post(check))
        .route("/api/v1/usage", get(usage))
        .route("/api/v1/health", get(|| async { "OK" }))
        .with_state(state)
}

fn api_key(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing X-API-Key header"))
}

fn decision_response(decision: Decision) -> Response {
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    (
        status,
        [
            (REMAINING_HEADER, decision.remaining.to_string()),
            (RESET_HEADER, decision.reset_at.to_string()),
            (RETRY_AFTER, decision.retry_after.to_string()),
        ],
        Json(decision),
    )
        .into_response()
}

/// Decide whether the caller may proceed.
#[instrument(skip_all)]
async fn check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CheckRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let credential = api_key(&headers)?;

    if !state.guard.is_allowed(credential).await {
        return Ok(decision_response(state.guard.rejection()));
    }

    let tenant_id = state.credentials.validate(credential).await?;
    let Json(request) = body.map_err(|e| {
        warn!(error = %e, "Rejected malformed check request");
        ApiError::new(StatusCode::BAD_REQUEST, e.body_text())
    })?;

    let decision = state.engine.check(tenant_id, &request).await?;
    debug!(
        tenant_id = %tenant_id,
        resource = %request.resource,
        allowed = decision.allowed,
        "Check decided"
    );
    Ok(decision_response(decision))
}

/// Report the caller's ingress usage.
async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiUsage>, ApiError> {
    let credential = api_key(&headers)?;
    state.credentials.validate(credential).await?;

    let usage = state
        .guard
        .usage(credential)
        .await
        .map_err(TollgateError::from)?;
    Ok(Json(usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{ApiGuardConfig, EngineConfig};
    use crate::ratelimit::{AlgorithmKind, Algorithms, RateLimitRule, RuleSet};
    use crate::store::{MemoryStore, Store};
    use crate::tenancy::{CredentialEntry, StaticCredentials, UsageLedger};
    use crate::testing::{FailingStore, StaticQuota};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use uuid::Uuid;

    const NOW: u64 = 1_700_000_040_000;
    const KEY: &str = "sk_test_0123456789";

    fn app_with(store: Arc<dyn Store>, guard_max: u64, quota: StaticQuota) -> Router {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
        let tenant = Uuid::new_v4();

        let mut rules = RuleSet::new();
        rules
            .push(RateLimitRule::new(tenant, "orders", AlgorithmKind::FixedWindow, 2, 60))
            .unwrap();

        let engine = RateLimitEngine::new(
            Arc::new(rules),
            Algorithms::new(store.clone(), clock.clone()),
            Arc::new(quota),
            Arc::new(UsageLedger::new()),
            Arc::new(crate::tenancy::LogAlertDispatcher),
            clock.clone(),
            &EngineConfig::default(),
        );
        let guard_config = ApiGuardConfig {
            max_requests: guard_max,
            ..ApiGuardConfig::default()
        };
        let credentials = StaticCredentials::new([CredentialEntry {
            key: KEY.to_string(),
            tenant_id: tenant,
            active: true,
        }]);

        router(AppState {
            engine: Arc::new(engine),
            guard: Arc::new(ApiGuard::new(store, clock, &guard_config)),
            credentials: Arc::new(credentials),
        })
    }

    fn app() -> Router {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(NOW))));
        app_with(store, 100, StaticQuota::unlimited())
    }

    fn check_request(key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/check")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_then_denied() {
        let app = app();
        let body = r#"{"resource":"orders","identifier":"user-1"}"#;

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(check_request(Some(KEY), body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
            assert_eq!(response.headers()["retry-after"], "0");
        }

        let response = app.oneshot(check_request(Some(KEY), body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-reset"], (NOW + 60_000).to_string());
        let body = json(response).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["retryAfter"], 60);
    }

    #[tokio::test]
    async fn test_missing_header_is_bad_request() {
        let response = app()
            .oneshot(check_request(None, r#"{"resource":"orders"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_key_is_unauthorized() {
        let response = app()
            .oneshot(check_request(Some("sk_unknown"), r#"{"resource":"orders"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_input_is_bad_request() {
        let app = app();
        let response = app
            .clone()
            .oneshot(check_request(Some(KEY), r#"{"resource":"a:b"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(check_request(Some(KEY), r#"{"identifier":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quota_exceeded_is_payment_required() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(NOW))));
        let app = app_with(
            store,
            100,
            StaticQuota::new(crate::tenancy::Tier::Free, 10_000),
        );
        let response = app
            .oneshot(check_request(Some(KEY), r#"{"resource":"orders"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_guard_rejects_before_credential_check() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(NOW))));
        let app = app_with(store, 1, StaticQuota::unlimited());
        let body = r#"{"resource":"inventory"}"#;

        let first = app.clone().oneshot(check_request(Some("sk_unknown"), body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::UNAUTHORIZED);

        let second = app.oneshot(check_request(Some("sk_unknown"), body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["retry-after"], "60");
    }

    #[tokio::test]
    async fn test_usage_endpoint() {
        let app = app();
        app.clone()
            .oneshot(check_request(Some(KEY), r#"{"resource":"orders"}"#))
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/api/v1/usage")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["currentCount"], 1);
        assert_eq!(body["limit"], 100);
        assert_eq!(body["remaining"], 99);
    }

    #[tokio::test]
    async fn test_usage_unavailable_store() {
        let app = app_with(Arc::new(FailingStore::default()), 100, StaticQuota::unlimited());
        let request = Request::builder()
            .uri("/api/v1/usage")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"OK");
    }
}
