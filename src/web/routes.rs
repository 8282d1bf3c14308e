use crate::envelope::{generate_passcode, EnvelopeError};
use crate::error::{AppError, AppResult};
use crate::secret::{ExpiryOption, SecretError, DEFAULT_EXPIRY};
use crate::web::AppState;
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header carrying the passcode on reads.
pub const PASSCODE_HEADER: &str = "x-passcode";

/// Request body cap. Leaves room for JSON escaping of a max-size secret.
const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

/// `Json` extractor whose rejections render as `AppError`.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint. Reports 503 when the store does not answer.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = match state.secrets.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Limits advertised to clients
#[derive(Debug, Serialize)]
pub struct ServiceConfig {
    pub max_secret_size: usize,
    pub max_attempts: u32,
    pub default_expiry: &'static str,
    pub expiry_options: &'static [ExpiryOption],
}

pub async fn service_config(State(state): State<AppState>) -> Json<ServiceConfig> {
    let policy = state.secrets.policy();
    Json(ServiceConfig {
        max_secret_size: policy.max_secret_bytes(),
        max_attempts: policy.max_attempts(),
        default_expiry: DEFAULT_EXPIRY,
        expiry_options: policy.expiry_options(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub secret: String,
    #[serde(default)]
    pub expiry: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    pub passcode: String,
    pub expires_at: DateTime<Utc>,
    pub read_url: String,
}

/// Seal a new secret and return its id and passcode
pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<CreateRequest>,
) -> AppResult<(StatusCode, Json<CreateResponse>)> {
    let policy = *state.secrets.policy();

    let secret = req.secret.trim();
    if secret.is_empty() {
        return Err(AppError::bad_request("secret is required"));
    }
    if secret.len() > policy.max_secret_bytes() {
        return Err(AppError::PayloadTooLarge(format!(
            "secret exceeds {} byte limit",
            policy.max_secret_bytes()
        )));
    }

    let ttl = policy.resolve_expiry(req.expiry.as_deref()).ok_or_else(|| {
        let tokens: Vec<&str> = policy.expiry_options().iter().map(|o| o.token).collect();
        AppError::bad_request(format!("expiry must be one of: {}", tokens.join(", ")))
    })?;

    let passcode = generate_passcode();
    let codec = state.codec.clone();
    let plaintext = secret.as_bytes().to_vec();
    let code = passcode.clone();
    let blob = tokio::task::spawn_blocking(move || codec.seal(&plaintext, &code))
        .await
        .map_err(|e| AppError::internal(format!("seal task failed: {}", e)))??;

    let id = Uuid::new_v4().to_string();
    state.secrets.store(&id, &blob, ttl).await?;

    let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
    let read_url = format!("{}/read/{}", base_url(&state, &headers), id);
    info!(id = %id, ttl_secs = ttl.as_secs(), "Secret created");

    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            id,
            passcode,
            expires_at,
            read_url,
        }),
    ))
}

fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.public_url {
        return url.clone();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = match headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
        Some("https") => "https",
        _ => "http",
    };
    format!("{}://{}", scheme, host)
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReadResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<u32>,
}

/// Decrypt and destroy a secret.
///
/// A wrong passcode counts against the secret and answers 401 with the
/// attempts left; the last allowed failure destroys it.
pub async fn read_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    if Uuid::parse_str(&id).is_err() {
        return Err(SecretError::NotFound.into());
    }

    let passcode = headers
        .get(PASSCODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("passcode is required"))?
        .to_string();

    let blob = state.secrets.get(&id).await?;

    let codec = state.codec.clone();
    let sealed = blob.clone();
    let opened = tokio::task::spawn_blocking(move || codec.open(&sealed, &passcode))
        .await
        .map_err(|e| AppError::internal(format!("open task failed: {}", e)))?;

    let plaintext = match opened {
        Ok(plaintext) => plaintext,
        Err(EnvelopeError::AuthFailure) => {
            let report = state.secrets.register_failure_and_maybe_evict(&id).await?;
            if report.count == 0 {
                // Expired or consumed between the read and the failure count.
                return Err(SecretError::NotFound.into());
            }
            info!(id = %id, remaining = report.remaining, "Invalid passcode");
            let body = ReadResponse {
                remaining_attempts: Some(report.remaining),
                ..Default::default()
            };
            return Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response());
        }
        Err(e) => {
            warn!(id = %id, "Stored envelope unreadable: {}", e);
            return Err(e.into());
        }
    };

    // The plaintext is already in hand; a failed delete only leaves the
    // secret to its TTL.
    match state.secrets.consume_if_match(&id, &blob).await {
        Ok(outcome) => debug!(id = %id, ?outcome, "Consume finished"),
        Err(e) => warn!(id = %id, "Failed to delete secret after read: {}", e),
    }
    state.cleanup.schedule(&id);

    let secret = String::from_utf8_lossy(&plaintext).into_owned();
    if query.format.as_deref() == Some("plain") {
        return Ok(([(header::CONTENT_TYPE, "text/plain")], secret).into_response());
    }
    Ok(Json(ReadResponse {
        secret: Some(secret),
        ..Default::default()
    })
    .into_response())
}

/// Create the main web router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(service_config))
        .route("/create", post(create_secret))
        .route("/read/{id}", post(read_secret))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CryptoConfig, EnvelopeCodec};
    use crate::secret::{attempts_key, AccessPolicy, CleanupHandle, SecretManager};
    use crate::store::{MemoryBackend, SecretBackend};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        backend: Arc<MemoryBackend>,
    }

    fn harness(public_url: Option<&str>) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let secrets = Arc::new(SecretManager::new(backend.clone(), AccessPolicy::default()));
        let codec = Arc::new(EnvelopeCodec::new(CryptoConfig::testing()).unwrap());
        let (cleanup, _worker) = CleanupHandle::spawn(secrets.clone(), Duration::from_secs(5), 16, 4);
        let state = AppState::new(codec, secrets, cleanup, public_url.map(String::from));
        Harness {
            app: create_router(state),
            backend,
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, headers, body)
    }

    fn create_req(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/create")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::HOST, "secrets.test")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn read_req(id: &str, passcode: Option<&str>, query: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/read/{}{}", id, query));
        if let Some(code) = passcode {
            builder = builder.header(PASSCODE_HEADER, code);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn create(app: &Router, secret: &str) -> CreateResponse {
        let (status, _, body) =
            send(app, create_req(serde_json::json!({ "secret": secret, "expiry": "1h" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_read_once() {
        let h = harness(None);
        let created = create(&h.app, "  hello world  ").await;

        assert!(Uuid::parse_str(&created.id).is_ok());
        assert_eq!(created.passcode.split('-').count(), 3);
        assert_eq!(created.read_url, format!("http://secrets.test/read/{}", created.id));
        let ttl = created.expires_at - Utc::now();
        assert!(ttl.num_minutes() > 58 && ttl.num_minutes() <= 60);

        let (status, _, body) = send(&h.app, read_req(&created.id, Some(&created.passcode), "")).await;
        assert_eq!(status, StatusCode::OK);
        let read: ReadResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(read.secret.as_deref(), Some("hello world"));
        assert!(read.remaining_attempts.is_none());

        let (status, _, _) = send(&h.app, read_req(&created.id, Some(&created.passcode), "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_read_plain_format() {
        let h = harness(Some("https://example.org/"));
        let created = create(&h.app, "plain text").await;
        assert!(created.read_url.starts_with("https://example.org/read/"));

        let (status, headers, body) = send(
            &h.app,
            read_req(&created.id, Some(&created.passcode), "?format=plain"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(body, b"plain text");
    }

    #[tokio::test]
    async fn test_wrong_passcode_counts_down_then_destroys() {
        let h = harness(None);
        let created = create(&h.app, "guarded").await;

        for expected in [2u32, 1, 0] {
            let (status, _, body) =
                send(&h.app, read_req(&created.id, Some("wrong-pass-code"), "")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            let read: ReadResponse = serde_json::from_slice(&body).unwrap();
            assert_eq!(read.remaining_attempts, Some(expected));
            assert!(read.secret.is_none());
        }

        let (status, _, _) = send(&h.app, read_req(&created.id, Some(&created.passcode), "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.backend.is_empty());
    }

    #[tokio::test]
    async fn test_successful_read_clears_counter() {
        let h = harness(None);
        let created = create(&h.app, "eventually").await;

        let (status, _, _) = send(&h.app, read_req(&created.id, Some("nope-nope-nope"), "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = send(&h.app, read_req(&created.id, Some(&created.passcode), "")).await;
        assert_eq!(status, StatusCode::OK);

        let key = attempts_key(&created.id);
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.backend.get(&key).await.unwrap().is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("attempts counter should be cleaned up");
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = harness(None);

        let (status, _, _) = send(&h.app, create_req(serde_json::json!({ "secret": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = send(
            &h.app,
            create_req(serde_json::json!({ "secret": "x", "expiry": "2w" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(err["error"].as_str().unwrap().contains("1h, 6h, 1d, 3d"));

        let big = "a".repeat(64 * 1024 + 1);
        let (status, _, _) = send(&h.app, create_req(serde_json::json!({ "secret": big }))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        assert!(h.backend.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_gets_json_error() {
        let h = harness(None);

        let req = Request::builder()
            .method("POST")
            .uri("/create")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"secret\": "))
            .unwrap();
        let (status, headers, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["error"], "invalid JSON body");
        assert_eq!(err["code"], 400);

        // Missing content type is treated the same way.
        let req = Request::builder()
            .method("POST")
            .uri("/create")
            .body(Body::from(r#"{"secret":"s"}"#))
            .unwrap();
        let (status, _, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["error"], "invalid JSON body");
    }

    #[tokio::test]
    async fn test_create_default_expiry() {
        let h = harness(None);
        let (status, _, body) = send(&h.app, create_req(serde_json::json!({ "secret": "s" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: CreateResponse = serde_json::from_slice(&body).unwrap();
        let ttl = created.expires_at - Utc::now();
        assert!(ttl.num_hours() >= 23 && ttl.num_hours() <= 24);
    }

    #[tokio::test]
    async fn test_read_request_errors() {
        let h = harness(None);

        let (status, _, _) = send(&h.app, read_req("not-a-uuid", Some("a-b-c"), "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let missing = Uuid::new_v4().to_string();
        let (status, _, body) = send(&h.app, read_req(&missing, Some("a-b-c"), "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["error"], "not found or expired");

        let created = create(&h.app, "needs code").await;
        let (status, _, _) = send(&h.app, read_req(&created.id, None, "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_corrupt_envelope_is_not_counted() {
        let h = harness(None);
        let id = Uuid::new_v4().to_string();
        h.backend
            .set_with_ttl(&crate::secret::secret_key(&id), b"garbage", Duration::from_secs(60))
            .await
            .unwrap();

        let (status, _, _) = send(&h.app, read_req(&id, Some("a-b-c"), "")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(h.backend.get(&attempts_key(&id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_health_and_config() {
        let h = harness(None);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, _, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");

        let req = Request::builder().uri("/config").body(Body::empty()).unwrap();
        let (status, _, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        let config: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(config["max_secret_size"], 65536);
        assert_eq!(config["max_attempts"], 3);
        assert_eq!(config["default_expiry"], "1d");
        assert_eq!(config["expiry_options"].as_array().unwrap().len(), 4);
    }
}
