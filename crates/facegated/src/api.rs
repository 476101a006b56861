//! HTTP surface: the `/api/auth` routes plus static model and client assets.

use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use facegate_core::auth::{
    AuthResponse, ErrorResponse, HistoryResponse, LoginRequest, ProfileResponse, RegisterRequest,
};

use crate::config::Config;
use crate::password;
use crate::rate_limiter::RateLimiter;
use crate::store::{AuthStore, LoginAttempt, NewUser, StoreError, StoredUser};

#[derive(Clone)]
pub struct AppState {
    store: AuthStore,
    limiter: Arc<Mutex<RateLimiter>>,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(store: AuthStore, config: Config) -> Self {
        Self {
            store,
            limiter: Arc::new(Mutex::new(RateLimiter::new())),
            config: Arc::new(config),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("too many failed attempts; try again in {}s", .0.as_secs())]
    TooManyAttempts(Duration),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyAttempts(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Store(_) | ApiError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "Server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

/// Caller address and user agent, recorded with every login attempt.
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl<S: Send + Sync> FromRequestParts<S> for ClientMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(Self {
            ip_address: forwarded.or(peer),
            user_agent,
        })
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub struct BearerToken(pub String);

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(' ').nth(1))
            .filter(|t| !t.is_empty())
            .map(|t| BearerToken(t.to_string()))
            .ok_or(ApiError::Unauthorized("No token, authorization denied"))
    }
}

pub fn router(state: AppState) -> Router {
    let auth = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/user", get(profile))
        .route("/history", get(history));

    let model_dir = state.config.model_dir.clone();
    let static_dir = state.config.static_dir.clone();
    Router::new()
        .nest("/api/auth", auth)
        .nest_service("/models", ServeDir::new(model_dir))
        .route_service("/dashboard", ServeFile::new(static_dir.join("dashboard.html")))
        .fallback_service(ServeDir::new(&static_dir))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let missing = req.missing_fields();
    if !missing.is_empty() {
        tracing::debug!(?missing, "registration rejected");
        return Err(ApiError::BadRequest(
            "Please provide name, email, username and password",
        ));
    }

    let secret = req.password;
    let password_hash =
        tokio::task::spawn_blocking(move || password::hash_password(&secret)).await?;
    let user = state
        .store
        .create_user(NewUser {
            name: req.name,
            email: req.email,
            username: req.username,
            password_hash,
        })
        .await
        .map_err(|e| match e {
            StoreError::UserExists => {
                ApiError::BadRequest("User already exists with that email or username")
            }
            other => ApiError::Store(other),
        })?;

    let response = issue_token(&state, &user).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn login(
    State(state): State<AppState>,
    meta: ClientMeta,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let user = state.store.find_by_username(&req.username).await?;
    let mut attempt = LoginAttempt {
        user_id: user.as_ref().map(|u| u.id.clone()),
        username: req.username.clone(),
        success: false,
        face_detected: req.face_detected,
        ip_address: meta.ip_address,
        user_agent: meta.user_agent,
    };

    if !req.face_detected {
        tracing::info!(username = %req.username, "login refused: no face detected");
        state.store.record_attempt(attempt).await?;
        return Err(ApiError::BadRequest("Face detection failed. Access denied."));
    }

    let allowed = state.limiter.lock().await.check(&req.username);
    if let Err(remaining) = allowed {
        state.store.record_attempt(attempt).await?;
        return Err(ApiError::TooManyAttempts(remaining));
    }

    let matched = match &user {
        Some(u) => {
            let secret = req.password;
            let stored = u.password_hash.clone();
            tokio::task::spawn_blocking(move || password::verify_password(&secret, &stored))
                .await?
        }
        None => false,
    };

    let user = match user {
        Some(user) if matched => user,
        _ => {
            state.limiter.lock().await.record_failure(&req.username);
            state.store.record_attempt(attempt).await?;
            return Err(ApiError::Unauthorized("Invalid username or password"));
        }
    };

    state.limiter.lock().await.record_success(&req.username);
    attempt.success = true;
    state.store.record_attempt(attempt).await?;
    tracing::info!(user_id = %user.id, "login succeeded");

    Ok(Json(issue_token(&state, &user).await?))
}

async fn profile(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<ProfileResponse>, ApiError> {
    let user_id = authenticate(&state, &token).await?;
    let user = state
        .store
        .find_by_id(&user_id)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok(Json(ProfileResponse {
        success: true,
        user: user.profile(),
    }))
}

async fn history(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user_id = authenticate(&state, &token).await?;
    let history = state
        .store
        .history_for_user(&user_id, state.config.history_limit)
        .await?;
    Ok(Json(HistoryResponse {
        success: true,
        history,
    }))
}

async fn authenticate(state: &AppState, token: &str) -> Result<String, ApiError> {
    state
        .store
        .user_for_token(token)
        .await?
        .ok_or(ApiError::Unauthorized("Invalid token"))
}

async fn issue_token(state: &AppState, user: &StoredUser) -> Result<AuthResponse, ApiError> {
    let token = password::generate_token();
    state
        .store
        .create_session(&user.id, &token, state.config.token_ttl)
        .await?;
    Ok(AuthResponse {
        success: true,
        token,
        user: user.profile(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use facegate_core::auth::UserProfile;
    use serde_json::{json, Value};
    use std::path::Path;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: AuthStore,
        _dirs: tempfile::TempDir,
    }

    async fn test_app() -> TestApp {
        let dirs = tempfile::tempdir().unwrap();
        let model_dir = dirs.path().join("models");
        let static_dir = dirs.path().join("public");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(model_dir.join("tiny_face_detector_model-shard1"), b"weights").unwrap();
        std::fs::write(static_dir.join("index.html"), b"<h1>login</h1>").unwrap();
        std::fs::write(static_dir.join("dashboard.html"), b"<h1>dashboard</h1>").unwrap();

        let store = AuthStore::open(Path::new(":memory:")).await.unwrap();
        let config = Config {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_path: ":memory:".into(),
            model_dir,
            static_dir,
            token_ttl: Duration::from_secs(3600),
            history_limit: 10,
        };
        TestApp {
            router: router(AppState::new(store.clone(), config)),
            store,
            _dirs: dirs,
        }
    }

    async fn send(
        app: &TestApp,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_AGENT, "facegate-test")
            .header("x-forwarded-for", "10.0.0.7");
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let res = app.router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register_alice(app: &TestApp) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({
                "name": "Alice",
                "email": "alice@example.com",
                "username": "alice",
                "password": "correct horse"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["token"].as_str().unwrap().to_string()
    }

    async fn login(app: &TestApp, password: &str, face: bool) -> (StatusCode, Value) {
        send(
            app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "username": "alice", "password": password, "faceDetected": face })),
        )
        .await
    }

    #[tokio::test]
    async fn register_issues_token_and_profile() {
        let app = test_app().await;
        let token = register_alice(&app).await;
        assert_eq!(token.len(), 64);

        let (status, body) = send(&app, "GET", "/api/auth/user", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let user: UserProfile = serde_json::from_value(body["user"].clone()).unwrap();
        assert_eq!(user.username, "alice");
        assert!(body["user"].get("password").is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let app = test_app().await;
        register_alice(&app).await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({
                "name": "Other",
                "email": "alice@example.com",
                "username": "other",
                "password": "pw"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(
            body["message"],
            "User already exists with that email or username"
        );
    }

    #[tokio::test]
    async fn registration_requires_every_field() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({ "username": "bob", "password": "pw" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(app.store.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn login_without_face_is_refused_and_recorded() {
        let app = test_app().await;
        let token = register_alice(&app).await;

        let (status, body) = login(&app, "correct horse", false).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Face detection failed. Access denied.");

        let (status, body) = send(&app, "GET", "/api/auth/history", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["success"], false);
        assert_eq!(history[0]["faceDetected"], false);
        assert_eq!(history[0]["ipAddress"], "10.0.0.7");
        assert_eq!(history[0]["userAgent"], "facegate-test");
    }

    #[tokio::test]
    async fn login_checks_password() {
        let app = test_app().await;
        register_alice(&app).await;

        let (status, body) = login(&app, "wrong", true).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid username or password");

        let (status, body) = login(&app, "correct horse", true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["username"], "alice");

        let token = body["token"].as_str().unwrap();
        let (_, body) = send(&app, "GET", "/api/auth/history", Some(token), None).await;
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["success"], true);
        assert_eq!(history[1]["success"], false);
    }

    #[tokio::test]
    async fn unknown_user_gets_generic_error() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "username": "ghost", "password": "pw", "faceDetected": true })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid username or password");
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_account() {
        let app = test_app().await;
        register_alice(&app).await;
        for _ in 0..5 {
            let (status, _) = login(&app, "wrong", true).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        let (status, body) = login(&app, "correct horse", true).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn token_errors() {
        let app = test_app().await;
        let (status, body) = send(&app, "GET", "/api/auth/user", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "No token, authorization denied");

        let (status, body) = send(&app, "GET", "/api/auth/history", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid token");
    }

    #[tokio::test]
    async fn deleted_user_profile_is_not_found() {
        let app = test_app().await;
        let token = register_alice(&app).await;
        let user = app.store.find_by_username("alice").await.unwrap().unwrap();
        app.store.delete_user(&user.id).await.unwrap();

        let (status, body) = send(&app, "GET", "/api/auth/user", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "User not found");
    }

    #[tokio::test]
    async fn serves_models_and_static_pages() {
        let app = test_app().await;
        for (uri, expected) in [
            ("/models/tiny_face_detector_model-shard1", "weights"),
            ("/", "<h1>login</h1>"),
            ("/dashboard", "<h1>dashboard</h1>"),
        ] {
            let res = app
                .router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK, "{uri}");
            let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], expected.as_bytes());
        }
    }

    struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn requests_are_logged() {
        let logs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(move || Capture(writer.clone()))
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = test_app().await;
        let (status, _) = send(&app, "GET", "/api/auth/user", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let out = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(out.contains("finished processing request"), "{out}");
        assert!(out.contains("/api/auth/user"), "{out}");
        assert!(out.contains("401"), "{out}");
    }
}
