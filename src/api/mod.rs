pub mod auth;
mod envelope;
pub mod error;
mod exec;
mod fs;
mod handlers;
mod net;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{delete, get, post, put},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::config::SessionSettings;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

pub use envelope::Envelope;
pub use exec::ExecResult;
pub use fs::FileInfo;
pub use net::{DownloadResult, PortsResult};

use handlers::*;

/// Request bodies above this size are rejected (file writes included).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
    pub settings: Arc<SessionSettings>,
    /// Shared client for the download endpoint.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            registry: SessionRegistry::new(),
            shutdown: ShutdownCoordinator::new(),
            settings: Arc::new(settings),
            http: reqwest::Client::new(),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// The same secret gates the control socket (`?auth=`) and the REST API
/// (`Authorization: Bearer`).
pub struct RouterConfig {
    pub token: String,
    pub rate_limit: Option<u32>,
}

impl RouterConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            rate_limit: None,
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let secret: Arc<str> = Arc::from(config.token);

    let api_routes = Router::new()
        .route("/fs/listdir", get(fs::listdir))
        .route("/fs/create", post(fs::create))
        .route("/fs/delete", delete(fs::delete))
        .route("/fs/rename", put(fs::rename))
        .route("/fs/copy", post(fs::copy))
        .route("/fs/move", post(fs::move_path))
        .route("/fs/read", get(fs::read))
        .route("/fs/write", post(fs::write))
        .route("/fs/mkdir", post(fs::mkdir))
        .route("/shell/exec", post(exec::exec))
        .route("/net/download", post(net::download))
        .route("/net/ports", get(net::ports));

    // Apply rate limiting to the API routes if configured.
    let api_routes = match config.rate_limit {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            let governor_conf = GovernorConfigBuilder::default()
                .per_second(u64::from(rps))
                .burst_size(rps)
                .key_extractor(PeerIpKeyExtractor)
                .finish();
            match governor_conf {
                Some(conf) => api_routes.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(rps, "invalid rate limit, API left unthrottled");
                    api_routes
                }
            }
        }
        None => api_routes,
    };

    let api_secret = secret.clone();
    let api_routes = api_routes.layer(axum::middleware::from_fn(move |req, next| {
        let t = api_secret.clone();
        async move { auth::require_auth(t, req, next).await }
    }));

    let control = Router::new()
        .route("/ws", get(ws_control))
        .layer(axum::middleware::from_fn(move |req, next| {
            let s = secret.clone();
            async move { auth::require_connection_secret(s, req, next).await }
        }));

    Router::new()
        .route("/health", get(health))
        .merge(control)
        .nest("/api", api_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt; // for oneshot()

    fn test_router() -> Router {
        let settings = SessionSettings {
            shell: "/bin/sh".into(),
            ..SessionSettings::default()
        };
        router(AppState::new(settings), RouterConfig::new("secret"))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_security_headers_on_health() {
        let response = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(
            response.headers().get("referrer-policy").unwrap(),
            "no-referrer"
        );
    }

    #[tokio::test]
    async fn test_api_requires_bearer() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/fs/read?path=/etc/hostname")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "auth_required");
    }

    #[tokio::test]
    async fn test_control_socket_gated_before_upgrade() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/ws?auth=wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_malformed_json_uses_envelope() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/fs/mkdir")
                    .header("authorization", "Bearer secret")
                    .header("content-type", "application/json")
                    .body(Body::from("{nope"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "invalid_request");
    }
}
