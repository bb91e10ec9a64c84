//! `GatewayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use blpgw_longpoll::{ApiSessionStore, LongPollCoordinator};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::http::request::request_handler;
use crate::http::subscription::{poll_handler, subscription_action};
use crate::provider::{RawSessionFactory, SessionProvider};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::ws_handler;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shared upstream session.
    pub provider: Arc<SessionProvider>,
    /// Long-poll API sessions by client.
    pub sessions: Arc<ApiSessionStore>,
    /// Poll sequencing and wait bound.
    pub coordinator: LongPollCoordinator,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Open WebSocket connections.
    pub ws_connections: Arc<AtomicUsize>,
}

/// The gateway server.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    /// Create a server whose upstream sessions come from `factory`.
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn RawSessionFactory>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let sessions = Arc::new(ApiSessionStore::new(config.session_expiration));
        let coordinator = LongPollCoordinator::new(config.poll_timeout);
        Self {
            state: AppState {
                config: Arc::new(config),
                provider: Arc::new(SessionProvider::new(factory)),
                sessions,
                coordinator,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics,
                ws_connections: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/request", post(request_handler))
            .route("/subscription", post(subscription_action).get(poll_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler));
        if self.state.config.websocket_enabled {
            router = router.route("/ws", get(ws_handler));
        }
        router
            .layer(DefaultBodyLimit::max(self.state.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind, start the API session reaper, and serve until shutdown.
    ///
    /// Returns the bound address and a handle that completes once the
    /// listener and the reaper have stopped.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let config = &self.state.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;

        let token = self.state.shutdown.token();
        let reaper = self
            .state
            .sessions
            .spawn_reaper(config.reap_interval, token.clone());
        let app = self.router();
        info!(%addr, "gateway listening");

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(err) = serve.await {
                error!(error = %err, "server error");
            }
            let _ = reaper.await;
            info!("gateway stopped");
        });
        Ok((addr, handle))
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the API session store.
    pub fn sessions(&self) -> &Arc<ApiSessionStore> {
        &self.state.sessions
    }

    /// Get the upstream session provider.
    pub fn provider(&self) -> &Arc<SessionProvider> {
        &self.state.provider
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> AppState {
        self.state.clone()
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.ws_connections.load(Ordering::Relaxed),
        state.sessions.len(),
        state.provider.is_connected(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::provider::SimulatedFactory;

    fn make_server() -> GatewayServer {
        GatewayServer::new(
            ServerConfig::default(),
            Arc::new(SimulatedFactory::default()),
            None,
        )
    }

    async fn send(server: &GatewayServer, req: Request<Body>) -> (StatusCode, Value) {
        let resp = server.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let parsed = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, parsed)
    }

    fn as_client(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-client-id", "alice")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert!(!server.shutdown().is_shutting_down());
        assert!(server.sessions().is_empty());
        assert!(!server.provider().is_connected());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&server, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["upstream_connected"], false);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_route_follows_config() {
        let config = ServerConfig {
            websocket_enabled: false,
            ..ServerConfig::default()
        };
        let server = GatewayServer::new(config, Arc::new(SimulatedFactory::default()), None);
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_action_is_400() {
        let server = make_server();
        let (status, body) = send(&server, as_client("POST", "/subscription?action=pause", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid action");
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn missing_identity_is_400() {
        let server = make_server();
        let req = Request::builder()
            .uri("/subscription?pollid=1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&server, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn poll_without_session_is_400() {
        let server = make_server();
        let (status, body) = send(&server, as_client("GET", "/subscription?pollid=1", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "No active subscriptions.");
    }

    #[tokio::test]
    async fn request_without_parameters_is_400() {
        let server = make_server();
        let (status, _) = send(&server, as_client("POST", "/request?ns=blp", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = make_server();
        let body = format!("[{}]", "1,".repeat(1024) + "1");
        let resp = server
            .router()
            .oneshot(as_client("POST", "/subscription?action=start", &body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn subscribe_then_stop_drops_the_session() {
        let server = make_server();
        let body = json!([{"correlationId": 1, "security": "IBM US Equity", "fields": ["LAST_PRICE"]}]);
        let (status, reply) = send(
            &server,
            as_client("POST", "/subscription?action=start", &body.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply, json!({"status": 0, "message": "Subscribed"}));
        assert_eq!(server.sessions().len(), 1);

        let (status, reply) = send(
            &server,
            as_client("POST", "/subscription?action=start", &body.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["message"], "Correlation Id 1 already exist.");

        let (status, _) = send(&server, as_client("GET", "/subscription?pollid=abc", "")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, reply) = send(
            &server,
            as_client("POST", "/subscription?action=stop", r#"{"correlationIds":[]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(reply["message"], "Invalid unsubscribe data.");

        let (status, reply) = send(&server, as_client("POST", "/subscription?action=stop", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["message"], "Unsubscribe Successfully");
        assert_eq!(reply["data"], json!([]));
        assert!(server.sessions().is_empty());

        let (status, _) = send(&server, as_client("POST", "/subscription?action=stop", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn request_streams_every_chunk() {
        let server = make_server();
        let uri = "/request?ns=blp&service=refdata&type=HistoricalDataRequest";
        let (status, body) = send(&server, as_client("POST", uri, r#"{"securities":["IBM"]}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], 0);
        assert_eq!(body["message"], "OK");
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }
}
