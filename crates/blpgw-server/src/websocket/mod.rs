//! WebSocket transport: connection-scoped subscriptions pushed as they tick.

pub mod connection;
pub mod protocol;
pub mod session;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::Response;
use blpgw_core::ConnectionId;

use crate::server::AppState;

/// GET /ws: upgrade and hand the socket to [`session::run_ws_session`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let identity = headers
        .get(state.config.identity_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    ws.on_upgrade(move |socket| session::run_ws_session(socket, ConnectionId::new(), state, identity))
}
