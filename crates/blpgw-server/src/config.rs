//! Server configuration.

use std::time::Duration;

use blpgw_settings::GatewaySettings;

/// Runtime configuration for [`GatewayServer`](crate::server::GatewayServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Header carrying the client identity.
    pub identity_header: String,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// Whether `/ws` is routed.
    pub websocket_enabled: bool,
    /// Idle time before an API session may be evicted.
    pub session_expiration: Duration,
    /// Reaper tick.
    pub reap_interval: Duration,
    /// Ticks kept per buffer level.
    pub max_buffer_size: usize,
    /// Buffer levels per subscription.
    pub history_depth: usize,
    /// Long-poll wait bound.
    pub poll_timeout: Duration,
    /// Log request bodies at debug level.
    pub log_request_body: bool,
    /// Log the client identity on each request.
    pub log_client_detail: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            identity_header: "x-client-id".into(),
            max_body_bytes: 1024,
            websocket_enabled: true,
            session_expiration: Duration::from_secs(5),
            reap_interval: Duration::from_secs(1),
            max_buffer_size: 100,
            history_depth: 2,
            poll_timeout: Duration::from_secs(30),
            log_request_body: false,
            log_client_detail: false,
        }
    }
}

impl From<&GatewaySettings> for ServerConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            identity_header: settings.server.identity_header.to_ascii_lowercase(),
            max_body_bytes: settings.server.max_body_bytes,
            websocket_enabled: settings.server.websocket_enabled,
            session_expiration: settings.api_session.expiration(),
            reap_interval: settings.api_session.reap_interval(),
            max_buffer_size: settings.long_poll.max_buffer_size,
            history_depth: settings.long_poll.history_depth,
            poll_timeout: settings.long_poll.poll_timeout(),
            log_request_body: settings.logging.log_request_body,
            log_client_detail: settings.logging.log_client_detail,
        }
    }
}
