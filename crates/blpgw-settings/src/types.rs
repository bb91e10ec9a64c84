//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON document deserializes with compiled defaults for every missing field.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the gateway.
///
/// ```json
/// {
///   "server": { "port": 3001 },
///   "longPoll": { "pollTimeoutMs": 10000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener and transport settings.
    pub server: ServerSettings,
    /// Per-client session lifetime.
    pub api_session: ApiSessionSettings,
    /// Long-poll buffering.
    pub long_poll: LongPollSettings,
    /// Simulated upstream session tuning.
    pub upstream: UpstreamSettings,
    /// Logging switches.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.long_poll.max_buffer_size == 0 {
            return Err(SettingsError::InvalidValue(
                "longPoll.maxBufferSize must be at least 1".into(),
            ));
        }
        if self.long_poll.history_depth < 2 {
            return Err(SettingsError::InvalidValue(
                "longPoll.historyDepth must be at least 2".into(),
            ));
        }
        if self.long_poll.poll_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "longPoll.pollTimeoutMs must be positive".into(),
            ));
        }
        if self.api_session.reap_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "apiSession.reapIntervalMs must be positive".into(),
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxBodyBytes must be positive".into(),
            ));
        }
        if self.server.identity_header.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "server.identityHeader must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Request header carrying the client identity.
    pub identity_header: String,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Whether `/ws` is served.
    pub websocket_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            identity_header: "x-client-id".to_string(),
            max_body_bytes: 1024,
            websocket_enabled: true,
        }
    }
}

/// Per-client session lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSessionSettings {
    /// Idle seconds after which an `ApiSession` becomes eligible for eviction.
    pub expiration_secs: u64,
    /// Reaper tick in milliseconds.
    pub reap_interval_ms: u64,
}

impl ApiSessionSettings {
    /// Expiration threshold as a [`Duration`].
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    /// Reaper tick as a [`Duration`].
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

impl Default for ApiSessionSettings {
    fn default() -> Self {
        Self {
            expiration_secs: 5,
            reap_interval_ms: 1000,
        }
    }
}

/// Long-poll buffering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LongPollSettings {
    /// Capacity of each buffer level.
    pub max_buffer_size: usize,
    /// Number of buffer levels per subscription.
    pub history_depth: usize,
    /// Server-side wait before a poll times out.
    pub poll_timeout_ms: u64,
}

impl LongPollSettings {
    /// Poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for LongPollSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            history_depth: 2,
            poll_timeout_ms: 30_000,
        }
    }
}

/// Simulated upstream session tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// Interval between simulated subscription ticks.
    pub tick_interval_ms: u64,
    /// Partial responses emitted before each final response.
    pub partial_responses: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            partial_responses: 1,
        }
    }
}

/// Logging switches.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Log inbound request bodies at debug level.
    pub log_request_body: bool,
    /// Log client identity and peer address on each request.
    pub log_client_detail: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_request_body: false,
            log_client_detail: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = GatewaySettings::default();
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 3000);
        assert_eq!(s.server.identity_header, "x-client-id");
        assert_eq!(s.server.max_body_bytes, 1024);
        assert!(s.server.websocket_enabled);
        assert_eq!(s.api_session.expiration_secs, 5);
        assert_eq!(s.long_poll.max_buffer_size, 100);
        assert_eq!(s.long_poll.history_depth, 2);
        assert_eq!(s.long_poll.poll_timeout(), Duration::from_secs(30));
        assert_eq!(s.logging.level, "info");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn json_field_names_are_camel_case() {
        let json = serde_json::to_value(GatewaySettings::default()).unwrap();
        assert!(json["apiSession"]["expirationSecs"].is_u64());
        assert!(json["longPoll"]["pollTimeoutMs"].is_u64());
        assert!(json["server"]["identityHeader"].is_string());
        assert!(json["logging"]["logRequestBody"].is_boolean());
    }

    #[test]
    fn empty_json_produces_defaults() {
        let s: GatewaySettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.server.port, 3000);
        assert_eq!(s.upstream.partial_responses, 1);
    }

    #[test]
    fn partial_section_keeps_other_fields() {
        let s: GatewaySettings =
            serde_json::from_str(r#"{"longPoll": {"historyDepth": 4}}"#).unwrap();
        assert_eq!(s.long_poll.history_depth, 4);
        assert_eq!(s.long_poll.max_buffer_size, 100);
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        let mut s = GatewaySettings::default();
        s.long_poll.max_buffer_size = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("maxBufferSize"));
    }

    #[test]
    fn validate_rejects_zero_history() {
        let mut s = GatewaySettings::default();
        s.long_poll.history_depth = 0;
        assert!(s.validate().is_err());
        s.long_poll.history_depth = 1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut s = GatewaySettings::default();
        s.long_poll.poll_timeout_ms = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_identity_header() {
        let mut s = GatewaySettings::default();
        s.server.identity_header = "  ".into();
        assert!(s.validate().is_err());
    }
}
