//! `/health` endpoint.

use std::time::Instant;

use blpgw_core::constants::{NAME, VERSION};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the listener runs.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Live long-poll API sessions.
    pub active_sessions: usize,
    /// Whether a started upstream session is live.
    pub upstream_connected: bool,
}

/// Snapshot the gateway's live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    active_sessions: usize,
    upstream_connected: bool,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        service: NAME,
        version: VERSION,
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions,
        upstream_connected,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn reports_counters_as_given() {
        let body = serde_json::to_value(health_check(Instant::now(), 2, 1, true)).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "blpgw");
        assert_eq!(body["version"], VERSION);
        assert_eq!(body["connections"], 2);
        assert_eq!(body["active_sessions"], 1);
        assert_eq!(body["upstream_connected"], true);
    }

    #[test]
    fn uptime_counts_from_start() {
        let started = Instant::now().checked_sub(Duration::from_secs(90)).unwrap();
        let resp = health_check(started, 0, 0, false);
        assert!(resp.uptime_secs >= 89);
        assert!(!resp.upstream_connected);
    }
}
