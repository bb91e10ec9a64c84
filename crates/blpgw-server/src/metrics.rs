//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Names recorded by the server crate. The lower crates record their own
// `blpgw_upstream_*`, `blpgw_polls_total` and `blpgw_api_sessions_reaped_total`.

/// HTTP requests handled (counter, labels: route).
pub const HTTP_REQUESTS_TOTAL: &str = "blpgw_http_requests_total";
/// HTTP requests that ended in an error response (counter, labels: class).
pub const HTTP_ERRORS_TOTAL: &str = "blpgw_http_errors_total";
/// Live API sessions (gauge).
pub const API_SESSIONS_ACTIVE: &str = "blpgw_api_sessions_active";
/// Upstream sessions started (counter).
pub const UPSTREAM_SESSIONS_STARTED_TOTAL: &str = "blpgw_upstream_sessions_started_total";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "blpgw_ws_connections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "blpgw_ws_connections_active";
/// Outbound WebSocket messages dropped on a full queue (counter).
pub const WS_DROPPED_MESSAGES_TOTAL: &str = "blpgw_ws_dropped_messages_total";

/// Publish the number of live API sessions.
#[allow(clippy::cast_precision_loss)]
pub fn record_api_sessions(count: usize) {
    metrics::gauge!(API_SESSIONS_ACTIVE).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            HTTP_REQUESTS_TOTAL,
            HTTP_ERRORS_TOTAL,
            API_SESSIONS_ACTIVE,
            UPSTREAM_SESSIONS_STARTED_TOTAL,
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_DROPPED_MESSAGES_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("blpgw_"), "metric name '{name}' must be prefixed");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
