//! HTTP adapters over the multiplexed session and the long-poll store.

pub mod request;
pub mod subscription;

use axum::http::HeaderMap;
use blpgw_core::ClientKey;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::errors::ApiError;

/// Client identity from the configured header. Missing or blank is a 400.
pub fn client_key(headers: &HeaderMap, config: &ServerConfig) -> Result<ClientKey, ApiError> {
    let key = headers
        .get(config.identity_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing client identity."))?;
    if config.log_client_detail {
        debug!(client = key, "client identity");
    }
    Ok(ClientKey::from(key))
}

/// Parse a JSON request body. An empty body is `None`.
pub fn json_body(body: &Bytes, config: &ServerConfig) -> Result<Option<Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Invalid JSON body: {err}")))?;
    if config.log_request_body {
        debug!(body = %value, "request body");
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn client_key_reads_configured_header() {
        let config = ServerConfig::default();
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-client-id", HeaderValue::from_static(" alice "));
        assert_eq!(client_key(&headers, &config).unwrap().as_str(), "alice");
    }

    #[test]
    fn client_key_missing_or_blank_is_rejected() {
        let config = ServerConfig::default();
        let mut headers = HeaderMap::new();
        assert_eq!(
            client_key(&headers, &config).unwrap_err().status(),
            axum::http::StatusCode::BAD_REQUEST
        );
        let _ = headers.insert("x-client-id", HeaderValue::from_static("  "));
        assert!(client_key(&headers, &config).is_err());
    }

    #[test]
    fn json_body_empty_is_none() {
        let config = ServerConfig::default();
        assert_eq!(json_body(&Bytes::new(), &config).unwrap(), None);
        assert_eq!(json_body(&Bytes::from_static(b" \n"), &config).unwrap(), None);
    }

    #[test]
    fn json_body_parses_or_rejects() {
        let config = ServerConfig::default();
        let parsed = json_body(&Bytes::from_static(b"[1,2]"), &config).unwrap();
        assert_eq!(parsed, Some(serde_json::json!([1, 2])));
        assert!(json_body(&Bytes::from_static(b"{nope"), &config).is_err());
    }
}
