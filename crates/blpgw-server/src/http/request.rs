//! `POST /request`: one request, its response chunks streamed as one JSON
//! document.
//!
//! The status line is committed with the first chunk. A failure after that
//! point closes the document with a non-zero `status` instead.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use blpgw_session::{ResponseChunk, ResponseStream, SessionError, request_service_uri};
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::errors::ApiError;
use crate::http::json_body;
use crate::metrics::HTTP_REQUESTS_TOTAL;
use crate::server::AppState;

/// Query string of `POST /request`.
#[derive(Debug, Default, Deserialize)]
pub struct RequestQuery {
    /// Service namespace, e.g. `blp`.
    pub ns: Option<String>,
    /// Service name, e.g. `refdata`.
    pub service: Option<String>,
    /// Request name, e.g. `HistoricalDataRequest`.
    #[serde(rename = "type")]
    pub request_type: Option<String>,
}

impl RequestQuery {
    fn target(&self) -> Option<(&str, &str, &str)> {
        Some((
            non_empty(self.ns.as_ref())?,
            non_empty(self.service.as_ref())?,
            non_empty(self.request_type.as_ref())?,
        ))
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

const OPEN: &str = r#"{"data":["#;
const CLOSE_OK: &str = r#"],"status":0,"message":"OK"}"#;

enum Phase {
    Streaming(ResponseStream),
    Done,
}

/// Handle `POST /request`.
#[instrument(skip_all, fields(request_type = ?query.request_type))]
pub async fn request_handler(
    State(state): State<AppState>,
    Query(query): Query<RequestQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => "request").increment(1);
    let Some((ns, service, request_type)) = query.target() else {
        return Err(ApiError::bad_request(
            "Missing query parameters: ns, service and type are required.",
        ));
    };
    let payload = json_body(&body, &state.config)?.unwrap_or_else(|| Value::Object(Map::new()));

    let mux = state.provider.get().await?;
    let uri = request_service_uri(ns, service);
    let mut responses = mux.request(&uri, request_type, payload).await?;
    info!(uri = %uri, id = %responses.correlation_id(), "request sent");

    let first = match responses.next_chunk().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(err)) => return Err(err.into()),
        None => return Err(ApiError::internal("response ended before any data")),
    };

    let (opening, phase) = if first.is_final {
        (format!("{OPEN}{}{CLOSE_OK}", first.data), Phase::Done)
    } else {
        (format!("{OPEN}{}", first.data), Phase::Streaming(responses))
    };
    let rest = stream::unfold(phase, |phase| async move {
        let Phase::Streaming(mut responses) = phase else {
            return None;
        };
        let piece = match responses.next_chunk().await {
            Some(Ok(ResponseChunk { data, is_final: false })) => {
                return Some((Ok(format!(",{data}")), Phase::Streaming(responses)));
            }
            Some(Ok(ResponseChunk { data, is_final: true })) => format!(",{data}{CLOSE_OK}"),
            Some(Err(err)) => close_with_error(&err),
            None => CLOSE_OK.to_owned(),
        };
        Some((Ok::<_, Infallible>(piece), Phase::Done))
    });
    let body = stream::once(async move { Ok::<_, Infallible>(opening) }).chain(rest);

    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response())
}

fn close_with_error(err: &SessionError) -> String {
    warn!(error = %err, "response failed after streaming began");
    let message = Value::String(err.to_string());
    format!(r#"],"status":1,"message":{message}}}"#)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_requires_every_parameter() {
        let full = RequestQuery {
            ns: Some("blp".into()),
            service: Some("refdata".into()),
            request_type: Some("HistoricalDataRequest".into()),
        };
        assert_eq!(full.target(), Some(("blp", "refdata", "HistoricalDataRequest")));

        let missing = RequestQuery {
            service: None,
            ..full
        };
        assert_eq!(missing.target(), None);

        let blank = RequestQuery {
            ns: Some(String::new()),
            service: Some("refdata".into()),
            request_type: Some("X".into()),
        };
        assert_eq!(blank.target(), None);
    }

    #[test]
    fn error_close_is_valid_json() {
        let doc = format!(
            "{OPEN}{{\"a\":1}}{}",
            close_with_error(&SessionError::Terminated)
        );
        let parsed: Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed["status"], 1);
        assert_eq!(parsed["message"], "session terminated");
        assert_eq!(parsed["data"][0]["a"], 1);
    }
}
