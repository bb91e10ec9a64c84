//! `/subscription`: long-poll subscribe, unsubscribe and poll.
//!
//! Each handler holds an [`InUseGuard`](blpgw_longpoll::InUseGuard) on the
//! client's `ApiSession` for its whole lifetime, so the reaper cannot evict
//! the session mid-request. The guard is released on drop, including when the
//! client disconnects and axum drops the handler future.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use blpgw_core::ClientKey;
use blpgw_longpoll::{ApiSession, ApiSessionError, PollError, SubscriptionSpec};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::errors::ApiError;
use crate::http::{client_key, json_body};
use crate::metrics::{HTTP_REQUESTS_TOTAL, record_api_sessions};
use crate::server::AppState;

/// Query string of `POST /subscription`.
#[derive(Debug, Default, Deserialize)]
pub struct ActionQuery {
    /// `start` or `stop`.
    pub action: Option<String>,
}

/// Query string of `GET /subscription`.
#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    /// Client poll id. Kept as text so a malformed id is a conflict, not a
    /// rejected query.
    pub pollid: Option<String>,
}

/// Handle `POST /subscription?action=start|stop`.
pub async fn subscription_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ActionQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let key = client_key(&headers, &state.config)?;
    match query.action.as_deref() {
        Some("start") => start(&state, key, &body).await,
        Some("stop") => stop(&state, &key, &body),
        _ => Err(ApiError::bad_request("Invalid action")),
    }
}

#[instrument(skip_all, fields(client = %key))]
async fn start(state: &AppState, key: ClientKey, body: &Bytes) -> Result<Json<Value>, ApiError> {
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => "subscribe").increment(1);
    let body = json_body(body, &state.config)?
        .ok_or_else(|| ApiSessionError::InvalidBody("empty body".into()))?;
    let specs = SubscriptionSpec::parse_batch(body)?;

    let depth = state.config.history_depth;
    let capacity = state.config.max_buffer_size;
    let guard = state
        .sessions
        .with_entry_or_insert(
            &key,
            || {
                info!(client = %key, "api session created");
                ApiSession::new(key.clone(), depth, capacity)
            },
            ApiSession::acquire,
        )
        .ok_or_else(|| ApiError::internal("api session unavailable"))?;
    record_api_sessions(state.sessions.len());

    let mux = state.provider.get().await?;
    let count = specs.len();
    guard.subscribe(mux, specs).await?;
    debug!(count, "subscribed");
    Ok(Json(json!({"status": 0, "message": "Subscribed"})))
}

#[instrument(skip_all, fields(client = %key))]
fn stop(state: &AppState, key: &ClientKey, body: &Bytes) -> Result<Json<Value>, ApiError> {
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => "unsubscribe").increment(1);
    let guard = state
        .sessions
        .with_entry(key, ApiSession::acquire)
        .ok_or(ApiSessionError::NoActiveSubscriptions)?;
    let ids = json_body(body, &state.config)?.map(correlation_ids);
    let pages = guard.unsubscribe(ids)?;

    if guard.subscription_count() == 0 {
        let session = Arc::clone(guard.session());
        let removed = state.sessions.remove_if(key, |current| {
            Arc::ptr_eq(current, &session) && current.in_use() <= 1 && current.subscription_count() == 0
        });
        if removed.is_some() {
            info!("api session dropped after unsubscribing everything");
            record_api_sessions(state.sessions.len());
        }
    }
    Ok(Json(json!({
        "data": pages,
        "status": 0,
        "message": "Unsubscribe Successfully",
    })))
}

/// The `correlationIds` of an unsubscribe body. Anything malformed becomes
/// an empty list, which the session rejects as invalid unsubscribe data.
fn correlation_ids(body: Value) -> Vec<u64> {
    let Some(ids) = body.get("correlationIds").and_then(Value::as_array) else {
        return Vec::new();
    };
    let parsed: Option<Vec<u64>> = ids.iter().map(Value::as_u64).collect();
    parsed.unwrap_or_default()
}

/// Handle `GET /subscription?pollid=N`.
#[instrument(skip_all)]
pub async fn poll_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Result<Json<Value>, ApiError> {
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => "poll").increment(1);
    let key = client_key(&headers, &state.config)?;
    let guard = state
        .sessions
        .with_entry(&key, ApiSession::acquire)
        .ok_or(PollError::NoActiveSubscriptions)?;
    let poll_id = query
        .pollid
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i64>().ok());

    let cancel = state.shutdown.token();
    let pages = state.coordinator.poll(&guard, poll_id, &cancel).await?;
    Ok(Json(json!({
        "data": pages,
        "status": 0,
        "message": "OK",
    })))
}
