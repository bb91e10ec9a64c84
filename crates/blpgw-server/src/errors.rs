//! HTTP boundary errors.
//!
//! Every crate error is classified through [`Classify`]; [`ApiError`] carries
//! the resulting status and renders `{"status": <code>, "message": "..."}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use blpgw_core::{Classify, ErrorClass};
use blpgw_longpoll::{ApiSessionError, PollError};
use blpgw_session::SessionError;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use crate::metrics::HTTP_ERRORS_TOTAL;

/// An error on its way to an HTTP client.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    class: ErrorClass,
    message: String,
}

impl ApiError {
    /// Error of `class` with `message` shown to the client.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// 400 with `message`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Misuse, message)
    }

    /// 500 with `message`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, message)
    }

    /// Classification.
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Status code sent to the client.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.class.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn classified(err: &(impl Classify + std::fmt::Display)) -> Self {
        Self::new(err.class(), err.to_string())
    }
}

impl From<PollError> for ApiError {
    fn from(err: PollError) -> Self {
        Self::classified(&err)
    }
}

impl From<ApiSessionError> for ApiError {
    fn from(err: ApiSessionError) -> Self {
        Self::classified(&err)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::classified(&err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(class = %self.class, message = %self.message, "request failed");
        } else {
            debug!(class = %self.class, message = %self.message, "request rejected");
        }
        metrics::counter!(HTTP_ERRORS_TOTAL, "class" => self.class.as_str()).increment(1);
        let body = json!({
            "status": status.as_u16(),
            "message": self.message,
        });
        (status, Json(body)).into_response()
    }
}
