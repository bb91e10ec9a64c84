//! Error classification shared by every crate.
//!
//! Each crate keeps its own `thiserror` enum. What they share is the
//! [`ErrorClass`] each variant falls into, which decides how the error is
//! surfaced at the HTTP boundary and whether a client may retry it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The upstream session rejected an operation (e.g. a service failed to open).
    Upstream,
    /// The upstream session terminated; the wrapper is permanently unusable.
    Terminated,
    /// Caller misuse: malformed input, duplicate correlation id, bad depth.
    Misuse,
    /// Referenced client state does not exist.
    NotFound,
    /// A bounded wait elapsed; the client may retry with the same arguments.
    Timeout,
    /// Client protocol error (wrong poll id); not retried automatically.
    Conflict,
    /// Anything else.
    Internal,
}

impl ErrorClass {
    /// HTTP status code used when an error of this class reaches a client.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::Upstream | Self::Terminated | Self::Internal => 500,
            Self::Misuse | Self::NotFound => 400,
            Self::Timeout => 408,
            Self::Conflict => 409,
        }
    }

    /// Whether a client may retry the identical operation.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Short classification string for logging/metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Terminated => "terminated",
            Self::Misuse => "misuse",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every crate-level error enum.
pub trait Classify {
    /// The class this error belongs to.
    fn class(&self) -> ErrorClass;
}
