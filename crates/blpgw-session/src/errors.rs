//! Session error types.

use blpgw_core::{Classify, ErrorClass};
use thiserror::Error;

/// Errors raised by the multiplexed session and raw session implementations.
///
/// `Clone` because one termination fans out to every pending request and
/// subscription.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The upstream rejected a service open; `reason` is its description verbatim.
    #[error("{reason}")]
    ServiceOpenFailure {
        /// Service URI that failed to open.
        uri: String,
        /// Upstream rejection reason.
        reason: String,
    },
    /// The upstream session terminated or was stopped.
    #[error("session terminated")]
    Terminated,
    /// A subscription in the batch is already tracked by this session.
    #[error("Subscription already exists for index {index}")]
    DuplicateSubscription {
        /// Position within the batch.
        index: usize,
    },
    /// A subscription passed to unsubscribe is not tracked.
    #[error("Subscription not found at index {index}")]
    UnknownSubscription {
        /// Position within the batch.
        index: usize,
    },
    /// The upstream session failed to start.
    #[error("session start failed: {0}")]
    StartFailure(String),
    /// Any other upstream-reported failure.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl Classify for SessionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::ServiceOpenFailure { .. } | Self::StartFailure(_) | Self::Upstream(_) => {
                ErrorClass::Upstream
            }
            Self::Terminated => ErrorClass::Terminated,
            Self::DuplicateSubscription { .. } | Self::UnknownSubscription { .. } => {
                ErrorClass::Misuse
            }
        }
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_open_failure_surfaces_reason_verbatim() {
        let err = SessionError::ServiceOpenFailure {
            uri: "//blp/bogus".into(),
            reason: "Service not found".into(),
        };
        assert_eq!(err.to_string(), "Service not found");
        assert_eq!(err.class(), ErrorClass::Upstream);
    }

    #[test]
    fn terminated_display_and_class() {
        assert_eq!(SessionError::Terminated.to_string(), "session terminated");
        assert_eq!(SessionError::Terminated.class().http_status(), 500);
    }

    #[test]
    fn misuse_errors_name_the_index() {
        let err = SessionError::UnknownSubscription { index: 2 };
        assert_eq!(err.to_string(), "Subscription not found at index 2");
        assert_eq!(err.class(), ErrorClass::Misuse);
        assert_eq!(
            SessionError::DuplicateSubscription { index: 0 }.class(),
            ErrorClass::Misuse
        );
    }
}
