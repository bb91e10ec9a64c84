//! Long-poll and API session error types.

use blpgw_core::{Classify, ErrorClass};
use blpgw_session::SessionError;
use thiserror::Error;

/// Why a poll produced no page.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PollError {
    /// The client has nothing subscribed.
    #[error("No active subscriptions.")]
    NoActiveSubscriptions,
    /// The poll id breaks the sequencing rules.
    #[error("Invalid Poll Id")]
    InvalidPollId,
    /// No data arrived before the server-side wait elapsed. Retrying with the
    /// same poll id is valid.
    #[error("No subscription data within {timeout_ms}ms.")]
    Timeout {
        /// Wait that elapsed, in milliseconds.
        timeout_ms: u64,
    },
    /// The client went away while waiting.
    #[error("poll cancelled")]
    Cancelled,
}

impl Classify for PollError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NoActiveSubscriptions => ErrorClass::Misuse,
            Self::InvalidPollId => ErrorClass::Conflict,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Cancelled => ErrorClass::Internal,
        }
    }
}

/// Errors from subscribe/unsubscribe on an [`ApiSession`](crate::ApiSession).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiSessionError {
    /// Malformed subscription entry.
    #[error("Invalid subscription data: {0}")]
    InvalidBody(String),
    /// The correlation id is already used by this client.
    #[error("Correlation Id {0} already exist.")]
    DuplicateCorrelationId(u64),
    /// Unsubscribe with nothing subscribed.
    #[error("No active subscriptions.")]
    NoActiveSubscriptions,
    /// Unsubscribe with an empty id list.
    #[error("Invalid unsubscribe data.")]
    InvalidUnsubscribe,
    /// Unsubscribe naming an id this client does not hold.
    #[error("Invalid correlation id {0}.")]
    InvalidCorrelationId(u64),
    /// The session was evicted while the operation was in flight.
    #[error("session expired")]
    Expired,
    /// The multiplexed session failed the operation.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl Classify for ApiSessionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidBody(_) | Self::DuplicateCorrelationId(_) | Self::NoActiveSubscriptions => {
                ErrorClass::Misuse
            }
            Self::InvalidUnsubscribe | Self::InvalidCorrelationId(_) => ErrorClass::Conflict,
            Self::Expired => ErrorClass::NotFound,
            Self::Session(err) => err.class(),
        }
    }
}
