//! # blpgw-longpoll
//!
//! Buffering and sequencing for clients that poll instead of holding a
//! connection open.
//!
//! - [`HistoricalBufferManager`]: fixed-depth ring of bounded tick buffers
//! - [`FreshnessStore`]: recency-ordered store with an idle reaper
//! - [`ApiSession`]: one client's subscriptions, buffers and poll ids
//! - [`LongPollCoordinator`]: poll-id validation and the bounded wait

#![deny(unsafe_code)]

pub mod api_session;
pub mod buffer;
pub mod errors;
pub mod freshness;
pub mod poll;

pub use api_session::{ApiSession, InUseGuard, PolledPage, SubscriptionSpec};
pub use buffer::{BufferedData, HistoricalBufferManager};
pub use errors::{ApiSessionError, PollError};
pub use freshness::{Expirable, FreshnessStore};
pub use poll::{LongPollCoordinator, PollDecision, PollState, validate_poll_id};

/// The freshness store holding every client's [`ApiSession`].
pub type ApiSessionStore = FreshnessStore<blpgw_core::ClientKey, std::sync::Arc<ApiSession>>;
