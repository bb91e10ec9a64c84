//! # blpgw-session
//!
//! Turns one correlation-id keyed event session into many independent,
//! awaitable request and subscription handles.
//!
//! - [`RawSession`]: the upstream capability (start/stop, open service,
//!   request, subscribe, unsubscribe) plus its [`RawEvent`] stream
//! - [`CorrelationRegistry`]: (event name, correlation id) → handler routing
//! - [`ServiceCache`]: one shared open attempt per service URI
//! - [`MultiplexedSession`]: the request/subscribe/unsubscribe API
//! - [`SimulatedSession`]: an in-process raw session for local runs and tests

#![deny(unsafe_code)]

pub mod errors;
pub mod multiplexed;
pub mod names;
pub mod raw;
pub mod registry;
pub mod services;
pub mod sim;
pub mod subscription;

pub use errors::{Result, SessionError};
pub use multiplexed::{MultiplexedSession, ResponseChunk, ResponseStream};
pub use names::{request_service_uri, response_name, service_for_security};
pub use raw::{EventType, RawEvent, RawMessage, RawSession, SubscriptionRequest};
pub use registry::CorrelationRegistry;
pub use services::ServiceCache;
pub use sim::{RawCall, SimulatedConfig, SimulatedSession};
pub use subscription::{Subscription, SubscriptionEvent};
