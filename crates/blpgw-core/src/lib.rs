//! # blpgw-core
//!
//! Foundation types shared by every gateway crate:
//!
//! - **Correlation ids**: [`CorrelationId`] and the monotonic [`CorrelationIdAllocator`]
//! - **Branded ids**: [`ClientKey`] (per-client identity) and [`ConnectionId`]
//! - **Error classes**: [`ErrorClass`] and the [`Classify`] trait used at the HTTP boundary
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::{Classify, ErrorClass};
pub use ids::{ClientKey, ConnectionId, CorrelationId, CorrelationIdAllocator};
