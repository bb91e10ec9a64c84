//! # blpgw-server
//!
//! Axum transport adapters for the gateway.
//!
//! - **HTTP**: `POST /request` streams a request's response chunks;
//!   `POST /subscription?action=start|stop` and `GET /subscription?pollid=N`
//!   drive the long-poll API sessions
//! - **WebSocket**: `GET /ws` with connection-scoped subscriptions
//! - **Upstream**: [`SessionProvider`] owns the shared multiplexed session
//! - **Operations**: `/health`, `/metrics`, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod http;
pub mod metrics;
pub mod provider;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ApiError;
pub use provider::{RawSessionFactory, SessionProvider, SimulatedFactory};
pub use server::{AppState, GatewayServer};
pub use shutdown::ShutdownCoordinator;
