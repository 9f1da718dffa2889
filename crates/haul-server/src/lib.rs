//! Connection gateway: WebSocket transport, frame dispatch, webhooks and
//! the status probe. The only crate that performs socket I/O.

pub mod auth;
pub mod client;
pub mod config;
pub mod event_bridge;
pub mod gateway;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod webhooks;

pub use config::{ConfigError, RelayConfig};
pub use server::{build_router, start, ServerConfig, ServerHandle, Services};
