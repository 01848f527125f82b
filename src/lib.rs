//! MCP Session Transport
//!
//! Carries JSON-RPC 2.0 messages between a remote client and a server-side
//! handler over two HTTP channels sharing one `mcp-session-id`:
//!
//! - **POST**: client-to-server request; the HTTP response is the handler's reply
//! - **GET**: Server-Sent Events stream for server-to-client push, with a
//!   `ping` heartbeat
//! - **Auth**: optional API-key gate (`Bearer <key>` or raw key) on both
//!
//! The business logic lives behind [`transport::MessageHandler`]; the
//! [`gateway`] module hosts one [`transport::SessionTransport`] per session
//! behind an axum router.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
