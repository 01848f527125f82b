//! Error types for the session transport

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the session transport
pub type Result<T> = std::result::Result<T, Error>;

/// Session transport errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transport was closed before or while the operation ran
    #[error("Transport is closed")]
    TransportClosed,

    /// A request handler did not answer in time
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Error raised by the business-logic message handler
    #[error("{0}")]
    Handler(String),

    /// SSE push stream error
    #[error("Stream error: {0}")]
    Stream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Message shown to the HTTP client in `error.message`.
    ///
    /// Passes the underlying failure through without the variant prefix.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Json(e) => e.to_string(),
            Self::Handler(msg) => msg.clone(),
            Self::RequestTimeout(_) => "Request timed out".to_string(),
            Self::TransportClosed => self.to_string(),
            Self::Config(_) | Self::Stream(_) | Self::Io(_) | Self::Internal(_) => {
                "Internal error".to_string()
            }
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_passes_through_underlying_failure() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let expected = json_err.to_string();
        assert_eq!(Error::Json(json_err).client_message(), expected);
        assert_eq!(Error::handler("boom").client_message(), "boom");
        assert_eq!(Error::TransportClosed.client_message(), "Transport is closed");
        assert_eq!(
            Error::Internal("secret detail".into()).client_message(),
            "Internal error"
        );
    }

    #[test]
    fn test_io_failure_is_hidden_from_clients() {
        let err: Error = io::Error::new(io::ErrorKind::AddrInUse, "port 39410 taken").into();
        assert!(err.to_string().contains("port 39410 taken"));
        assert_eq!(err.client_message(), "Internal error");
    }
}
