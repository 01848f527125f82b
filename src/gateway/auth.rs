//! API-key gate for the POST and SSE channels
//!
//! Accepts either `Bearer <key>` or the raw key in a configurable header.
//! Keys are compared in constant time.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

use crate::config::AuthConfig;
use crate::error::rpc_codes;

/// Case-sensitive prefix stripped from the header value before comparison
const BEARER_PREFIX: &str = "Bearer ";

/// Message returned with every 401
pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized: Invalid or missing API key";

/// Stateless credential check against request headers
#[derive(Debug, Clone)]
pub struct AuthGate {
    required: bool,
    expected_key: Option<String>,
    header_name: String,
}

impl AuthGate {
    /// Build a gate from configuration, resolving `env:` key references once.
    ///
    /// Construction never fails; a gate that requires a key but has none
    /// rejects every request. Use [`AuthConfig::validate`] at startup to
    /// refuse such a setup instead.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            required: config.required,
            expected_key: config.resolve_api_key(),
            header_name: config.header_name.clone(),
        }
    }

    /// Whether requests must carry a key
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Name of the header carrying the key
    #[must_use]
    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Check the request headers against the configured key.
    #[must_use]
    pub fn validate(&self, headers: &HeaderMap) -> bool {
        if !self.required {
            return true;
        }

        let Some(expected) = self.expected_key.as_deref() else {
            error!(
                header = %self.header_name,
                "Authentication required but no API key is configured; rejecting request"
            );
            return false;
        };

        let Some(value) = headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
        else {
            warn!(header = %self.header_name, "Missing API key header");
            return false;
        };

        let candidate = value.strip_prefix(BEARER_PREFIX).unwrap_or(value);

        if bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())) {
            debug!("Authenticated request");
            true
        } else {
            warn!(header = %self.header_name, "Invalid API key");
            false
        }
    }

    /// Create the 401 Unauthorized response
    #[must_use]
    pub fn unauthorized_response() -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [
                (
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                ),
                (
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(r#"Bearer realm="MCP Server""#),
                ),
            ],
            Json(json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": rpc_codes::INVALID_REQUEST,
                    "message": UNAUTHORIZED_MESSAGE
                },
                "id": null
            })),
        )
            .into_response()
    }
}
