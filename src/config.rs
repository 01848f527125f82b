//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default header carrying the API key
pub const DEFAULT_AUTH_HEADER: &str = "Authorization";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Session transport configuration
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Sources, later ones winning: the YAML file, `MCP_TRANSPORT_*` variables
    /// (`__` separates nested keys), then `MCP_AUTH_REQUIRED`, `MCP_API_KEY`
    /// and `MCP_AUTH_HEADER_NAME`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes an invalid setup (see [`Config::validate`]).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment
            .merge(Env::prefixed("MCP_TRANSPORT_").split("__"))
            .merge(auth_env());

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.auth.api_key = config.auth.resolve_api_key();
        config.validate()?;

        Ok(config)
    }

    /// Check the configuration for setups that can never work.
    pub fn validate(&self) -> Result<()> {
        self.auth.validate()?;
        if self.transport.heartbeat_interval.is_zero() {
            return Err(Error::Config(
                "transport.heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.transport.request_timeout.is_zero() {
            return Err(Error::Config(
                "transport.request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.transport.session_idle_timeout.is_zero() {
            return Err(Error::Config(
                "transport.session_idle_timeout must be greater than zero".to_string(),
            ));
        }
        if self.transport.sse_buffer_size == 0 {
            return Err(Error::Config(
                "transport.sse_buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Copy of this configuration that is safe to print.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.auth.api_key.is_some() {
            copy.auth.api_key = Some("<redacted>".to_string());
        }
        copy
    }
}

/// Conventional auth variables, mapped onto the `auth` section.
fn auth_env() -> Env {
    Env::raw()
        .only(&["MCP_AUTH_REQUIRED", "MCP_API_KEY", "MCP_AUTH_HEADER_NAME"])
        .map(|key| {
            let key = key.as_str();
            if key.eq_ignore_ascii_case("MCP_AUTH_REQUIRED") {
                "auth.required".into()
            } else if key.eq_ignore_ascii_case("MCP_API_KEY") {
                "auth.api_key".into()
            } else {
                "auth.header_name".into()
            }
        })
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Grace period for in-flight requests after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39410,
            max_body_size: 4 * 1024 * 1024, // 4MB
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// API-key authentication configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a valid API key on every POST and GET
    pub required: bool,

    /// Expected API key. Supports a literal value or `env:VAR_NAME`.
    pub api_key: Option<String>,

    /// Header carrying the key, either `Bearer <key>` or the raw key
    pub header_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: false,
            api_key: None,
            header_name: DEFAULT_AUTH_HEADER.to_string(),
        }
    }
}

impl AuthConfig {
    /// Config that requires `key` in the default header
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            required: true,
            api_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Resolve the API key (expand `env:VAR_NAME`). Empty keys count as absent.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        let key = self.api_key.as_ref()?;
        let resolved = match key.strip_prefix("env:") {
            Some(var_name) => env::var(var_name).ok()?,
            None => key.clone(),
        };
        (!resolved.is_empty()).then_some(resolved)
    }

    /// Fail fast when authentication is required but cannot succeed.
    pub fn validate(&self) -> Result<()> {
        if self.required && self.resolve_api_key().is_none() {
            return Err(Error::Config(
                "auth.required is set but no API key is configured (set MCP_API_KEY or auth.api_key)"
                    .to_string(),
            ));
        }
        if self.header_name.trim().is_empty() {
            return Err(Error::Config("auth.header_name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Per-session transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Period of the SSE `ping` heartbeat
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// How long a POSTed request waits for the handler's response
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Events buffered per SSE stream before new ones are dropped
    pub sse_buffer_size: usize,
    /// Sessions with no open stream, no request in flight and no traffic
    /// for this long are closed and forgotten
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            sse_buffer_size: 256,
            session_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string ("30s", or "250ms" below a second)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" first, since it also ends in 's'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
