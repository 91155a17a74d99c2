//! Client configuration loaded from environment variables.
//!
//! All settings come from environment variables (or a `.env` file via
//! `dotenvy`). The server URL and access token are supplied by whatever
//! credential source the caller uses; this module only reads them.

use std::time::Duration;

use url::Url;

use crate::ws::connection::ConnectionOptions;
use crate::ws::subscription::DEFAULT_QUEUE_CAPACITY;

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `HASS_TOKEN` is not set.
    #[error("HASS_TOKEN is not set")]
    MissingToken,

    /// The server URL could not be parsed.
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl {
        /// The offending value.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Top-level client configuration.
///
/// Loaded once at startup via [`ClientConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the server (e.g. `http://localhost:8123`).
    pub server: String,

    /// Long-lived access token.
    pub token: String,

    /// Default per-request timeout.
    pub request_timeout: Duration,

    /// Timeout for each read during the authentication handshake.
    pub handshake_timeout: Duration,

    /// Timeout for the confirmation of a subscribe command.
    pub subscribe_timeout: Duration,

    /// Overall timeout for an aggregation command.
    pub aggregate_timeout: Duration,

    /// Consecutive read/decode errors tolerated before the dispatch loop gives up.
    pub max_read_errors: u32,

    /// Capacity of the per-aggregation event queue.
    pub event_queue_capacity: usize,

    /// Events buffered per subscription while its callback is busy.
    pub subscription_queue_capacity: usize,
}

impl ClientConfig {
    /// Builds a configuration for `server` and `token` with default timeouts.
    #[must_use]
    pub fn new(server: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: token.into(),
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            aggregate_timeout: Duration::from_secs(30),
            max_read_errors: 5,
            event_queue_capacity: 256,
            subscription_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults for everything except the token.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingToken`] if `HASS_TOKEN` is unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let server =
            std::env::var("HASS_SERVER").unwrap_or_else(|_| "http://localhost:8123".to_string());
        let token = std::env::var("HASS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let defaults = Self::new(server, token);
        Ok(Self {
            request_timeout: parse_env_secs("HASS_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            handshake_timeout: parse_env_secs(
                "HASS_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout,
            ),
            subscribe_timeout: parse_env_secs(
                "HASS_SUBSCRIBE_TIMEOUT_SECS",
                defaults.subscribe_timeout,
            ),
            aggregate_timeout: parse_env_secs(
                "HASS_AGGREGATE_TIMEOUT_SECS",
                defaults.aggregate_timeout,
            ),
            max_read_errors: parse_env("HASS_MAX_READ_ERRORS", defaults.max_read_errors),
            event_queue_capacity: parse_env(
                "HASS_EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            ),
            subscription_queue_capacity: parse_env(
                "HASS_SUBSCRIPTION_QUEUE_CAPACITY",
                defaults.subscription_queue_capacity,
            ),
            ..defaults
        })
    }

    /// Derives the websocket endpoint from [`ClientConfig::server`].
    ///
    /// `http` becomes `ws`, `https` becomes `wss`, and the path is set to
    /// `/api/websocket`. URLs that already use `ws`/`wss` are returned as-is.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if the server URL does not parse
    /// or uses an unsupported scheme.
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.server.clone(),
            reason,
        };
        let mut url = Url::parse(&self.server).map_err(|e| invalid(e.to_string()))?;

        let scheme = match url.scheme() {
            "ws" | "wss" => return Ok(url.to_string()),
            "http" => "ws",
            "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other:?}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| invalid("cannot change scheme".to_string()))?;

        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/api/websocket"));
        Ok(url.to_string())
    }

    /// Returns the dispatch/handshake options derived from this configuration.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            handshake_timeout: self.handshake_timeout,
            max_consecutive_errors: self.max_read_errors,
            subscription_queue_capacity: self.subscription_queue_capacity,
        }
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable holding whole seconds.
fn parse_env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_env(key, default.as_secs()))
}
