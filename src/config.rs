//! Runtime configuration parsed from environment variables.
//!
//! Every tunable has a default so a bare environment yields a working
//! client; `CANVAS_ORIGIN` is the only value that is validated.

use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.ideamingle.com";
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:3000";
pub const DEFAULT_KEEPALIVE_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_AUTOSAVE_THROTTLE_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid origin `{0}`: expected http://host or https://host")]
    InvalidOrigin(String),
}

/// Page origin the WS endpoint is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// `true` for `https` pages, which connect over `wss`.
    pub secure: bool,
    /// Host with optional port, e.g. `"app.example.com:8443"`.
    pub host: String,
}

impl Origin {
    /// Parse an `http(s)://host[:port]` origin; any path is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOrigin`] for other schemes or an empty host.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (secure, rest) = if let Some(rest) = raw.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(ConfigError::InvalidOrigin(raw.to_owned()));
        };

        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(ConfigError::InvalidOrigin(raw.to_owned()));
        }
        Ok(Self { secure, host: host.to_owned() })
    }

    /// WebSocket URL for one canvas: `{ws|wss}://{host}/ws/canvas/{id}`.
    #[must_use]
    pub fn canvas_ws_url(&self, canvas_id: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}/ws/canvas/{}", self.host, urlencoding::encode(canvas_id))
    }
}

/// Connection tunables: keepalive and reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub keepalive_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            keepalive_interval: Duration::from_millis(env_parse("CANVAS_KEEPALIVE_MS", DEFAULT_KEEPALIVE_MS)),
            backoff_base: Duration::from_millis(env_parse("CANVAS_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS)),
            backoff_max: Duration::from_millis(env_parse("CANVAS_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)),
            max_reconnect_attempts: env_parse("CANVAS_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

/// Section sync tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Minimum spacing between history autosaves for one section.
    pub autosave_throttle: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { autosave_throttle: Duration::from_millis(DEFAULT_AUTOSAVE_THROTTLE_MS) }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            autosave_throttle: Duration::from_millis(env_parse(
                "CANVAS_AUTOSAVE_THROTTLE_MS",
                DEFAULT_AUTOSAVE_THROTTLE_MS,
            )),
        }
    }
}

/// Everything a client process needs, loaded in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub origin: Origin,
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
}

impl ClientConfig {
    /// Build typed client config from environment variables.
    ///
    /// Optional:
    /// - `CANVAS_API_BASE_URL`: default `https://api.ideamingle.com`
    /// - `CANVAS_ORIGIN`: default `http://127.0.0.1:3000`
    /// - `CANVAS_KEEPALIVE_MS`, `CANVAS_BACKOFF_BASE_MS`, `CANVAS_BACKOFF_MAX_MS`,
    ///   `CANVAS_MAX_RECONNECT_ATTEMPTS`, `CANVAS_AUTOSAVE_THROTTLE_MS`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOrigin`] when `CANVAS_ORIGIN` is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base_url = std::env::var("CANVAS_API_BASE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned());
        let origin = std::env::var("CANVAS_ORIGIN").unwrap_or_else(|_| DEFAULT_ORIGIN.to_owned());

        Ok(Self {
            api_base_url,
            origin: Origin::parse(&origin)?,
            connection: ConnectionConfig::from_env(),
            sync: SyncConfig::from_env(),
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
