//! Chat configuration parsed from environment variables.

use std::time::Duration;

use crate::error::ChatError;
use crate::state::connection::RetryPolicy;

pub const DEFAULT_HUB_URL: &str = "http://localhost:5109/chatHub";
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5109/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RECONNECT_DELAYS_MS: [u64; 6] = [0, 2_000, 5_000, 10_000, 15_000, 30_000];
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTimeouts {
    /// Fixed per-request timeout of the REST client.
    pub request: Duration,
    /// Upper bound on opening a hub connection, handshake included.
    pub connect: Duration,
    /// Interval between keep-alive pings sent to the hub.
    pub keepalive: Duration,
    /// Inbound silence after which the hub link is considered lost.
    pub server: Duration,
}

impl Default for ChatTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            server: Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub hub_url: String,
    pub api_base_url: String,
    pub access_token: Option<String>,
    pub key_cert: Option<String>,
    /// Company identifier used as the sender of outgoing messages.
    pub company_uuid: Option<String>,
    pub timeouts: ChatTimeouts,
    pub retry: RetryPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_HUB_URL.to_owned(),
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            access_token: None,
            key_cert: None,
            company_uuid: None,
            timeouts: ChatTimeouts::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ChatConfig {
    /// Build typed chat config from environment variables.
    ///
    /// Optional:
    /// - `CHAT_HUB_URL`: hub address, `http(s)://` or `ws(s)://`
    /// - `CHAT_API_BASE_URL`: REST base URL (trailing `/` trimmed)
    /// - `CHAT_ACCESS_TOKEN`, `CHAT_KEY_CERT`, `CHAT_COMPANY_UUID`
    /// - `CHAT_REQUEST_TIMEOUT_SECS` (5), `CHAT_CONNECT_TIMEOUT_SECS` (15),
    ///   `CHAT_KEEPALIVE_SECS` (15), `CHAT_SERVER_TIMEOUT_SECS` (30)
    /// - `CHAT_RECONNECT_DELAYS_MS`: comma-separated schedule
    /// - `CHAT_RECONNECT_MAX_ATTEMPTS` (10)
    pub fn from_env() -> Result<Self, ChatError> {
        let hub_url = std::env::var("CHAT_HUB_URL").unwrap_or_else(|_| DEFAULT_HUB_URL.to_owned());
        let api_base_url = std::env::var("CHAT_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();

        let timeouts = ChatTimeouts {
            request: Duration::from_secs(env_parse("CHAT_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)),
            connect: Duration::from_secs(env_parse("CHAT_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)),
            keepalive: Duration::from_secs(env_parse("CHAT_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS)),
            server: Duration::from_secs(env_parse("CHAT_SERVER_TIMEOUT_SECS", DEFAULT_SERVER_TIMEOUT_SECS)),
        };
        if timeouts.keepalive >= timeouts.server {
            return Err(ChatError::Config(format!(
                "keep-alive interval ({}s) must be shorter than the server timeout ({}s)",
                timeouts.keepalive.as_secs(),
                timeouts.server.as_secs()
            )));
        }

        let delays = match std::env::var("CHAT_RECONNECT_DELAYS_MS") {
            Ok(raw) => parse_delays(&raw)?,
            Err(_) => DEFAULT_RECONNECT_DELAYS_MS.iter().copied().map(Duration::from_millis).collect(),
        };
        let retry = RetryPolicy::new(delays, env_parse("CHAT_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS));

        Ok(Self {
            hub_url,
            api_base_url,
            access_token: env_non_empty("CHAT_ACCESS_TOKEN"),
            key_cert: env_non_empty("CHAT_KEY_CERT"),
            company_uuid: env_non_empty("CHAT_COMPANY_UUID"),
            timeouts,
            retry,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a comma-separated millisecond schedule such as `0,2000,5000`.
pub(crate) fn parse_delays(raw: &str) -> Result<Vec<Duration>, ChatError> {
    let delays = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ChatError::Config(format!("invalid reconnect delay '{part}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if delays.is_empty() {
        return Err(ChatError::Config("reconnect delay schedule is empty".to_owned()));
    }
    Ok(delays)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
