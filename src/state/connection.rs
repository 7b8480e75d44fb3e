//! Hub connection lifecycle state and the reconnect schedule.
//!
//! SYSTEM CONTEXT
//! ==============
//! `ChatHub` publishes a [`ConnectionStatus`] snapshot on every transition;
//! views read it to pick the status banner and gate the input box.

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;

use std::time::Duration;

use crate::config::{DEFAULT_RECONNECT_DELAYS_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS};

/// Lifecycle of the hub connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link; either never connected or closed without a reconnect.
    #[default]
    Disconnected,
    /// `connect` is opening the link.
    Connecting,
    /// Handshake done; sends and joins are allowed.
    Connected,
    /// The link dropped and the retry schedule is running.
    Reconnecting,
    /// Retry schedule exhausted; only a manual reconnect leaves this state.
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Snapshot published on every state transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Human-readable reason for the last failure, cleared on success.
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    #[must_use]
    pub fn new(state: ConnectionState, last_error: Option<String>) -> Self {
        Self { state, last_error }
    }
}

/// Delay schedule for automatic reconnects, capped by an attempt count.
///
/// Attempt `n` waits `delays[n]`; past the end of the schedule the last delay
/// repeats until `max_attempts` attempts have been made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        let delays = if delays.is_empty() { vec![Duration::ZERO] } else { delays };
        Self { delays, max_attempts }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt` (zero-based), or `None` once the cap is reached.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let index = usize::try_from(attempt).unwrap_or(usize::MAX).min(self.delays.len() - 1);
        self.delays.get(index).copied()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_RECONNECT_DELAYS_MS.iter().copied().map(Duration::from_millis).collect(),
            DEFAULT_RECONNECT_MAX_ATTEMPTS,
        )
    }
}
