//! Error taxonomy for the chat layer.
//!
//! ERROR HANDLING
//! ==============
//! Only `ChatHub::connect` and the REST-backed view operations hand errors
//! back to callers. Hub send, rejoin, leave and teardown failures are logged
//! where they happen and never escape as `Err`.

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;

/// Errors raised by the chat transport, REST client and configuration.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("hub connect failed: {0}")]
    Connect(String),
    #[error("hub handshake rejected: {0}")]
    Handshake(String),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("hub connection is not established")]
    NotConnected,
    #[error("hub connection closed")]
    Closed,
    #[error("hub invocation {target} failed: {message}")]
    Invocation { target: String, message: String },
    #[error("hub wire error: {0}")]
    Wire(#[from] hubwire::CodecError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("api returned {code}: {message}")]
    Api { code: String, message: String },
    #[error("api response is missing `data`")]
    MissingData,
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is empty")]
    EmptyMessage,
}

impl ChatError {
    /// Whether retrying the same operation later can succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Timeout(_) | Self::NotConnected | Self::Closed | Self::Http(_)
        )
    }
}
