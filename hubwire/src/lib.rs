//! Hub message model and JSON codec for the realtime chat transport.
//!
//! This crate owns the wire representation spoken with the chat hub: a JSON
//! handshake followed by JSON records, each terminated by the ASCII record
//! separator (`0x1E`). Payload arguments stay flexible (`serde_json::Value`);
//! typed decoding of message bodies happens in the client crate.
//!
//! Only the message kinds a client needs are modelled. Streaming kinds are
//! recognised and rejected with [`CodecError::Unsupported`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminator appended to every handshake and message record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub protocol name negotiated during the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Hub protocol version negotiated during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error returned by the decode functions.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The record is not valid JSON or does not match the message shape.
    #[error("failed to decode hub record: {0}")]
    Json(#[from] serde_json::Error),
    /// The record has no numeric `type` field.
    #[error("hub record is missing its `type` field")]
    MissingType,
    /// The `type` field does not map to a known [`MessageType`].
    #[error("unknown hub message type: {0}")]
    UnknownType(u64),
    /// The message type is valid but this client does not handle it.
    #[error("unsupported hub message type: {0}")]
    Unsupported(u64),
    /// The handshake response has no terminating record separator yet.
    #[error("handshake response is incomplete")]
    IncompleteHandshake,
}

/// Numeric message kinds defined by the hub protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Method call, client to server or server to client.
    Invocation,
    /// One item of a streaming result.
    StreamItem,
    /// Terminal result of an invocation.
    Completion,
    /// Call that produces a stream.
    StreamInvocation,
    /// Cancellation of a stream.
    CancelInvocation,
    /// Keep-alive.
    Ping,
    /// Server-initiated close.
    Close,
}

impl MessageType {
    /// Wire value of this message type.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Invocation => 1,
            Self::StreamItem => 2,
            Self::Completion => 3,
            Self::StreamInvocation => 4,
            Self::CancelInvocation => 5,
            Self::Ping => 6,
            Self::Close => 7,
        }
    }

    fn from_u64(value: u64) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Invocation),
            2 => Ok(Self::StreamItem),
            3 => Ok(Self::Completion),
            4 => Ok(Self::StreamInvocation),
            5 => Ok(Self::CancelInvocation),
            6 => Ok(Self::Ping),
            7 => Ok(Self::Close),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// A method call. Server pushes arrive as invocations without an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// Correlation id; present when the caller expects a [`Completion`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    /// Hub method name, e.g. `"JoinConversation"`.
    pub target: String,
    /// Positional arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl Invocation {
    /// Build a non-blocking invocation (no completion expected).
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self { invocation_id: None, target: target.into(), arguments }
    }

    /// Attach a correlation id so the server answers with a completion.
    #[must_use]
    pub fn with_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }
}

/// Terminal result of an invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    /// Id of the invocation being completed.
    pub invocation_id: String,
    /// Return value, when the hub method returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text, when the hub method failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server-initiated close.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Close {
    /// Reason the server closed the connection, if abnormal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the client may reconnect automatically.
    #[serde(default)]
    pub allow_reconnect: bool,
}

/// One decoded hub record.
#[derive(Clone, Debug, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    Completion(Completion),
    Ping,
    Close(Close),
}

impl HubMessage {
    /// Wire kind of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation(_) => MessageType::Invocation,
            Self::Completion(_) => MessageType::Completion,
            Self::Ping => MessageType::Ping,
            Self::Close(_) => MessageType::Close,
        }
    }
}

/// Handshake sent by the client right after the socket opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    /// Handshake for the JSON protocol, the only one this crate speaks.
    #[must_use]
    pub fn json() -> Self {
        Self { protocol: PROTOCOL_NAME.to_owned(), version: PROTOCOL_VERSION }
    }
}

/// Handshake answer from the server. An empty object means accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u32>,
}

#[derive(Serialize)]
struct Tagged<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct Empty {}

/// Encode the handshake request as a terminated record.
#[must_use]
pub fn encode_handshake(request: &HandshakeRequest) -> String {
    terminate(serde_json::to_string(request).unwrap_or_default())
}

/// Split a handshake response off the front of a text frame.
///
/// Returns the parsed response and whatever records followed it in the same
/// frame (the server may batch its first messages behind the handshake).
///
/// # Errors
///
/// Returns [`CodecError::IncompleteHandshake`] when no separator is present
/// and [`CodecError::Json`] when the response is not valid JSON.
pub fn decode_handshake(text: &str) -> Result<(HandshakeResponse, &str), CodecError> {
    let Some(index) = text.find(RECORD_SEPARATOR) else {
        return Err(CodecError::IncompleteHandshake);
    };
    let response = serde_json::from_str::<HandshakeResponse>(&text[..index])?;
    Ok((response, &text[index + RECORD_SEPARATOR.len_utf8()..]))
}

/// Encode a message as a terminated record.
#[must_use]
pub fn encode_message(message: &HubMessage) -> String {
    let kind = message.message_type().as_u64();
    // Serializing these derive-only structs into a String cannot fail; the
    // only serde_json errors are map keys that are not strings.
    let json = match message {
        HubMessage::Invocation(body) => serde_json::to_string(&Tagged { kind, body }),
        HubMessage::Completion(body) => serde_json::to_string(&Tagged { kind, body }),
        HubMessage::Ping => serde_json::to_string(&Tagged { kind, body: &Empty {} }),
        HubMessage::Close(body) => serde_json::to_string(&Tagged { kind, body }),
    };
    terminate(json.unwrap_or_default())
}

/// Decode a single record (without its separator).
///
/// # Errors
///
/// Returns [`CodecError::MissingType`], [`CodecError::UnknownType`] or
/// [`CodecError::Unsupported`] for records this client cannot use, and
/// [`CodecError::Json`] for malformed bodies.
pub fn decode_message(record: &str) -> Result<HubMessage, CodecError> {
    let value = serde_json::from_str::<Value>(record)?;
    let kind = value.get("type").and_then(Value::as_u64).ok_or(CodecError::MissingType)?;

    match MessageType::from_u64(kind)? {
        MessageType::Invocation => Ok(HubMessage::Invocation(serde_json::from_value(value)?)),
        MessageType::Completion => Ok(HubMessage::Completion(serde_json::from_value(value)?)),
        MessageType::Ping => Ok(HubMessage::Ping),
        MessageType::Close => Ok(HubMessage::Close(serde_json::from_value(value)?)),
        MessageType::StreamItem | MessageType::StreamInvocation | MessageType::CancelInvocation => {
            Err(CodecError::Unsupported(kind))
        }
    }
}

/// Iterate the non-empty records of a text frame.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|record| !record.trim().is_empty())
}

/// Decode every record of a text frame, keeping per-record failures.
pub fn decode_frame_text(text: &str) -> Vec<Result<HubMessage, CodecError>> {
    split_records(text).map(decode_message).collect()
}

fn terminate(mut json: String) -> String {
    json.push(RECORD_SEPARATOR);
    json
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
