//! Shared DTOs for the REST endpoints and hub pushes.
//!
//! DESIGN
//! ======
//! Field names mirror the server's camelCase JSON so serde round-trips stay
//! lossless. `Delivery` is local bookkeeping for optimistic sends and never
//! crosses the wire.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;

/// Error `code` the server uses to mean "no error".
pub const SUCCESS_CODE: &str = "success";

/// A chat message as stored by the server and pushed by the hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message identifier. Temporary (`pending-…`) until confirmed.
    pub uuid: String,
    /// Conversation this message belongs to.
    #[serde(default)]
    pub conversation_uuid: String,
    /// Company or student that sent the message.
    pub sender_uuid: String,
    /// Text content, possibly carrying a job-invite block.
    pub content: String,
    /// ISO-8601 send time as produced by the server.
    pub send_at: String,
    /// Local delivery bookkeeping; always `Confirmed` for server data.
    #[serde(skip)]
    pub delivery: Delivery,
}

impl ChatMessage {
    /// Build a not-yet-confirmed message for an optimistic send.
    #[must_use]
    pub fn pending(
        correlation_id: Uuid,
        conversation_uuid: &str,
        sender_uuid: &str,
        content: &str,
        send_at: String,
    ) -> Self {
        Self {
            uuid: format!("pending-{correlation_id}"),
            conversation_uuid: conversation_uuid.to_owned(),
            sender_uuid: sender_uuid.to_owned(),
            content: content.to_owned(),
            send_at,
            delivery: Delivery::Pending { correlation_id },
        }
    }

    /// Correlation id of a local message that has not been confirmed.
    #[must_use]
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self.delivery {
            Delivery::Confirmed => None,
            Delivery::Pending { correlation_id } | Delivery::Failed { correlation_id } => Some(correlation_id),
        }
    }
}

/// Where a message stands relative to the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Came from the server (history, push or send response).
    #[default]
    Confirmed,
    /// Optimistically appended; REST send still in flight.
    Pending { correlation_id: Uuid },
    /// REST send failed; the local echo is kept.
    Failed { correlation_id: Uuid },
}

/// Body of `Chat/send-message`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    pub conversation_uuid: String,
    pub content: String,
    pub sender_uuid: String,
}

/// Body of `Conversation/create`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationParams {
    pub student_uuid: String,
    pub company_uuid: String,
}

/// Student summary embedded in a conversation listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
}

/// A company/student conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub uuid: String,
    #[serde(default)]
    pub student_uuid: String,
    #[serde(default)]
    pub company_uuid: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student: Option<StudentRef>,
}

impl Conversation {
    /// Label for listings: the student's name, else a short id.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.student {
            Some(student) if !student.name.is_empty() => student.name.clone(),
            _ => format!("Conversation #{}", short_id(&self.uuid)),
        }
    }
}

/// `{code, message}` error object returned by every endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// `{data, error}` response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    // Missing `Option` fields deserialize as `None`; a `default` attribute
    // here would force `T: Default`.
    pub data: Option<T>,
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiEnvelope<T> {
    /// Interpret the envelope: a non-`success` error code is a failure even
    /// when `data` is present; otherwise `data` must be present.
    pub fn into_result(self) -> Result<T, ChatError> {
        if let Some(error) = self.error {
            if !error.code.is_empty() && error.code != SUCCESS_CODE {
                return Err(ChatError::Api { code: error.code, message: error.message });
            }
        }
        self.data.ok_or(ChatError::MissingData)
    }
}

/// First eight characters of an identifier, for compact labels.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(index, _)| &id[..index])
}
