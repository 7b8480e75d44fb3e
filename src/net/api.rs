//! REST client for the chat-related backend endpoints.
//!
//! SYSTEM CONTEXT
//! ==============
//! The backend exposes POST-only JSON endpoints under `{base}/Chat/…` and
//! `{base}/Conversation/…`, each answering with a `{data, error}` envelope.
//! The chat layer depends on the [`ChatApi`] trait so views can be driven by
//! fakes in tests.
//!
//! ERROR HANDLING
//! ==============
//! Transport errors, non-2xx statuses and envelope errors all become
//! [`ChatError`]; callers decide whether to surface or log them.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use super::types::{ApiEnvelope, ChatMessage, Conversation, CreateConversationParams, SendMessageParams};
use crate::config::ChatConfig;
use crate::error::ChatError;

pub const GET_MESSAGES_PATH: &str = "Chat/get-messages";
pub const SEND_MESSAGE_PATH: &str = "Chat/send-message";
pub const LIST_CONVERSATIONS_PATH: &str = "Conversation/list-by-company";
pub const CREATE_CONVERSATION_PATH: &str = "Conversation/create";

/// The REST operations the chat layer consumes.
#[async_trait::async_trait]
pub trait ChatApi: Send + Sync {
    /// Fetch the full message history of a conversation, oldest first.
    async fn fetch_messages(&self, conversation_uuid: &str) -> Result<Vec<ChatMessage>, ChatError>;

    /// Persist a message and return the server's authoritative copy.
    async fn send_message(&self, params: &SendMessageParams) -> Result<ChatMessage, ChatError>;

    /// List the conversations a company takes part in.
    async fn list_conversations(&self, company_uuid: &str) -> Result<Vec<Conversation>, ChatError>;

    /// Open (or fetch the existing) conversation between a student and a company.
    async fn create_conversation(&self, params: &CreateConversationParams) -> Result<Conversation, ChatError>;
}

/// `reqwest`-backed [`ChatApi`].
#[derive(Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    key_cert: Option<String>,
}

impl HttpChatApi {
    /// Build the client with the configured timeout and bearer token.
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ChatError::Config(format!("invalid access token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeouts.request)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            key_cert: config.key_cert.clone(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ChatError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = endpoint(&self.base_url, path);
        let body = stamp_body(serde_json::to_value(body)?, &now_iso(), self.key_cert.as_deref());
        debug!(%url, "api: POST");

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            // Error statuses usually still carry the envelope; prefer its message.
            if let Ok(envelope) = serde_json::from_str::<ApiEnvelope<Value>>(&text) {
                if let Err(err @ ChatError::Api { .. }) = envelope.into_result() {
                    warn!(%url, status = status.as_u16(), error = %err, "api: request rejected");
                    return Err(err);
                }
            }
            warn!(%url, status = status.as_u16(), "api: request failed");
            return Err(ChatError::HttpStatus { status: status.as_u16(), body: text });
        }

        serde_json::from_str::<ApiEnvelope<T>>(&text)?.into_result()
    }
}

#[async_trait::async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_messages(&self, conversation_uuid: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let body = serde_json::json!({ "conversationUuid": conversation_uuid });
        self.post(GET_MESSAGES_PATH, &body).await
    }

    async fn send_message(&self, params: &SendMessageParams) -> Result<ChatMessage, ChatError> {
        self.post(SEND_MESSAGE_PATH, params).await
    }

    async fn list_conversations(&self, company_uuid: &str) -> Result<Vec<Conversation>, ChatError> {
        let body = serde_json::json!({ "companyUuid": company_uuid });
        self.post(LIST_CONVERSATIONS_PATH, &body).await
    }

    async fn create_conversation(&self, params: &CreateConversationParams) -> Result<Conversation, ChatError> {
        self.post(CREATE_CONVERSATION_PATH, params).await
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Add the `time` and `keyCert` request stamps the backend expects.
fn stamp_body(body: Value, time: &str, key_cert: Option<&str>) -> Value {
    let mut map = match body {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    map.insert("time".to_owned(), Value::String(time.to_owned()));
    if let Some(key_cert) = key_cert {
        map.insert("keyCert".to_owned(), Value::String(key_cert.to_owned()));
    }
    Value::Object(map)
}

/// Current UTC time as RFC 3339 text.
pub(crate) fn now_iso() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
