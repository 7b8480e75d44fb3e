//! Per-conversation screen controller.
//!
//! DESIGN
//! ======
//! Opening a view makes its conversation the active room and watches the
//! session's history load for it: the first open in a session starts the
//! fetch, later opens share it, and an already loaded conversation is ready
//! at once. Closing (or dropping) the view releases its interest; the last
//! view to leave an unfinished load cancels it.
//!
//! Sends are optimistic: a pending echo carrying a fresh correlation id is
//! appended at once, the hub broadcast is attempted, and the REST response
//! replaces the echo by correlation id. A failed REST send leaves the echo in
//! place, marked failed.

#[cfg(test)]
#[path = "view_test.rs"]
mod view_test;

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::render::{MessageBubble, StatusView, bubbles};
use super::session::{ChatSession, HistoryState, HistoryWatch};
use crate::error::ChatError;
use crate::net::api::now_iso;
use crate::net::types::{ChatMessage, SendMessageParams};

/// Loading phase of a conversation screen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewPhase {
    /// History fetch in flight.
    Loading,
    /// History applied, failed, or was already loaded earlier.
    Ready,
}

pub struct ConversationView {
    session: ChatSession,
    conversation_id: String,
    history: HistoryWatch,
    send_error: Mutex<Option<String>>,
    closed: bool,
}

impl ConversationView {
    pub(crate) async fn open(session: ChatSession, conversation_id: &str) -> Self {
        session.hub().set_active_conversation(Some(conversation_id.to_owned())).await;
        let history = session.watch_history(conversation_id);
        if history.load_id.is_none() {
            debug!(conversation = %conversation_id, "view: history already loaded");
        }
        Self {
            session,
            conversation_id: conversation_id.to_owned(),
            history,
            send_error: Mutex::new(None),
            closed: false,
        }
    }

    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Current message list of this conversation.
    #[must_use]
    pub fn messages(&self) -> Arc<Vec<ChatMessage>> {
        self.session.store().read(&self.conversation_id)
    }

    #[must_use]
    pub fn bubbles(&self) -> Vec<MessageBubble> {
        bubbles(&self.messages(), self.session.sender_uuid())
    }

    #[must_use]
    pub fn status(&self) -> StatusView {
        StatusView::from_status(&self.session.hub().status())
    }

    #[must_use]
    pub fn phase(&self) -> ViewPhase {
        match *self.history.state.borrow() {
            HistoryState::Loading => ViewPhase::Loading,
            HistoryState::Loaded | HistoryState::Failed(_) => ViewPhase::Ready,
        }
    }

    /// Last send failure (cleared by the next successful send), else the
    /// history failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        let send_error = self.send_error.lock().unwrap_or_else(PoisonError::into_inner).clone();
        send_error.or_else(|| match &*self.history.state.borrow() {
            HistoryState::Failed(error) => Some(error.clone()),
            HistoryState::Loading | HistoryState::Loaded => None,
        })
    }

    /// Wait until the history phase is over.
    pub async fn ready(&self) {
        let mut state = self.history.state.clone();
        // A load dropped by `shutdown` closes the channel; stop waiting then.
        let _ = state.wait_for(|state| *state != HistoryState::Loading).await;
    }

    /// Send `text` to the conversation and return the server's copy.
    ///
    /// # Errors
    ///
    /// [`ChatError::EmptyMessage`] for blank input, otherwise the REST
    /// failure; the local echo then stays in the list marked failed.
    pub async fn send(&self, text: &str) -> Result<ChatMessage, ChatError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let conversation = self.conversation_id.as_str();
        let sender = self.session.sender_uuid();
        let store = self.session.store();

        let correlation_id = Uuid::new_v4();
        store.append(
            conversation,
            ChatMessage::pending(correlation_id, conversation, sender, content, now_iso()),
        );
        self.session.hub().send(conversation, sender, content).await;

        let params = SendMessageParams {
            conversation_uuid: conversation.to_owned(),
            content: content.to_owned(),
            sender_uuid: sender.to_owned(),
        };
        match self.session.api().send_message(&params).await {
            Ok(confirmed) => {
                if store.contains(conversation, &confirmed.uuid) {
                    debug!(%conversation, uuid = %confirmed.uuid, "view: server copy already listed");
                }
                store.reconcile(conversation, correlation_id, confirmed.clone());
                self.set_error(None);
                info!(%conversation, uuid = %confirmed.uuid, "view: message sent");
                Ok(confirmed)
            }
            Err(error) => {
                warn!(%error, %conversation, %correlation_id, "view: send failed");
                store.mark_failed(conversation, correlation_id);
                self.set_error(Some(error.to_string()));
                Err(error)
            }
        }
    }

    /// Leave the screen: release the history load and clear the active room
    /// unless another view took it over.
    pub async fn close(mut self) {
        self.closed = true;
        self.session.hub().clear_active_conversation(&self.conversation_id).await;
        debug!(conversation = %self.conversation_id, "view: closed");
    }

    fn set_error(&self, error: Option<String>) {
        *self.send_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        if let Some(load_id) = self.history.load_id {
            self.session.unwatch_history(&self.conversation_id, load_id);
        }
        if self.closed {
            return;
        }
        // Not closed explicitly: clear the room in the background.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hub = self.session.hub().clone();
            let conversation_id = self.conversation_id.clone();
            runtime.spawn(async move { hub.clear_active_conversation(&conversation_id).await });
        }
    }
}
