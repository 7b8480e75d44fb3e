//! Chat session: the context object that owns the hub, the caches and the
//! REST client for one signed-in company.
//!
//! SYSTEM CONTEXT
//! ==============
//! A front end creates one `ChatSession`, calls `start` once, opens a
//! [`ConversationView`] per conversation screen and calls `shutdown` when it
//! goes away. Views can only be obtained from a session, so every chat
//! operation runs against an explicit, live context.
//!
//! DESIGN
//! ======
//! Each conversation's history is fetched at most once per session. The
//! session owns that load: the first view to open a conversation starts it,
//! later views watch the same load, and the load is cancelled only when the
//! last watching view goes away before it finished. Applying a result,
//! cancelling and dropping a load all happen under the history lock, so a
//! load is either applied (and never fetched again) or discarded (and
//! fetched again by the next open).

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hub::ChatHub;
use super::view::ConversationView;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::net::api::{ChatApi, HttpChatApi};
use crate::net::hub_socket::{HubConnector, WsHubConnector};
use crate::state::messages::MessageStore;
use crate::state::rooms::RoomTracker;

/// Progress of a conversation's history load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HistoryState {
    Loading,
    Loaded,
    /// The fetch failed; the next open tries again.
    Failed(String),
}

enum HistoryEntry {
    Loading {
        id: u64,
        cancel: CancellationToken,
        watchers: usize,
        state: watch::Sender<HistoryState>,
    },
    Loaded,
}

#[derive(Default)]
struct Histories {
    next_id: u64,
    entries: HashMap<String, HistoryEntry>,
}

/// A view's interest in one history load.
pub(crate) struct HistoryWatch {
    /// The load this watch keeps alive; `None` when already loaded.
    pub(crate) load_id: Option<u64>,
    pub(crate) state: watch::Receiver<HistoryState>,
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    hub: ChatHub,
    api: Arc<dyn ChatApi>,
    sender_uuid: String,
    histories: Mutex<Histories>,
}

impl ChatSession {
    /// Session over the real websocket hub and HTTP API.
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let api = HttpChatApi::new(config)?;
        Self::with_parts(Arc::new(WsHubConnector::new(config)), Arc::new(api), config)
    }

    /// Session over caller-supplied transports.
    pub fn with_parts(
        connector: Arc<dyn HubConnector>,
        api: Arc<dyn ChatApi>,
        config: &ChatConfig,
    ) -> Result<Self, ChatError> {
        let sender_uuid = config
            .company_uuid
            .clone()
            .ok_or_else(|| ChatError::Config("a company uuid is required to chat".to_owned()))?;
        let hub = ChatHub::new(connector, config, MessageStore::new(), RoomTracker::new());
        Ok(Self {
            inner: Arc::new(SessionInner { hub, api, sender_uuid, histories: Mutex::default() }),
        })
    }

    /// Connect the hub. Failures are logged and visible in the hub status.
    pub async fn start(&self) {
        info!(sender = %self.inner.sender_uuid, "session: starting");
        if let Err(error) = self.inner.hub.connect().await {
            warn!(%error, retryable = error.retryable(), "session: initial connect failed");
        }
    }

    /// Disconnect the hub, cancel running history loads and forget which
    /// histories were loaded.
    pub async fn shutdown(&self) {
        self.inner.hub.disconnect().await;
        {
            let mut histories = self.histories();
            for entry in histories.entries.values() {
                if let HistoryEntry::Loading { cancel, .. } = entry {
                    cancel.cancel();
                }
            }
            histories.entries.clear();
        }
        info!(cached = self.store().conversations().len(), "session: shut down");
    }

    /// Open the screen for `conversation_id`, making it the active room.
    pub async fn open(&self, conversation_id: &str) -> ConversationView {
        ConversationView::open(self.clone(), conversation_id).await
    }

    #[must_use]
    pub fn hub(&self) -> &ChatHub {
        &self.inner.hub
    }

    #[must_use]
    pub fn store(&self) -> &MessageStore {
        self.inner.hub.store()
    }

    #[must_use]
    pub fn api(&self) -> &Arc<dyn ChatApi> {
        &self.inner.api
    }

    #[must_use]
    pub fn sender_uuid(&self) -> &str {
        &self.inner.sender_uuid
    }

    fn histories(&self) -> MutexGuard<'_, Histories> {
        self.inner.histories.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch the history load of `conversation_id`, starting it if none is
    /// running and it was not loaded yet.
    pub(crate) fn watch_history(&self, conversation_id: &str) -> HistoryWatch {
        let mut histories = self.histories();
        match histories.entries.get_mut(conversation_id) {
            Some(HistoryEntry::Loaded) => {
                let (_, state) = watch::channel(HistoryState::Loaded);
                return HistoryWatch { load_id: None, state };
            }
            Some(HistoryEntry::Loading { id, watchers, state, .. }) => {
                *watchers += 1;
                debug!(conversation = %conversation_id, load = *id, "session: joining history load");
                return HistoryWatch { load_id: Some(*id), state: state.subscribe() };
            }
            None => {}
        }

        histories.next_id += 1;
        let id = histories.next_id;
        let cancel = CancellationToken::new();
        let (state, receiver) = watch::channel(HistoryState::Loading);
        histories.entries.insert(
            conversation_id.to_owned(),
            HistoryEntry::Loading { id, cancel: cancel.clone(), watchers: 1, state },
        );
        drop(histories);

        tokio::spawn(load_history(self.clone(), conversation_id.to_owned(), id, cancel));
        HistoryWatch { load_id: Some(id), state: receiver }
    }

    /// Drop one watcher of load `load_id`. The last watcher of an unfinished
    /// load cancels it, so the next open fetches again.
    pub(crate) fn unwatch_history(&self, conversation_id: &str, load_id: u64) {
        let mut histories = self.histories();
        let abandoned = match histories.entries.get_mut(conversation_id) {
            Some(HistoryEntry::Loading { id, watchers, cancel, .. }) if *id == load_id => {
                *watchers = watchers.saturating_sub(1);
                if *watchers == 0 {
                    cancel.cancel();
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if abandoned {
            histories.entries.remove(conversation_id);
            debug!(conversation = %conversation_id, load = load_id, "session: history load abandoned");
        }
    }
}

async fn load_history(session: ChatSession, conversation: String, id: u64, cancel: CancellationToken) {
    debug!(%conversation, load = id, "session: fetching history");
    let result = tokio::select! {
        () = cancel.cancelled() => {
            debug!(%conversation, load = id, "session: history fetch cancelled");
            return;
        }
        result = session.api().fetch_messages(&conversation) => result,
    };

    let mut histories = session.histories();
    let state = match histories.entries.remove(&conversation) {
        Some(HistoryEntry::Loading { id: current, state, .. }) if current == id => state,
        Some(other) => {
            histories.entries.insert(conversation, other);
            return;
        }
        // Abandoned between the fetch finishing and the lock.
        None => return,
    };

    match result {
        Ok(messages) => {
            info!(%conversation, count = messages.len(), "session: history loaded");
            session.store().replace(&conversation, messages);
            histories.entries.insert(conversation, HistoryEntry::Loaded);
            state.send_replace(HistoryState::Loaded);
        }
        Err(error) => {
            warn!(%error, %conversation, "session: history fetch failed");
            state.send_replace(HistoryState::Failed(error.to_string()));
        }
    }
}
