//! In-memory message lists keyed by conversation id.
//!
//! DESIGN
//! ======
//! Each list is stored behind an `Arc` so `read` hands out cheap snapshots.
//! A snapshot stays pointer-equal until its list is mutated; a mutation
//! installs a fresh `Arc`, so readers holding the old snapshot keep it
//! untouched. Every mutation bumps a store-wide revision and is announced on
//! a broadcast channel.

#[cfg(test)]
#[path = "messages_test.rs"]
mod messages_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::net::types::{ChatMessage, Delivery};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Notification that one conversation's list changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub conversation_id: String,
    pub revision: u64,
}

#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    lists: RwLock<HashMap<String, Arc<Vec<ChatMessage>>>>,
    empty: Arc<Vec<ChatMessage>>,
    revision: AtomicU64,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

impl MessageStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                lists: RwLock::new(HashMap::new()),
                empty: Arc::new(Vec::new()),
                revision: AtomicU64::new(0),
                changes,
            }),
        }
    }

    /// Replace the whole list for `conversation_id`; other keys are untouched.
    pub fn replace(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        {
            let mut lists = self.inner.lists.write().unwrap_or_else(PoisonError::into_inner);
            lists.insert(conversation_id.to_owned(), Arc::new(messages));
        }
        self.notify(conversation_id);
    }

    /// Append one message to the end of the list.
    pub fn append(&self, conversation_id: &str, message: ChatMessage) {
        self.mutate(conversation_id, |list| {
            list.push(message);
            true
        });
    }

    /// Append unless a message with the same uuid is already listed.
    pub fn append_if_absent(&self, conversation_id: &str, message: ChatMessage) -> bool {
        self.mutate(conversation_id, |list| {
            if list.iter().any(|m| m.uuid == message.uuid) {
                return false;
            }
            list.push(message);
            true
        })
    }

    /// Snapshot of the list; absent keys share one empty list.
    #[must_use]
    pub fn read(&self, conversation_id: &str) -> Arc<Vec<ChatMessage>> {
        let lists = self.inner.lists.read().unwrap_or_else(PoisonError::into_inner);
        lists
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| self.inner.empty.clone())
    }

    /// Swap the local echo carrying `correlation_id` for the server's copy.
    ///
    /// The echo is removed and `authoritative` appended, unless a message with
    /// its uuid is already present (a push may have delivered it first).
    /// Returns whether the echo was found.
    pub fn reconcile(&self, conversation_id: &str, correlation_id: Uuid, authoritative: ChatMessage) -> bool {
        let mut found = false;
        self.mutate(conversation_id, |list| {
            let before = list.len();
            list.retain(|m| m.correlation_id() != Some(correlation_id));
            found = list.len() != before;
            if !list.iter().any(|m| m.uuid == authoritative.uuid) {
                list.push(authoritative);
            }
            true
        });
        found
    }

    /// Flag the pending echo carrying `correlation_id` as failed.
    pub fn mark_failed(&self, conversation_id: &str, correlation_id: Uuid) -> bool {
        self.mutate(conversation_id, |list| {
            let Some(entry) = list
                .iter_mut()
                .find(|m| m.delivery == Delivery::Pending { correlation_id })
            else {
                return false;
            };
            entry.delivery = Delivery::Failed { correlation_id };
            true
        })
    }

    #[must_use]
    pub fn contains(&self, conversation_id: &str, uuid: &str) -> bool {
        self.read(conversation_id).iter().any(|m| m.uuid == uuid)
    }

    /// Conversation ids with a stored list, sorted.
    #[must_use]
    pub fn conversations(&self) -> Vec<String> {
        let lists = self.inner.lists.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = lists.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    fn mutate<F>(&self, conversation_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Vec<ChatMessage>) -> bool,
    {
        let changed = {
            let mut lists = self.inner.lists.write().unwrap_or_else(PoisonError::into_inner);
            // No-op mutations leave the current snapshot in place.
            let mut draft = lists.get(conversation_id).map(|list| (**list).clone()).unwrap_or_default();
            let changed = apply(&mut draft);
            if changed {
                lists.insert(conversation_id.to_owned(), Arc::new(draft));
            }
            changed
        };
        if changed {
            self.notify(conversation_id);
        }
        changed
    }

    fn notify(&self, conversation_id: &str) {
        let revision = self.inner.revision.fetch_add(1, Ordering::AcqRel) + 1;
        // No subscribers is fine.
        let _ = self.inner.changes.send(StoreChange { conversation_id: conversation_id.to_owned(), revision });
    }
}
