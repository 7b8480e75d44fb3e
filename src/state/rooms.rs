//! The single conversation currently on screen.

#[cfg(test)]
#[path = "rooms_test.rs"]
mod rooms_test;

use std::sync::{Arc, Mutex, PoisonError};

/// Rooms affected by a change of the active conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomChange {
    pub left: Option<String>,
    pub joined: Option<String>,
}

impl RoomChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.left.is_none() && self.joined.is_none()
    }
}

/// Shared holder of the active conversation id.
#[derive(Clone, Debug, Default)]
pub struct RoomTracker {
    active: Arc<Mutex<Option<String>>>,
}

impl RoomTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `id` and report which rooms to leave and join. Setting the
    /// current value again reports no change.
    pub fn set_active(&self, id: Option<String>) -> RoomChange {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active == id {
            return RoomChange::default();
        }
        let left = std::mem::replace(&mut *active, id.clone());
        RoomChange { left, joined: id }
    }

    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Clear the active conversation only while it is still `id`.
    pub fn clear_if(&self, id: &str) -> RoomChange {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_deref() != Some(id) {
            return RoomChange::default();
        }
        RoomChange { left: active.take(), joined: None }
    }
}
