//! Connection manager for the realtime chat hub.
//!
//! DESIGN
//! ======
//! `ChatHub` owns at most one live hub link. The link slot carries a
//! generation counter: `connect` and `disconnect` bump it, and every task
//! spawned for an older generation (inbound pump, retry loop) stops touching
//! state once it notices. Status transitions are published through a
//! `watch` channel while holding the slot lock, so a stale task can never
//! overwrite the status of a newer link.
//!
//! Room changes and the join that follows an install are serialized on an
//! async room lock, so a room switch racing a (re)connect is announced either
//! entirely before the install (and joined by it) or entirely after.
//!
//! When a link drops with a reconnect allowance the pump runs the retry
//! schedule itself; success installs a fresh link under the same generation
//! and re-joins the active room once. Exhausting the schedule lands in
//! `ConnectionState::Failed`, which only `reconnect` leaves.
//!
//! ERROR HANDLING
//! ==============
//! `connect`/`reconnect` return the establishment error and also record it in
//! the status. Sends, joins, leaves and teardown are best-effort: failures
//! are logged here and never reach callers.

#[cfg(test)]
#[path = "hub_test.rs"]
mod hub_test;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::net::hub_socket::{HubConnector, HubEvent, HubHandle, HubSession};
use crate::net::types::ChatMessage;
use crate::state::connection::{ConnectionState, ConnectionStatus, RetryPolicy};
use crate::state::messages::MessageStore;
use crate::state::rooms::{RoomChange, RoomTracker};

/// Server push carrying a new message.
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
pub const JOIN_CONVERSATION: &str = "JoinConversation";
pub const LEAVE_CONVERSATION: &str = "LeaveConversation";
pub const SEND_MESSAGE_TO_CONVERSATION: &str = "SendMessageToConversation";

#[derive(Clone)]
pub struct ChatHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    connector: Arc<dyn HubConnector>,
    hub_url: String,
    retry: RetryPolicy,
    connect_timeout: Duration,
    store: MessageStore,
    rooms: RoomTracker,
    /// Own sender id; pushes from it are skipped since REST already confirmed them.
    self_sender: Option<String>,
    status: watch::Sender<ConnectionStatus>,
    slot: Mutex<LinkSlot>,
    /// Held while the active room changes or an install joins it.
    room_lock: AsyncMutex<()>,
}

#[derive(Default)]
struct LinkSlot {
    generation: u64,
    handle: Option<Arc<dyn HubHandle>>,
    pump: Option<JoinHandle<()>>,
}

impl ChatHub {
    #[must_use]
    pub fn new(connector: Arc<dyn HubConnector>, config: &ChatConfig, store: MessageStore, rooms: RoomTracker) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(HubInner {
                connector,
                hub_url: config.hub_url.clone(),
                retry: config.retry.clone(),
                connect_timeout: config.timeouts.connect,
                store,
                rooms,
                self_sender: config.company_uuid.clone(),
                status,
                slot: Mutex::new(LinkSlot::default()),
                room_lock: AsyncMutex::new(()),
            }),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Replace any existing link with a fresh one.
    ///
    /// On success the active room, if any, is joined exactly once. On failure
    /// the status becomes `Disconnected` with a `Failed to connect: …` error.
    pub async fn connect(&self) -> Result<(), ChatError> {
        let generation = self.retire_link().await;
        self.publish_if_current(generation, ConnectionState::Connecting, None);
        info!(hub = %self.inner.hub_url, generation, "hub: connecting");

        match self.open_link().await {
            Ok(session) => {
                if !self.install(generation, session).await {
                    return Err(ChatError::Closed);
                }
                info!(generation, "hub: connected");
                Ok(())
            }
            Err(error) => {
                warn!(%error, generation, "hub: connect failed");
                self.publish_if_current(
                    generation,
                    ConnectionState::Disconnected,
                    Some(format!("Failed to connect: {error}")),
                );
                Err(error)
            }
        }
    }

    /// Manual escape hatch, e.g. from `Failed`. Same as [`ChatHub::connect`].
    pub async fn reconnect(&self) -> Result<(), ChatError> {
        info!("hub: manual reconnect");
        self.connect().await
    }

    /// Stop the link if there is one. Always ends `Disconnected`.
    pub async fn disconnect(&self) {
        let generation = self.retire_link().await;
        self.publish_if_current(generation, ConnectionState::Disconnected, None);
        info!(generation, "hub: disconnected");
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomTracker {
        &self.inner.rooms
    }

    // =========================================================================
    // ROOMS & SENDS
    // =========================================================================

    /// Make `conversation_id` the active room, leaving the previous one.
    ///
    /// Joins and leaves are only announced while connected; a later
    /// (re)connect joins whatever is active at that point.
    pub async fn set_active_conversation(&self, conversation_id: Option<String>) {
        let _rooms = self.inner.room_lock.lock().await;
        let change = self.inner.rooms.set_active(conversation_id);
        self.announce(change).await;
    }

    /// Clear the active room only if it is still `conversation_id`.
    pub async fn clear_active_conversation(&self, conversation_id: &str) {
        let _rooms = self.inner.room_lock.lock().await;
        let change = self.inner.rooms.clear_if(conversation_id);
        self.announce(change).await;
    }

    /// Broadcast a message to the room. Best-effort: skipped when not
    /// connected, failures are logged.
    pub async fn send(&self, conversation_id: &str, sender_id: &str, text: &str) {
        let Some(handle) = self.connected_handle() else {
            debug!(conversation = %conversation_id, "hub: send skipped, not connected");
            return;
        };
        let arguments = vec![
            Value::String(conversation_id.to_owned()),
            Value::String(sender_id.to_owned()),
            Value::String(text.to_owned()),
        ];
        match handle.invoke(SEND_MESSAGE_TO_CONVERSATION, arguments).await {
            Ok(_) => debug!(conversation = %conversation_id, "hub: message broadcast"),
            Err(error) => warn!(%error, conversation = %conversation_id, "hub: broadcast failed"),
        }
    }

    /// Caller holds the room lock.
    async fn announce(&self, change: RoomChange) {
        if change.is_empty() {
            return;
        }
        let Some(handle) = self.connected_handle() else {
            debug!(?change, "hub: room change deferred until connected");
            return;
        };
        if let Some(left) = change.left {
            invoke_logged(handle.as_ref(), LEAVE_CONVERSATION, &left).await;
        }
        if let Some(joined) = change.joined {
            invoke_logged(handle.as_ref(), JOIN_CONVERSATION, &joined).await;
        }
    }

    async fn join_active_room(&self, handle: &Arc<dyn HubHandle>) {
        if let Some(room) = self.inner.rooms.current() {
            invoke_logged(handle.as_ref(), JOIN_CONVERSATION, &room).await;
        }
    }

    // =========================================================================
    // LINK SLOT
    // =========================================================================

    fn slot(&self) -> MutexGuard<'_, LinkSlot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_locked(&self, state: ConnectionState, last_error: Option<String>) {
        self.inner.status.send_replace(ConnectionStatus::new(state, last_error));
    }

    fn publish_if_current(&self, generation: u64, state: ConnectionState, last_error: Option<String>) -> bool {
        let slot = self.slot();
        if slot.generation != generation {
            return false;
        }
        self.publish_locked(state, last_error);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.slot().generation == generation
    }

    fn connected_handle(&self) -> Option<Arc<dyn HubHandle>> {
        let slot = self.slot();
        if !self.inner.status.borrow().state.is_connected() {
            return None;
        }
        slot.handle.clone()
    }

    /// Start a new generation and tear down whatever the previous one owned.
    async fn retire_link(&self) -> u64 {
        let (generation, handle, pump) = {
            let mut slot = self.slot();
            slot.generation += 1;
            (slot.generation, slot.handle.take(), slot.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(handle) = handle {
            if let Err(error) = handle.stop().await {
                warn!(%error, "hub: stopping previous link failed");
            }
        }
        generation
    }

    async fn open_link(&self) -> Result<HubSession, ChatError> {
        tokio::time::timeout(self.inner.connect_timeout, self.inner.connector.open(&self.inner.hub_url))
            .await
            .map_err(|_| ChatError::Timeout("hub connect"))?
    }

    /// Store a freshly opened link, start its pump and join the active room,
    /// unless a newer generation took over meanwhile (then the link is
    /// stopped and `false` returned).
    async fn install(&self, generation: u64, session: HubSession) -> bool {
        let HubSession { handle, events } = session;
        let _rooms = self.inner.room_lock.lock().await;
        let installed = {
            let mut slot = self.slot();
            if slot.generation == generation {
                slot.handle = Some(handle.clone());
                self.publish_locked(ConnectionState::Connected, None);
                slot.pump = Some(self.spawn_pump(generation, events));
                true
            } else {
                false
            }
        };
        if installed {
            self.join_active_room(&handle).await;
            return true;
        }
        debug!(generation, "hub: link superseded before install");
        if let Err(error) = handle.stop().await {
            warn!(%error, "hub: stopping superseded link failed");
        }
        false
    }

    fn spawn_pump(&self, generation: u64, events: mpsc::UnboundedReceiver<HubEvent>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move { hub.pump(generation, events).await })
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    async fn pump(self, generation: u64, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        loop {
            let event = events.recv().await.unwrap_or_else(|| HubEvent::Closed {
                error: Some("hub event stream ended".to_owned()),
                allow_reconnect: true,
            });
            match event {
                HubEvent::Invocation { target, arguments } => self.handle_invocation(&target, arguments),
                HubEvent::Closed { error, allow_reconnect } => {
                    if !self.is_current(generation) {
                        return;
                    }
                    if allow_reconnect {
                        self.run_retries(generation, error).await;
                    } else {
                        self.handle_close(generation, error);
                    }
                    return;
                }
            }
        }
    }

    fn handle_invocation(&self, target: &str, arguments: Vec<Value>) {
        if !target.eq_ignore_ascii_case(RECEIVE_MESSAGE) {
            debug!(target_method = %target, "hub: ignoring invocation");
            return;
        }
        let Some(payload) = arguments.into_iter().next() else {
            warn!("hub: ReceiveMessage without payload");
            return;
        };
        let message = match serde_json::from_value::<ChatMessage>(payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "hub: undecodable ReceiveMessage payload");
                return;
            }
        };
        if message.conversation_uuid.is_empty() {
            debug!(uuid = %message.uuid, "hub: push without conversation dropped");
            return;
        }
        if self.inner.self_sender.as_deref() == Some(message.sender_uuid.as_str()) {
            debug!(uuid = %message.uuid, "hub: own push dropped");
            return;
        }
        let conversation = message.conversation_uuid.clone();
        let uuid = message.uuid.clone();
        if self.inner.store.append_if_absent(&conversation, message) {
            debug!(%conversation, %uuid, "hub: message received");
        } else {
            debug!(%conversation, %uuid, "hub: duplicate push dropped");
        }
    }

    fn handle_close(&self, generation: u64, error: Option<String>) {
        let mut slot = self.slot();
        if slot.generation != generation {
            return;
        }
        slot.handle = None;
        match &error {
            Some(reason) => warn!(%reason, "hub: connection closed"),
            None => info!("hub: connection closed"),
        }
        self.publish_locked(ConnectionState::Disconnected, error);
    }

    async fn run_retries(&self, generation: u64, error: Option<String>) {
        let reason = error.unwrap_or_else(|| "Connection lost".to_owned());
        {
            let mut slot = self.slot();
            if slot.generation != generation {
                return;
            }
            slot.handle = None;
            self.publish_locked(ConnectionState::Reconnecting, Some(reason.clone()));
        }
        warn!(%reason, "hub: connection lost, reconnecting");

        let mut last_error = reason;
        let mut attempt = 0;
        while let Some(delay) = self.inner.retry.delay_for(attempt) {
            attempt += 1;
            tokio::time::sleep(delay).await;
            if !self.is_current(generation) {
                return;
            }
            match self.open_link().await {
                Ok(session) => {
                    if self.install(generation, session).await {
                        info!(attempt, "hub: reconnected");
                    }
                    return;
                }
                Err(error) => {
                    warn!(%error, attempt, "hub: reconnect attempt failed");
                    last_error = error.to_string();
                    if !self.publish_if_current(generation, ConnectionState::Reconnecting, Some(last_error.clone())) {
                        return;
                    }
                }
            }
        }

        if self.publish_if_current(generation, ConnectionState::Failed, Some(last_error.clone())) {
            error!(
                attempts = attempt,
                max_attempts = self.inner.retry.max_attempts(),
                error = %last_error,
                "hub: giving up, manual reconnect required"
            );
        }
    }
}

async fn invoke_logged(handle: &dyn HubHandle, target: &'static str, conversation_id: &str) {
    match handle.invoke(target, vec![Value::String(conversation_id.to_owned())]).await {
        Ok(_) => info!(conversation = %conversation_id, "hub: {target}"),
        Err(error) => warn!(%error, conversation = %conversation_id, "hub: {target} failed"),
    }
}
