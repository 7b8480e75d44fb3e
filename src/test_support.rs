//! Test doubles for the hub connector and the REST client.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::config::{ChatConfig, ChatTimeouts};
use crate::error::ChatError;
use crate::net::api::ChatApi;
use crate::net::hub_socket::{HubConnector, HubEvent, HubHandle, HubSession};
use crate::net::types::{ChatMessage, Conversation, CreateConversationParams, Delivery, SendMessageParams};
use crate::state::connection::RetryPolicy;

pub(crate) const COMPANY: &str = "company-1";
pub(crate) const STUDENT: &str = "student-1";

pub(crate) fn test_config() -> ChatConfig {
    ChatConfig {
        hub_url: "http://hub.test/chatHub".to_owned(),
        company_uuid: Some(COMPANY.to_owned()),
        timeouts: ChatTimeouts {
            request: Duration::from_secs(1),
            connect: Duration::from_millis(200),
            keepalive: Duration::from_secs(15),
            server: Duration::from_secs(30),
        },
        retry: RetryPolicy::new(vec![Duration::from_millis(1)], 3),
        ..ChatConfig::default()
    }
}

pub(crate) fn message(uuid: &str, conversation: &str, sender: &str, content: &str) -> ChatMessage {
    ChatMessage {
        uuid: uuid.to_owned(),
        conversation_uuid: conversation.to_owned(),
        sender_uuid: sender.to_owned(),
        content: content.to_owned(),
        send_at: "2025-03-01T09:15:00Z".to_owned(),
        delivery: Delivery::Confirmed,
    }
}

pub(crate) fn push_event(message: &ChatMessage) -> HubEvent {
    HubEvent::Invocation {
        target: "ReceiveMessage".to_owned(),
        arguments: vec![serde_json::to_value(message).unwrap_or(Value::Null)],
    }
}

/// Poll `check` until it holds, failing the test after about two seconds.
pub(crate) async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// =============================================================================
// HUB
// =============================================================================

#[derive(Default)]
struct FakeHubState {
    opens: usize,
    failing_opens: usize,
    hanging_opens: bool,
    stops: usize,
    invocations: Vec<(String, Vec<Value>)>,
    failing_targets: HashSet<String>,
    held_targets: HashMap<String, Arc<Notify>>,
    links: Vec<mpsc::UnboundedSender<HubEvent>>,
}

/// Connector whose links are driven by the test.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<FakeHubState>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeHubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` opens fail.
    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.lock().failing_opens = count;
    }

    /// Make opens never complete.
    pub(crate) fn hang_opens(&self, hang: bool) {
        self.lock().hanging_opens = hang;
    }

    pub(crate) fn fail_target(&self, target: &str) {
        self.lock().failing_targets.insert(target.to_owned());
    }

    /// Make invocations of `target` wait for `gate` before completing.
    pub(crate) fn hold_target(&self, target: &str, gate: Arc<Notify>) {
        self.lock().held_targets.insert(target.to_owned(), gate);
    }

    pub(crate) fn opens(&self) -> usize {
        self.lock().opens
    }

    pub(crate) fn stops(&self) -> usize {
        self.lock().stops
    }

    /// First argument of every invocation of `target`, in call order.
    pub(crate) fn calls(&self, target: &str) -> Vec<String> {
        self.lock()
            .invocations
            .iter()
            .filter(|(name, _)| name == target)
            .map(|(_, args)| args.first().and_then(Value::as_str).unwrap_or_default().to_owned())
            .collect()
    }

    pub(crate) fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().invocations.clone()
    }

    /// Deliver an event on the most recently opened link.
    pub(crate) fn emit(&self, event: HubEvent) {
        let sender = self.lock().links.last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    /// Simulate a transport loss on the current link.
    pub(crate) fn drop_link(&self, reason: &str) {
        self.emit(HubEvent::Closed { error: Some(reason.to_owned()), allow_reconnect: true });
    }
}

#[async_trait::async_trait]
impl HubConnector for FakeConnector {
    async fn open(&self, _hub_url: &str) -> Result<HubSession, ChatError> {
        let hang = {
            let mut state = self.lock();
            state.opens += 1;
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(ChatError::Connect("connection refused".to_owned()));
            }
            state.hanging_opens
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().links.push(tx.clone());
        let handle = FakeHandle { connector: self.clone(), events: tx };
        Ok(HubSession { handle: Arc::new(handle), events: rx })
    }
}

struct FakeHandle {
    connector: FakeConnector,
    events: mpsc::UnboundedSender<HubEvent>,
}

#[async_trait::async_trait]
impl HubHandle for FakeHandle {
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, ChatError> {
        let (gate, fail) = {
            let mut state = self.connector.lock();
            state.invocations.push((target.to_owned(), arguments));
            (state.held_targets.get(target).cloned(), state.failing_targets.contains(target))
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if fail {
            return Err(ChatError::Invocation { target: target.to_owned(), message: "rejected".to_owned() });
        }
        Ok(Value::Null)
    }

    async fn stop(&self) -> Result<(), ChatError> {
        self.connector.lock().stops += 1;
        let _ = self.events.send(HubEvent::Closed { error: None, allow_reconnect: false });
        Ok(())
    }
}

// =============================================================================
// REST
// =============================================================================

#[derive(Default)]
struct MockApiState {
    history: HashMap<String, Result<Vec<ChatMessage>, String>>,
    fetches: Vec<String>,
    sends: Vec<SendMessageParams>,
    fail_sends: bool,
    conversations: Vec<Conversation>,
}

/// Scripted [`ChatApi`]. Gates hold a call until the test releases them.
#[derive(Default)]
pub(crate) struct MockApi {
    state: Mutex<MockApiState>,
    fetch_gate: Option<Arc<Notify>>,
    send_gate: Option<Arc<Notify>>,
}

impl MockApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with_history(self, conversation: &str, messages: Vec<ChatMessage>) -> Self {
        self.lock().history.insert(conversation.to_owned(), Ok(messages));
        self
    }

    pub(crate) fn with_failing_history(self, conversation: &str, message: &str) -> Self {
        self.lock().history.insert(conversation.to_owned(), Err(message.to_owned()));
        self
    }

    pub(crate) fn with_fetch_gate(mut self, gate: Arc<Notify>) -> Self {
        self.fetch_gate = Some(gate);
        self
    }

    pub(crate) fn with_send_gate(mut self, gate: Arc<Notify>) -> Self {
        self.send_gate = Some(gate);
        self
    }

    pub(crate) fn with_failing_sends(self) -> Self {
        self.lock().fail_sends = true;
        self
    }

    pub(crate) fn set_history(&self, conversation: &str, messages: Vec<ChatMessage>) {
        self.lock().history.insert(conversation.to_owned(), Ok(messages));
    }

    pub(crate) fn fetches(&self) -> Vec<String> {
        self.lock().fetches.clone()
    }

    pub(crate) fn sends(&self) -> Vec<SendMessageParams> {
        self.lock().sends.clone()
    }
}

#[async_trait::async_trait]
impl ChatApi for MockApi {
    async fn fetch_messages(&self, conversation_uuid: &str) -> Result<Vec<ChatMessage>, ChatError> {
        self.lock().fetches.push(conversation_uuid.to_owned());
        if let Some(gate) = &self.fetch_gate {
            gate.notified().await;
        }
        let result = self.lock().history.get(conversation_uuid).cloned();
        match result {
            Some(Ok(messages)) => Ok(messages),
            Some(Err(message)) => Err(ChatError::Api { code: "server_error".to_owned(), message }),
            None => Ok(Vec::new()),
        }
    }

    async fn send_message(&self, params: &SendMessageParams) -> Result<ChatMessage, ChatError> {
        let (count, fail) = {
            let mut state = self.lock();
            state.sends.push(params.clone());
            (state.sends.len(), state.fail_sends)
        };
        if let Some(gate) = &self.send_gate {
            gate.notified().await;
        }
        if fail {
            return Err(ChatError::HttpStatus { status: 500, body: "boom".to_owned() });
        }
        Ok(message(&format!("srv-{count}"), &params.conversation_uuid, &params.sender_uuid, &params.content))
    }

    async fn list_conversations(&self, company_uuid: &str) -> Result<Vec<Conversation>, ChatError> {
        let conversations = self.lock().conversations.clone();
        Ok(conversations.into_iter().filter(|c| c.company_uuid == company_uuid).collect())
    }

    async fn create_conversation(&self, params: &CreateConversationParams) -> Result<Conversation, ChatError> {
        let conversation = Conversation {
            uuid: format!("conv-{}", params.student_uuid),
            student_uuid: params.student_uuid.clone(),
            company_uuid: params.company_uuid.clone(),
            created_at: "2025-03-01T09:15:00Z".to_owned(),
            student: None,
        };
        self.lock().conversations.push(conversation.clone());
        Ok(conversation)
    }
}
