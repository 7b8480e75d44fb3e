//! Websocket link to the chat hub.
//!
//! DESIGN
//! ======
//! `HubConnector::open` performs the socket connect and protocol handshake
//! and hands back a [`HubSession`]: a handle for outbound invocations plus a
//! channel of inbound [`HubEvent`]s. One spawned task owns the socket and
//! multiplexes reads, outbound records, keep-alive pings and the
//! server-timeout watchdog. The channel always ends with exactly one
//! `HubEvent::Closed`.
//!
//! The traits are the seam `ChatHub` is tested through; `WsHubConnector` is
//! the production implementation.
//!
//! ERROR HANDLING
//! ==============
//! Connect and handshake failures are returned from `open`. Once the link is
//! up, transport failures surface only as the final `Closed` event, and
//! in-flight invocations fail with `ChatError::Closed`.

#[cfg(test)]
#[path = "hub_socket_test.rs"]
mod hub_socket_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hubwire::{HandshakeRequest, HubMessage, Invocation};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::config::ChatConfig;
use crate::error::ChatError;

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>>;

const SERVER_TIMEOUT_MESSAGE: &str = "Server timeout elapsed without receiving a message from the server.";
const STOP_WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// SEAM
// =============================================================================

/// Something that arrived on an open hub link.
#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    /// Server-to-client method call, e.g. `ReceiveMessage`.
    Invocation { target: String, arguments: Vec<Value> },
    /// The link ended. `error` is `None` for a clean close.
    Closed { error: Option<String>, allow_reconnect: bool },
}

/// Outbound side of an open hub link.
#[async_trait::async_trait]
pub trait HubHandle: Send + Sync {
    /// Call a hub method and wait for its completion.
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, ChatError>;

    /// Close the link. Stopping an already closed link is not an error.
    async fn stop(&self) -> Result<(), ChatError>;
}

/// An open link: the outbound handle and the inbound event stream.
pub struct HubSession {
    pub handle: Arc<dyn HubHandle>,
    pub events: mpsc::UnboundedReceiver<HubEvent>,
}

/// Opens hub links.
#[async_trait::async_trait]
pub trait HubConnector: Send + Sync {
    async fn open(&self, hub_url: &str) -> Result<HubSession, ChatError>;
}

// =============================================================================
// WEBSOCKET CONNECTOR
// =============================================================================

/// Opens hub links over a websocket using the JSON hub protocol.
#[derive(Clone, Debug)]
pub struct WsHubConnector {
    access_token: Option<String>,
    handshake_timeout: Duration,
    keepalive: Duration,
    server_timeout: Duration,
}

impl WsHubConnector {
    #[must_use]
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            access_token: config.access_token.clone(),
            handshake_timeout: config.timeouts.connect,
            keepalive: config.timeouts.keepalive,
            server_timeout: config.timeouts.server,
        }
    }
}

#[async_trait::async_trait]
impl HubConnector for WsHubConnector {
    async fn open(&self, hub_url: &str) -> Result<HubSession, ChatError> {
        let url = socket_url(hub_url, self.access_token.as_deref())?;
        let (mut stream, _) = connect_async(url.as_str())
            .await
            .map_err(|error| ChatError::Connect(error.to_string()))?;

        let handshake = hubwire::encode_handshake(&HandshakeRequest::json());
        stream
            .send(Message::text(handshake))
            .await
            .map_err(|error| ChatError::Connect(error.to_string()))?;

        let leftover = tokio::time::timeout(self.handshake_timeout, read_handshake(&mut stream))
            .await
            .map_err(|_| ChatError::Timeout("hub handshake"))??;
        info!(hub = %hub_url, "hub: link established");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::default();

        let link = LinkTask {
            stream,
            outbound: outbound_rx,
            events: events_tx,
            pending: pending.clone(),
            keepalive: self.keepalive,
            server_timeout: self.server_timeout,
        };
        let task = tokio::spawn(link.run(leftover));

        let handle = WsHubHandle {
            outbound: outbound_tx,
            pending,
            next_id: AtomicU64::new(0),
            invoke_timeout: self.server_timeout,
            task: Mutex::new(Some(task)),
        };
        Ok(HubSession { handle: Arc::new(handle), events: events_rx })
    }
}

/// Map the hub address onto its websocket endpoint, carrying the access token.
pub(crate) fn socket_url(hub_url: &str, access_token: Option<&str>) -> Result<String, ChatError> {
    let base = if let Some(rest) = hub_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = hub_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if hub_url.starts_with("ws://") || hub_url.starts_with("wss://") {
        hub_url.to_owned()
    } else {
        return Err(ChatError::Config(format!("unsupported hub url: {hub_url}")));
    };

    Ok(match access_token {
        Some(token) => {
            let separator = if base.contains('?') { '&' } else { '?' };
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("access_token", token)
                .finish();
            format!("{base}{separator}{query}")
        }
        None => base,
    })
}

/// Wait for the handshake answer; returns any records batched behind it.
async fn read_handshake(stream: &mut HubStream) -> Result<String, ChatError> {
    loop {
        let Some(message) = stream.next().await else {
            return Err(ChatError::Closed);
        };
        match message.map_err(|error| ChatError::Connect(error.to_string()))? {
            Message::Text(text) => {
                let (response, rest) = hubwire::decode_handshake(text.as_str())?;
                if let Some(error) = response.error {
                    return Err(ChatError::Handshake(error));
                }
                return Ok(rest.to_owned());
            }
            Message::Binary(_) => {
                return Err(ChatError::Handshake("binary frame during handshake".to_owned()));
            }
            Message::Close(_) => return Err(ChatError::Closed),
            _ => {}
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

enum Outbound {
    Record(String),
    Stop,
}

struct WsHubHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingMap,
    next_id: AtomicU64,
    invoke_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsHubHandle {
    fn forget(&self, invocation_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(invocation_id);
    }
}

#[async_trait::async_trait]
impl HubHandle for WsHubHandle {
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, ChatError> {
        let invocation_id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(invocation_id.clone(), tx);

        let record = hubwire::encode_message(&HubMessage::Invocation(
            Invocation::new(target, arguments).with_id(invocation_id.clone()),
        ));
        if self.outbound.send(Outbound::Record(record)).is_err() {
            self.forget(&invocation_id);
            return Err(ChatError::NotConnected);
        }

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(ChatError::Invocation { target: target.to_owned(), message }),
            Ok(Err(_)) => Err(ChatError::Closed),
            Err(_) => {
                self.forget(&invocation_id);
                Err(ChatError::Timeout("hub invocation"))
            }
        }
    }

    async fn stop(&self) -> Result<(), ChatError> {
        // The link may already be gone; that still counts as stopped.
        let _ = self.outbound.send(Outbound::Stop);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            match tokio::time::timeout(STOP_WAIT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, "hub: link task failed"),
                Err(_) => return Err(ChatError::Timeout("hub stop")),
            }
        }
        Ok(())
    }
}

// =============================================================================
// LINK TASK
// =============================================================================

struct LinkTask {
    stream: HubStream,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<HubEvent>,
    pending: PendingMap,
    keepalive: Duration,
    server_timeout: Duration,
}

/// Why the link task ended.
struct Ending {
    error: Option<String>,
    allow_reconnect: bool,
}

impl Ending {
    fn lost(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), allow_reconnect: true }
    }

    fn clean() -> Self {
        Self { error: None, allow_reconnect: false }
    }
}

impl LinkTask {
    async fn run(mut self, leftover: String) {
        let ending = match self.dispatch_text(&leftover) {
            Some(ending) => ending,
            None => self.pump().await,
        };

        // Refuse new invocations before failing the waiting ones, so no
        // waiter can slip in after the clear.
        self.outbound.close();
        // Dropping the senders fails every waiting invocation with `Closed`.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();

        match &ending.error {
            Some(error) => warn!(%error, allow_reconnect = ending.allow_reconnect, "hub: link closed"),
            None => info!("hub: link closed"),
        }
        let _ = self.events.send(HubEvent::Closed { error: ending.error, allow_reconnect: ending.allow_reconnect });
    }

    async fn pump(&mut self) -> Ending {
        let mut keepalive = tokio::time::interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = Instant::now() + self.server_timeout;

        loop {
            tokio::select! {
                frame = self.stream.next() => {
                    deadline = Instant::now() + self.server_timeout;
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(ending) = self.dispatch_text(text.as_str()) {
                                let _ = self.stream.close(None).await;
                                return ending;
                            }
                        }
                        Some(Ok(Message::Close(_))) => return Ending::lost("WebSocket closed by the server"),
                        Some(Ok(_)) => {}
                        Some(Err(error)) => return Ending::lost(error.to_string()),
                        None => return Ending::lost("WebSocket stream ended"),
                    }
                }
                command = self.outbound.recv() => match command {
                    Some(Outbound::Record(record)) => {
                        if let Err(error) = self.stream.send(Message::text(record)).await {
                            return Ending::lost(error.to_string());
                        }
                    }
                    Some(Outbound::Stop) | None => {
                        let _ = self.stream.close(None).await;
                        return Ending::clean();
                    }
                },
                _ = keepalive.tick() => {
                    let ping = hubwire::encode_message(&HubMessage::Ping);
                    if let Err(error) = self.stream.send(Message::text(ping)).await {
                        return Ending::lost(error.to_string());
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    let _ = self.stream.close(None).await;
                    return Ending::lost(SERVER_TIMEOUT_MESSAGE);
                }
            }
        }
    }

    /// Route every record of a text frame; a server `Close` ends the link.
    fn dispatch_text(&self, text: &str) -> Option<Ending> {
        for decoded in hubwire::decode_frame_text(text) {
            match decoded {
                Ok(HubMessage::Invocation(invocation)) => {
                    debug!(target_method = %invocation.target, "hub: invocation received");
                    let _ = self.events.send(HubEvent::Invocation {
                        target: invocation.target,
                        arguments: invocation.arguments,
                    });
                }
                Ok(HubMessage::Completion(completion)) => {
                    let waiter = self
                        .pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&completion.invocation_id);
                    let Some(waiter) = waiter else {
                        debug!(invocation_id = %completion.invocation_id, "hub: completion without waiter");
                        continue;
                    };
                    let outcome = match completion.error {
                        Some(error) => Err(error),
                        None => Ok(completion.result.unwrap_or(Value::Null)),
                    };
                    let _ = waiter.send(outcome);
                }
                Ok(HubMessage::Ping) => {}
                Ok(HubMessage::Close(close)) => {
                    return Some(Ending { error: close.error, allow_reconnect: close.allow_reconnect });
                }
                Err(error) => warn!(%error, "hub: undecodable record skipped"),
            }
        }
        None
    }
}
