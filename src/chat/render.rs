//! Presentation models for a conversation: message bubbles and the
//! connection banner.
//!
//! Message content may embed a job invitation:
//!
//! ```text
//! Hi! [JOB_INVITE]jobUuid="j-1" title="Backend intern"[/JOB_INVITE] Interested?
//! ```
//!
//! Well-formed blocks become [`Segment::JobInvite`]; anything else inside the
//! tags is shown as literal text.

#[cfg(test)]
#[path = "render_test.rs"]
mod render_test;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::net::types::{ChatMessage, Delivery};
use crate::state::connection::{ConnectionState, ConnectionStatus};

pub const PLACEHOLDER_CONNECTED: &str = "Type your message...";
pub const PLACEHOLDER_DISCONNECTED: &str = "Reconnect to send messages";

// =============================================================================
// CONTENT SEGMENTS
// =============================================================================

/// A piece of message content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    JobInvite(JobInvite),
}

/// Parsed `[JOB_INVITE]…[/JOB_INVITE]` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInvite {
    pub job_uuid: String,
    /// Every `key="value"` pair of the block, `jobUuid` included.
    pub fields: BTreeMap<String, String>,
}

impl JobInvite {
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// In-app route of the referenced job.
    #[must_use]
    pub fn link(&self) -> String {
        format!("/jobs/{}", self.job_uuid)
    }
}

fn block_regex() -> Option<&'static Regex> {
    static BLOCK_RE: OnceLock<Option<Regex>> = OnceLock::new();
    BLOCK_RE
        .get_or_init(|| Regex::new(r"(?s)\[JOB_INVITE\](.*?)\[/JOB_INVITE\]").ok())
        .as_ref()
}

fn pair_regex() -> Option<&'static Regex> {
    static PAIR_RE: OnceLock<Option<Regex>> = OnceLock::new();
    PAIR_RE.get_or_init(|| Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).ok()).as_ref()
}

/// Split content into text and job-invite segments.
#[must_use]
pub fn parse_segments(content: &str) -> Vec<Segment> {
    let (Some(block_re), Some(pair_re)) = (block_regex(), pair_regex()) else {
        return vec![Segment::Text(content.to_owned())];
    };

    let mut segments = Vec::new();
    let mut text = String::new();
    let mut last_end = 0;

    for caps in block_re.captures_iter(content) {
        let (Some(full), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        match parse_invite(pair_re, body.as_str()) {
            Some(invite) => {
                text.push_str(&content[last_end..full.start()]);
                flush_text(&mut segments, &mut text);
                segments.push(Segment::JobInvite(invite));
            }
            // Malformed: keep the block verbatim with the surrounding text.
            None => text.push_str(&content[last_end..full.end()]),
        }
        last_end = full.end();
    }
    text.push_str(&content[last_end..]);

    if segments.is_empty() {
        return vec![Segment::Text(text)];
    }
    flush_text(&mut segments, &mut text);
    segments
}

fn flush_text(segments: &mut Vec<Segment>, text: &mut String) {
    let taken = std::mem::take(text);
    let trimmed = taken.trim();
    if !trimmed.is_empty() {
        segments.push(Segment::Text(trimmed.to_owned()));
    }
}

/// A block is well formed when it consists only of `key="value"` pairs and
/// names a non-empty `jobUuid`.
fn parse_invite(pair_re: &Regex, body: &str) -> Option<JobInvite> {
    let mut fields = BTreeMap::new();
    let mut last_end = 0;
    for caps in pair_re.captures_iter(body) {
        let (full, key, value) = (caps.get(0)?, caps.get(1)?, caps.get(2)?);
        if !body[last_end..full.start()].trim().is_empty() {
            return None;
        }
        fields.insert(key.as_str().to_owned(), value.as_str().to_owned());
        last_end = full.end();
    }
    if !body[last_end..].trim().is_empty() {
        return None;
    }

    let job_uuid = fields.get("jobUuid").filter(|v| !v.trim().is_empty())?.clone();
    Some(JobInvite { job_uuid, fields })
}

// =============================================================================
// BUBBLES
// =============================================================================

/// One rendered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageBubble {
    pub uuid: String,
    /// Sent by the viewing company (right-aligned, accent colour).
    pub own: bool,
    pub time_label: String,
    pub segments: Vec<Segment>,
    pub delivery: Delivery,
}

impl MessageBubble {
    #[must_use]
    pub fn from_message(message: &ChatMessage, self_sender: &str) -> Self {
        Self {
            uuid: message.uuid.clone(),
            own: message.sender_uuid == self_sender,
            time_label: time_label(&message.send_at),
            segments: parse_segments(&message.content),
            delivery: message.delivery,
        }
    }
}

impl fmt::Display for MessageBubble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let who = if self.own { "you" } else { "them" };
        write!(f, "[{}] {who}:", self.time_label)?;
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => write!(f, " {text}")?,
                Segment::JobInvite(invite) => {
                    let title = invite.field("title").unwrap_or("job invitation");
                    write!(f, " <{title} -> {}>", invite.link())?;
                }
            }
        }
        match self.delivery {
            Delivery::Confirmed => Ok(()),
            Delivery::Pending { .. } => write!(f, " (sending)"),
            Delivery::Failed { .. } => write!(f, " (failed)"),
        }
    }
}

#[must_use]
pub fn bubbles(messages: &[ChatMessage], self_sender: &str) -> Vec<MessageBubble> {
    messages
        .iter()
        .map(|message| MessageBubble::from_message(message, self_sender))
        .collect()
}

/// `HH:MM` of a server timestamp, in the timestamp's own offset. Timestamps
/// without an offset are taken as-is; unparseable ones are shown verbatim.
#[must_use]
pub fn time_label(send_at: &str) -> String {
    if let Ok(at) = OffsetDateTime::parse(send_at, &Rfc3339) {
        return format!("{:02}:{:02}", at.hour(), at.minute());
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");
    if let Ok(at) = PrimitiveDateTime::parse(send_at, naive) {
        return format!("{:02}:{:02}", at.hour(), at.minute());
    }
    send_at.to_owned()
}

// =============================================================================
// STATUS BANNER
// =============================================================================

/// What the conversation screen shows for the current connection status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusView {
    pub label: &'static str,
    pub connected: bool,
    pub show_reconnect: bool,
    /// Error alert, only while not connected.
    pub alert: Option<String>,
    pub placeholder: &'static str,
}

impl StatusView {
    #[must_use]
    pub fn from_status(status: &ConnectionStatus) -> Self {
        let label = match status.state {
            ConnectionState::Connected => "Connected",
            ConnectionState::Connecting => "Connecting…",
            ConnectionState::Reconnecting => "Reconnecting…",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Failed => "Connection failed",
        };
        let connected = status.state.is_connected();
        Self {
            label,
            connected,
            show_reconnect: !connected,
            alert: if connected { None } else { status.last_error.clone() },
            placeholder: if connected { PLACEHOLDER_CONNECTED } else { PLACEHOLDER_DISCONNECTED },
        }
    }
}
