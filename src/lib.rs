//! Realtime chat client for the recruitment dashboard.
//!
//! A [`ChatSession`] connects to the chat hub, keeps per-conversation message
//! caches in sync with pushes and REST history, and hands out one
//! [`ConversationView`] per open conversation screen.

pub mod chat;
pub mod config;
pub mod error;
pub mod net;
pub mod state;

#[cfg(test)]
mod test_support;

pub use chat::hub::ChatHub;
pub use chat::render::{MessageBubble, Segment, StatusView};
pub use chat::session::{ChatSession, HistoryState};
pub use chat::view::{ConversationView, ViewPhase};
pub use config::ChatConfig;
pub use error::ChatError;
pub use state::connection::{ConnectionState, ConnectionStatus};
