//! Shared client-side chat state.
//!
//! SYSTEM CONTEXT
//! ==============
//! `connection` describes the hub link lifecycle, `rooms` holds the active
//! conversation and `messages` caches message lists per conversation. All of
//! them are cheap to clone and shared between the hub and the views.

pub mod connection;
pub mod messages;
pub mod rooms;
