//! Networking modules for the REST endpoints and the realtime hub.
//!
//! SYSTEM CONTEXT
//! ==============
//! `api` handles REST calls, `hub_socket` owns the websocket link to the hub
//! and `types` defines the shared wire schema.

pub mod api;
pub mod hub_socket;
pub mod types;
