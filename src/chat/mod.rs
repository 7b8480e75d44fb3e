//! Chat orchestration on top of the hub link and the shared state.
//!
//! SYSTEM CONTEXT
//! ==============
//! `hub` owns the connection lifecycle and room membership, `session` is the
//! per-company context object, `view` drives one conversation screen and
//! `render` turns messages and status into display models.

pub mod hub;
pub mod render;
pub mod session;
pub mod view;
