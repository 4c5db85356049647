//! # Session Management Module
//!
//! Everything that tracks one client's connection lifetime and the directory
//! of all live connections.
//!
//! ## Key Components:
//! - **Session**: per-connection identity, state machine and outbound queue
//! - **Session Registry**: concurrency-safe directory of live sessions
//! - **Outbound Queue**: bounded per-session send queue (drop-oldest policy)
//!
//! The WebSocket transport glue that drives a session lives in
//! `src/websocket.rs` at the crate root.

pub mod queue;    // Bounded outbound frame queue
pub mod registry; // Concurrency-safe session directory
pub mod state;    // Session lifecycle state machine
