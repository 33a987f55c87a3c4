//! `MentorChat`: real-time chat synchronization client library.
//!
//! Keeps a client-side cache of one user's conversations consistent with
//! the backend by combining a WebSocket push channel with REST fetches.

pub mod api;
pub mod chat;
pub mod config;
pub mod console;
pub mod net;
pub mod transport;
