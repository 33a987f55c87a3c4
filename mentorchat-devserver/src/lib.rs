//! `MentorChat` development backend.
//!
//! An in-memory stand-in for the production chat backend: the REST
//! endpoints for conversation lists, history and sending, plus the push
//! WebSocket. Exposed as a library for integration tests.

pub mod config;
pub mod server;
pub mod store;
