//! Shared protocol definitions for the `MentorChat` push channel and REST API.

pub mod api;
pub mod frame;
pub mod message;
