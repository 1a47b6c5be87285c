//! HTTP route handlers.

pub mod chat;
