//! speda HTTP server.
//!
//! Exposes the conversation engine over HTTP: streamed and collected chat
//! turns, conversation history, and turn cancellation.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
