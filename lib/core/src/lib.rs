//! Core domain types and utilities for the speda assistant.
//!
//! This crate provides the identifier types and the error-handling foundation
//! shared by the conversation engine, the LLM gateway and the server.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ConversationId, MessageId, ParseIdError, TaskId, TurnId, UserId};
