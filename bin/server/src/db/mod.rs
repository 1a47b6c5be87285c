//! Database repositories for the speda server.
//!
//! This module provides:
//! - The PostgreSQL conversation store
//! - The PostgreSQL fact store for long-term memory

pub mod conversation;
pub mod fact;

pub use conversation::PgConversationStore;
pub use fact::PgFactStore;
