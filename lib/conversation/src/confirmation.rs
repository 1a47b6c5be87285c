//! Confirmation ledger.
//!
//! Tools flagged `requires_confirmation` never run on the model's say-so
//! alone. The first request for such an action is recorded as pending and
//! answered with a needs-confirmation result. At the start of the next
//! turn the user's reply either approves every pending action or discards
//! them. An approval is good for one execution of that exact action (tool
//! name plus canonical arguments) during that turn.

use serde_json::Value as JsonValue;
use speda_core::ConversationId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

const AFFIRMATIVE: &[&str] = &[
    "yes",
    "y",
    "yep",
    "yeah",
    "ok",
    "okay",
    "sure",
    "confirm",
    "confirmed",
    "approve",
    "approved",
    "go ahead",
    "do it",
    "proceed",
    "evet",
    "tamam",
    "onayla",
    "onaylıyorum",
];

/// A tool invocation identified by name and canonical arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    name: String,
    arguments: String,
}

impl ActionKey {
    /// Creates the key for calling `name` with `arguments`.
    ///
    /// Object keys are sorted, so argument order does not matter.
    #[must_use]
    pub fn new(name: &str, arguments: &JsonValue) -> Self {
        let mut canonical = String::new();
        write_canonical(arguments, &mut canonical);
        Self {
            name: name.to_string(),
            arguments: canonical,
        }
    }
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Returns true if the message is a short affirmative reply.
#[must_use]
pub fn is_affirmative(message: &str) -> bool {
    let normalized = message
        .trim()
        .trim_end_matches(['.', '!', ','])
        .trim()
        .to_lowercase();

    AFFIRMATIVE.contains(&normalized.as_str())
        || normalized.starts_with("yes ")
        || normalized.starts_with("yes,")
        || normalized.starts_with("evet ")
        || normalized.starts_with("evet,")
}

#[derive(Debug, Default)]
struct LedgerEntry {
    pending: Vec<ActionKey>,
    approved: Vec<ActionKey>,
}

/// Per-conversation record of actions awaiting or holding confirmation.
#[derive(Debug, Default)]
pub struct ConfirmationLedger {
    entries: Mutex<HashMap<ConversationId, LedgerEntry>>,
}

impl ConfirmationLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConversationId, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves pending actions at the start of a turn.
    ///
    /// An explicit `confirm` flag wins; otherwise the message is classified.
    /// Approved actions become executable for this turn, rejected ones are
    /// dropped. Approvals left over from the previous turn are always
    /// dropped. Returns the number of actions approved.
    pub fn begin_turn(&self, id: ConversationId, message: &str, confirm: Option<bool>) -> usize {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            return 0;
        };

        let pending = std::mem::take(&mut entry.pending);
        let approve = !pending.is_empty() && confirm.unwrap_or_else(|| is_affirmative(message));
        entry.approved = if approve { pending } else { Vec::new() };
        let approved = entry.approved.len();

        if entry.approved.is_empty() {
            entries.remove(&id);
        }
        approved
    }

    /// Records an action that was answered with a needs-confirmation result.
    pub fn record_pending(&self, id: ConversationId, action: ActionKey) {
        let mut entries = self.entries();
        let entry = entries.entry(id).or_default();
        if !entry.pending.contains(&action) {
            entry.pending.push(action);
        }
    }

    /// Consumes an approval for `action`. Returns false if none is held.
    pub fn take_approval(&self, id: ConversationId, action: &ActionKey) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        match entry.approved.iter().position(|a| a == action) {
            Some(index) => {
                entry.approved.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns the number of actions awaiting confirmation.
    #[must_use]
    pub fn pending_count(&self, id: ConversationId) -> usize {
        self.entries().get(&id).map_or(0, |e| e.pending.len())
    }

    /// Drops everything recorded for a conversation.
    pub fn forget(&self, id: ConversationId) {
        self.entries().remove(&id);
    }
}
