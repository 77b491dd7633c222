//! Token estimation — provider-agnostic character-count heuristic.
//!
//! Roughly four characters per token. Deliberately stable across providers:
//! the estimate only enforces budgets; true usage reported by the provider
//! updates session counters after each call.

use crate::session::{EntryPayload, HistoryEntry};

/// Characters per estimated token.
const CHARS_PER_TOKEN: u64 = 4;

/// Fixed per-entry overhead covering role framing and separators.
const ENTRY_OVERHEAD_TOKENS: u64 = 4;

/// Estimate tokens for a plain string.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Estimate tokens for one history entry, including framing overhead.
pub fn estimate_entry_tokens(entry: &HistoryEntry) -> u64 {
    let body = match &entry.payload {
        EntryPayload::User { text, .. } => estimate_tokens(text),
        EntryPayload::Assistant { text, .. } => estimate_tokens(text),
        EntryPayload::ToolCall { tool, args, .. } => {
            estimate_tokens(tool) + estimate_tokens(&args.to_string())
        }
        EntryPayload::ToolResult { content, .. } => estimate_tokens(content),
        EntryPayload::ToolFailed { reason, .. } => estimate_tokens(reason),
        EntryPayload::Summary { text, .. } => estimate_tokens(text),
        EntryPayload::MessageTruncated { reason } => estimate_tokens(reason),
        EntryPayload::Other { data, .. } => estimate_tokens(&data.to_string()),
    };
    body + ENTRY_OVERHEAD_TOKENS
}

/// Estimate tokens for a slice of history.
pub fn estimate_history_tokens(entries: &[HistoryEntry]) -> u64 {
    entries.iter().map(estimate_entry_tokens).sum()
}
