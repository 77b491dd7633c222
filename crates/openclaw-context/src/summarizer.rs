//! Rolling summarisation — compresses the older history prefix via the
//! model itself.
//!
//! Summarisation is staged: the older prefix is cut into chunks no larger
//! than 30% of the context window, each chunk is summarised independently,
//! and multiple chunk summaries are reduced into one. A summariser failure
//! is never fatal — the engine falls back to plain token trimming.

use async_trait::async_trait;
use openclaw_types::estimate::{estimate_entry_tokens, estimate_history_tokens, estimate_tokens};
use openclaw_types::session::{EntryPayload, HistoryEntry};
use tracing::debug;

/// Largest chunk fed to the summariser, as a fraction of the context window.
const CHUNK_WINDOW_FRACTION: f64 = 0.30;

/// Standard preservation prompt prepended to every summarisation request.
const PRESERVATION_PROMPT: &str = "Summarize the following conversation excerpt. \
Preserve: key decisions and their reasons, open questions, stated user \
preferences, and pending tasks. Be specific; drop pleasantries. Reply with \
the summary only.";

/// Prompt used to merge multiple chunk summaries into one.
const REDUCE_PROMPT: &str = "Merge the following partial conversation summaries \
into one coherent summary. Preserve key decisions, open questions, user \
preferences, and pending tasks. Reply with the merged summary only.";

/// Model access the summariser needs — implemented by the agent runtime.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    /// Complete a summarisation prompt, bounded to `max_tokens` output.
    async fn summarize(&self, prompt: String, max_tokens: u64) -> Result<String, String>;

    /// Model id recorded on produced summaries.
    fn model_id(&self) -> String;
}

/// A freshly produced rolling summary, ready to append to the log.
#[derive(Debug, Clone)]
pub struct ProducedSummary {
    pub text: String,
    pub covers_turns: u64,
    pub original_tokens: u64,
    pub model: String,
}

/// Summarise the older history prefix.
///
/// Returns `Err` with the provider's message on any stage failure; the
/// caller falls back to token trimming and emits an ops alert.
pub async fn summarize_older(
    model: &dyn SummaryModel,
    older: &[HistoryEntry],
    context_window: u64,
    summary_max_tokens: u64,
) -> Result<ProducedSummary, String> {
    if older.is_empty() {
        return Err("nothing to summarize".to_string());
    }

    let chunk_budget = ((context_window as f64 * CHUNK_WINDOW_FRACTION) as u64).max(1);
    let chunks = chunk_entries(older, chunk_budget);
    debug!(
        chunks = chunks.len(),
        entries = older.len(),
        "staged summarisation"
    );

    let mut partials = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let prompt = format!("{PRESERVATION_PROMPT}\n\n{}", render_transcript(chunk));
        partials.push(model.summarize(prompt, summary_max_tokens).await?);
    }

    let text = if partials.len() == 1 {
        partials.into_iter().next().unwrap_or_default()
    } else {
        let prompt = format!("{REDUCE_PROMPT}\n\n{}", partials.join("\n\n---\n\n"));
        model.summarize(prompt, summary_max_tokens).await?
    };

    let covers_turns = older
        .iter()
        .filter(|e| matches!(e.payload, EntryPayload::User { .. }))
        .count() as u64;

    Ok(ProducedSummary {
        text,
        covers_turns,
        original_tokens: estimate_history_tokens(older),
        model: model.model_id(),
    })
}

/// Cut entries into contiguous chunks of at most `chunk_budget` tokens.
/// A single entry larger than the budget gets its own chunk.
fn chunk_entries(entries: &[HistoryEntry], chunk_budget: u64) -> Vec<Vec<HistoryEntry>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_tokens = 0u64;
    for entry in entries {
        let tokens = estimate_entry_tokens(entry);
        if !current.is_empty() && current_tokens + tokens > chunk_budget {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(entry.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Render entries as a plain-text transcript for the summariser.
fn render_transcript(entries: &[HistoryEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        match &entry.payload {
            EntryPayload::User { text, .. } => {
                out.push_str("User: ");
                out.push_str(text);
            }
            EntryPayload::Assistant { text, .. } => {
                out.push_str("Assistant: ");
                out.push_str(text);
            }
            EntryPayload::ToolCall { tool, args, .. } => {
                out.push_str(&format!("Assistant called tool {tool}: {args}"));
            }
            EntryPayload::ToolResult { content, .. } => {
                out.push_str("Tool result: ");
                // Tool output can be enormous; the summary doesn't need it all.
                out.push_str(truncate_chars(content, 800));
            }
            EntryPayload::ToolFailed { reason, .. } => {
                out.push_str(&format!("Tool failed: {reason}"));
            }
            _ => continue,
        }
        out.push('\n');
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Tokens a summary preamble occupies (counted against the bootstrap slice).
pub fn summary_preamble_tokens(text: &str) -> u64 {
    estimate_tokens(text)
}
