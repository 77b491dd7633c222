//! History selection — pure, deterministic trimming strategies.
//!
//! Strategies are applied by the engine in priority order: DM turn limit,
//! rolling summarisation, then plain token trim. Everything here is
//! synchronous and a fixed point: re-running any selection on its own output
//! yields the same entries.
//!
//! Summary entries and unknown entry kinds never appear in selected history.
//! Summaries travel as preamble text; unknown kinds stay in the log only.

use openclaw_types::estimate::{estimate_entry_tokens, estimate_history_tokens};
use openclaw_types::session::{EntryPayload, HistoryEntry};

/// Default number of recent user turns kept even over budget.
pub const DEFAULT_PRESERVE_RECENT_TURNS: usize = 5;

/// Filter history down to the kinds selection operates on.
pub fn selectable_entries(entries: &[HistoryEntry]) -> Vec<HistoryEntry> {
    entries
        .iter()
        .filter(|e| {
            !matches!(
                e.payload,
                EntryPayload::Summary { .. } | EntryPayload::Other { .. }
            )
        })
        .cloned()
        .collect()
}

/// The newest rolling summary in the log, if any.
pub fn latest_summary(entries: &[HistoryEntry]) -> Option<&HistoryEntry> {
    entries
        .iter()
        .rev()
        .find(|e| matches!(e.payload, EntryPayload::Summary { .. }))
}

fn is_user(entry: &HistoryEntry) -> bool {
    matches!(entry.payload, EntryPayload::User { .. })
}

/// Index where the n-th-from-last user turn begins, or 0 when there are
/// fewer than `n` user turns.
fn turn_boundary_from_end(entries: &[HistoryEntry], n: usize) -> usize {
    if n == 0 {
        return entries.len();
    }
    let mut seen = 0;
    for (idx, entry) in entries.iter().enumerate().rev() {
        if is_user(entry) {
            seen += 1;
            if seen == n {
                return idx;
            }
        }
    }
    0
}

/// Keep only the last `n` user turns (with their paired assistant and tool
/// entries). Used for configured DM history limits.
pub fn trim_to_last_user_turns(entries: &[HistoryEntry], n: usize) -> Vec<HistoryEntry> {
    let start = turn_boundary_from_end(entries, n);
    entries[start..].to_vec()
}

/// Split history into an older prefix and the recent window of the last
/// `window_size` user turns, for rolling summarisation.
pub fn split_recent_window(
    entries: &[HistoryEntry],
    window_size: usize,
) -> (Vec<HistoryEntry>, Vec<HistoryEntry>) {
    let start = turn_boundary_from_end(entries, window_size);
    (entries[..start].to_vec(), entries[start..].to_vec())
}

/// Outcome of a token trim.
#[derive(Debug, Clone)]
pub struct TrimOutcome {
    pub selected: Vec<HistoryEntry>,
    pub dropped: usize,
    /// The preserved recent turns alone exceed the budget. The caller
    /// surfaces an OverBudget warning but still issues the call.
    pub over_budget: bool,
}

/// Trim oldest-first to fit `budget` tokens.
///
/// The last `preserve_recent_turns` user turns are always kept, even when
/// they alone exceed the budget — a single huge recent turn is a correctness
/// signal, not something to silently drop. After the drop point is computed
/// it advances forward to the next `user` entry so the first surviving
/// message starts a turn.
pub fn token_trim(
    entries: &[HistoryEntry],
    budget: u64,
    preserve_recent_turns: usize,
) -> TrimOutcome {
    let total = estimate_history_tokens(entries);
    if total <= budget {
        return TrimOutcome {
            selected: entries.to_vec(),
            dropped: 0,
            over_budget: false,
        };
    }

    let preserve_start = turn_boundary_from_end(entries, preserve_recent_turns);
    let preserved_tokens = estimate_history_tokens(&entries[preserve_start..]);

    if preserved_tokens > budget {
        // Nothing older survives; the preserved tail itself is over budget.
        return TrimOutcome {
            selected: entries[preserve_start..].to_vec(),
            dropped: preserve_start,
            over_budget: true,
        };
    }

    // Drop from the older prefix, oldest first, until the rest fits.
    let mut drop_until = 0;
    let mut running = total;
    while drop_until < preserve_start && running > budget {
        running -= estimate_entry_tokens(&entries[drop_until]);
        drop_until += 1;
    }

    // Boundary alignment: the first surviving message must start a turn.
    while drop_until < preserve_start && !is_user(&entries[drop_until]) {
        drop_until += 1;
    }

    TrimOutcome {
        selected: entries[drop_until..].to_vec(),
        dropped: drop_until,
        over_budget: false,
    }
}
