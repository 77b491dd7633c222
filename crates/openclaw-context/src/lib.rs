//! Context management engine.
//!
//! For each pending user turn the engine produces a model input — system
//! prompt, bootstrap preamble, and selected history — whose token estimate
//! fits the context window's history portion. Given identical inputs and
//! knobs the output is byte-identical.

pub mod budget;
pub mod retrieval;
pub mod selection;
pub mod summarizer;

use budget::{allocate, reclaim};
use openclaw_types::config::ContextManagementConfig;
use openclaw_types::estimate::{estimate_history_tokens, estimate_tokens};
use openclaw_types::session::HistoryEntry;
use retrieval::MemorySearch;
use selection::{
    latest_summary, selectable_entries, split_recent_window, token_trim, trim_to_last_user_turns,
    TrimOutcome, DEFAULT_PRESERVE_RECENT_TURNS,
};
use summarizer::{summarize_older, ProducedSummary, SummaryModel};
use tracing::{debug, warn};

/// Everything the engine needs to assemble one call.
pub struct AssembleRequest<'a> {
    pub system_prompt: &'a str,
    /// Agent identity documents, rendered in order.
    pub bootstrap_docs: &'a str,
    /// Full session history (summaries and unknown kinds included).
    pub history: &'a [HistoryEntry],
    /// The user message about to be appended; drives retrieval.
    pub pending_user_text: &'a str,
    pub context_window: u64,
    /// Channel-configured turn cap; takes precedence over every other
    /// selection strategy.
    pub dm_history_limit: Option<usize>,
}

/// The assembled model input.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub system_prompt: String,
    /// Identity docs plus summary and retrieval preambles.
    pub bootstrap: String,
    pub history: Vec<HistoryEntry>,
    /// Tokens reserved for the model's response.
    pub response_budget: u64,
    /// OverBudget and summariser-failure warnings; the call proceeds anyway.
    pub warnings: Vec<String>,
    /// A summary produced this turn, for the runtime to append to the log.
    pub new_summary: Option<ProducedSummary>,
}

/// The engine: configuration plus the selection pipeline.
pub struct ContextEngine {
    config: ContextManagementConfig,
    preserve_recent_turns: usize,
}

impl ContextEngine {
    pub fn new(config: ContextManagementConfig) -> Self {
        Self {
            config,
            preserve_recent_turns: DEFAULT_PRESERVE_RECENT_TURNS,
        }
    }

    /// Assemble the model input for one turn.
    ///
    /// `summary_model` and `search` are optional backends; when absent (or
    /// disabled in config) the corresponding strategy is skipped.
    pub async fn assemble(
        &self,
        req: AssembleRequest<'_>,
        summary_model: Option<&dyn SummaryModel>,
        search: Option<&dyn MemorySearch>,
    ) -> ModelInput {
        let mut warnings = Vec::new();

        // A zero window cannot carry history at all.
        if req.context_window == 0 {
            warnings.push("context window is zero; sending empty history".to_string());
            return ModelInput {
                system_prompt: req.system_prompt.to_string(),
                bootstrap: req.bootstrap_docs.to_string(),
                history: Vec::new(),
                response_budget: 1,
                warnings,
                new_summary: None,
            };
        }

        let plan = allocate(req.context_window, &self.config.budget);
        let entries = selectable_entries(req.history);

        // Existing rolling summary travels as preamble, not as history.
        let existing_summary = latest_summary(req.history).and_then(|e| match &e.payload {
            openclaw_types::session::EntryPayload::Summary { text, .. } => Some(text.clone()),
            _ => None,
        });

        // Retrieval is charged against the bootstrap slice.
        let docs_tokens = estimate_tokens(req.bootstrap_docs);
        let retrieval_preamble = match (self.config.enabled, self.config.semantic_history.enabled, search)
        {
            (true, true, Some(search)) => {
                let retrieval_budget = plan.bootstrap.saturating_sub(docs_tokens);
                retrieval::retrieve_preamble(
                    search,
                    &self.config.semantic_history,
                    req.pending_user_text,
                    retrieval_budget,
                )
                .await
            }
            _ => None,
        };

        let render_bootstrap = |summary: &Option<String>| -> String {
            let mut parts = Vec::new();
            if !req.bootstrap_docs.is_empty() {
                parts.push(req.bootstrap_docs.to_string());
            }
            if let Some(text) = summary {
                parts.push(format!("## Conversation so far\n{text}"));
            }
            if let Some(ref preamble) = retrieval_preamble {
                parts.push(preamble.clone());
            }
            parts.join("\n\n")
        };

        let bootstrap = render_bootstrap(&existing_summary);
        let actual_system = estimate_tokens(req.system_prompt);
        let reclaimed = reclaim(&plan, actual_system, estimate_tokens(&bootstrap));
        warnings.extend(reclaimed.warnings.clone());
        let history_budget = reclaimed.history;

        // Strategy 1: configured DM turn limit wins outright. The token trim
        // behind it only guards against a limit that still overflows.
        if let Some(limit) = req.dm_history_limit {
            let limited = trim_to_last_user_turns(&entries, limit);
            let outcome = token_trim(&limited, history_budget, self.preserve_recent_turns);
            self.note_over_budget(&outcome, &mut warnings);
            return ModelInput {
                system_prompt: req.system_prompt.to_string(),
                bootstrap,
                history: outcome.selected,
                response_budget: plan.response,
                warnings,
                new_summary: None,
            };
        }

        // Strategy 2: rolling summarisation.
        let history_tokens = estimate_history_tokens(&entries);
        let trigger = self
            .config
            .rolling_summary
            .trigger_threshold
            .min((history_budget as f64 * 0.8) as u64);
        if self.config.enabled
            && self.config.rolling_summary.enabled
            && history_tokens > trigger
        {
            if let Some(model) = summary_model {
                let (older, recent) =
                    split_recent_window(&entries, self.config.rolling_summary.window_size);
                if !older.is_empty() {
                    match summarize_older(
                        model,
                        &older,
                        req.context_window,
                        self.config.rolling_summary.summary_max_tokens,
                    )
                    .await
                    {
                        Ok(produced) => {
                            let new_text = Some(produced.text.clone());
                            let bootstrap = render_bootstrap(&new_text);
                            let reclaimed =
                                reclaim(&plan, actual_system, estimate_tokens(&bootstrap));
                            let outcome = token_trim(
                                &recent,
                                reclaimed.history,
                                self.preserve_recent_turns,
                            );
                            let mut warnings = warnings;
                            warnings.extend(reclaimed.warnings);
                            self.note_over_budget(&outcome, &mut warnings);
                            debug!(
                                covers_turns = produced.covers_turns,
                                original_tokens = produced.original_tokens,
                                "rolling summary produced"
                            );
                            return ModelInput {
                                system_prompt: req.system_prompt.to_string(),
                                bootstrap,
                                history: outcome.selected,
                                response_budget: plan.response,
                                warnings,
                                new_summary: Some(produced),
                            };
                        }
                        Err(e) => {
                            // Fall back to pure token trim; the existing
                            // summary (if any) is retained verbatim.
                            warn!(error = %e, "summariser failed — falling back to token trim");
                            warnings.push(format!("summariser failed: {e}"));
                        }
                    }
                }
            }
        }

        // Strategy 3: plain token trim.
        let outcome = token_trim(&entries, history_budget, self.preserve_recent_turns);
        self.note_over_budget(&outcome, &mut warnings);
        ModelInput {
            system_prompt: req.system_prompt.to_string(),
            bootstrap,
            history: outcome.selected,
            response_budget: plan.response,
            warnings,
            new_summary: None,
        }
    }

    fn note_over_budget(&self, outcome: &TrimOutcome, warnings: &mut Vec<String>) {
        if outcome.over_budget {
            warnings.push(format!(
                "history over budget: preserved {} recent turns exceed the history slice",
                self.preserve_recent_turns
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use openclaw_types::config::{BudgetConfig, RollingSummaryConfig};
    use openclaw_types::session::{EntryPayload, StopReason, TokenUsage};

    fn user(text: &str) -> HistoryEntry {
        HistoryEntry::new(EntryPayload::User {
            text: text.into(),
            sender_id: None,
        })
    }

    fn assistant(text: &str) -> HistoryEntry {
        HistoryEntry::new(EntryPayload::Assistant {
            text: text.into(),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        })
    }

    fn turns(n: usize, width: usize) -> Vec<HistoryEntry> {
        let mut entries = Vec::new();
        for i in 0..n {
            entries.push(user(&format!("q{i} {}", "x".repeat(width))));
            entries.push(assistant(&format!("a{i} {}", "y".repeat(width))));
        }
        entries
    }

    fn engine(enabled: bool, rolling: bool) -> ContextEngine {
        ContextEngine::new(ContextManagementConfig {
            enabled,
            budget: BudgetConfig::default(),
            rolling_summary: RollingSummaryConfig {
                enabled: rolling,
                window_size: 2,
                summary_max_tokens: 256,
                trigger_threshold: 100,
            },
            semantic_history: Default::default(),
        })
    }

    struct OkModel;

    #[async_trait]
    impl SummaryModel for OkModel {
        async fn summarize(&self, _prompt: String, _max: u64) -> Result<String, String> {
            Ok("the user asked several numbered questions".to_string())
        }
        fn model_id(&self) -> String {
            "claude-3.5-haiku".into()
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl SummaryModel for BrokenModel {
        async fn summarize(&self, _prompt: String, _max: u64) -> Result<String, String> {
            Err("rate limited".to_string())
        }
        fn model_id(&self) -> String {
            "claude-3.5-haiku".into()
        }
    }

    fn req<'a>(
        history: &'a [HistoryEntry],
        window: u64,
        dm_limit: Option<usize>,
    ) -> AssembleRequest<'a> {
        AssembleRequest {
            system_prompt: "You are a helpful assistant.",
            bootstrap_docs: "# Soul\nBe kind.",
            history,
            pending_user_text: "next question",
            context_window: window,
            dm_history_limit: dm_limit,
        }
    }

    #[tokio::test]
    async fn test_zero_window_empty_history() {
        let history = turns(3, 10);
        let input = engine(true, false)
            .assemble(req(&history, 0, None), None, None)
            .await;
        assert!(input.history.is_empty());
        assert_eq!(input.response_budget, 1);
        assert!(!input.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_dm_limit_takes_precedence() {
        let history = turns(5, 10);
        let input = engine(true, true)
            .assemble(req(&history, 200_000, Some(3)), Some(&OkModel), None)
            .await;
        // 3 user turns and their paired assistant entries.
        assert_eq!(input.history.len(), 6);
        assert!(input.new_summary.is_none());
    }

    #[tokio::test]
    async fn test_rolling_summary_path() {
        // Enough history to cross the 100-token trigger.
        let history = turns(10, 100);
        let input = engine(true, true)
            .assemble(req(&history, 200_000, None), Some(&OkModel), None)
            .await;
        let produced = input.new_summary.expect("summary expected");
        assert!(produced.covers_turns >= 8);
        assert!(input.bootstrap.contains("numbered questions"));
        // Recent window is the last 2 user turns.
        assert_eq!(input.history.len(), 4);
    }

    #[tokio::test]
    async fn test_summary_failure_falls_back_to_trim() {
        let history = turns(10, 100);
        let input = engine(true, true)
            .assemble(req(&history, 200_000, None), Some(&BrokenModel), None)
            .await;
        assert!(input.new_summary.is_none());
        assert!(input
            .warnings
            .iter()
            .any(|w| w.contains("summariser failed")));
        // Never drops to nothing.
        assert!(!input.history.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_skips_summary() {
        let history = turns(10, 100);
        let input = engine(false, true)
            .assemble(req(&history, 200_000, None), Some(&OkModel), None)
            .await;
        assert!(input.new_summary.is_none());
    }

    #[tokio::test]
    async fn test_huge_recent_turn_kept_with_warning() {
        let mut history = turns(1, 10);
        history.push(user(&"z".repeat(900_000)));
        let input = engine(true, false)
            .assemble(req(&history, 1_000, None), None, None)
            .await;
        assert!(input
            .warnings
            .iter()
            .any(|w| w.contains("over budget")));
        assert!(input
            .history
            .iter()
            .any(|e| matches!(&e.payload, EntryPayload::User { text, .. } if text.len() > 100_000)));
    }

    #[tokio::test]
    async fn test_deterministic_output() {
        let history = turns(8, 50);
        let engine = engine(true, false);
        let a = engine.assemble(req(&history, 50_000, None), None, None).await;
        let b = engine.assemble(req(&history, 50_000, None), None, None).await;
        assert_eq!(a.system_prompt, b.system_prompt);
        assert_eq!(a.bootstrap, b.bootstrap);
        assert_eq!(a.history.len(), b.history.len());
        assert_eq!(a.response_budget, b.response_budget);
    }

    #[tokio::test]
    async fn test_existing_summary_rides_in_bootstrap() {
        let mut history = turns(2, 10);
        history.push(HistoryEntry::new(EntryPayload::Summary {
            text: "previously: picked the blue theme".into(),
            covers_turns: 4,
            original_tokens: 500,
            model: "claude-3.5-haiku".into(),
            supersedes: None,
        }));
        history.extend(turns(1, 10));
        let input = engine(true, false)
            .assemble(req(&history, 200_000, None), None, None)
            .await;
        assert!(input.bootstrap.contains("blue theme"));
        // The summary entry itself is not part of selected history.
        assert!(input.history.iter().all(|e| e.kind() != "summary"));
    }
}
