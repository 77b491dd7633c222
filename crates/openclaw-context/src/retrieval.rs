//! Semantic retrieval — packs prior-context chunks into the bootstrap slice.
//!
//! The search backend is pluggable; the engine filters by relevance score
//! and packs as many chunks as fit the dedicated budget. A final chunk may
//! be truncated to fit only when at least 100 tokens of it remain.

use async_trait::async_trait;
use openclaw_types::config::SemanticHistoryConfig;
use openclaw_types::estimate::estimate_tokens;
use tracing::debug;

/// Minimum tokens a truncated final chunk must retain to be worth keeping.
const MIN_TRUNCATED_CHUNK_TOKENS: u64 = 100;

/// Opening tag of the injected preamble.
pub const CONTEXT_TAG_OPEN: &str = "<relevant-prior-context>";
/// Closing tag of the injected preamble.
pub const CONTEXT_TAG_CLOSE: &str = "</relevant-prior-context>";

/// One scored result from the memory search backend.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f64,
}

/// Pluggable vector/memory search provider.
#[async_trait]
pub trait MemorySearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RetrievedChunk>, String>;
}

/// Query the backend and pack results into a tagged preamble.
///
/// Returns `None` when nothing relevant fits. The preamble's token count is
/// charged against the bootstrap slice by the engine.
pub async fn retrieve_preamble(
    search: &dyn MemorySearch,
    config: &SemanticHistoryConfig,
    query: &str,
    token_budget: u64,
) -> Option<String> {
    let chunks = match search.search(query, config.max_retrieved_chunks).await {
        Ok(chunks) => chunks,
        Err(e) => {
            debug!(error = %e, "memory search failed — continuing without retrieval");
            return None;
        }
    };

    let packed = pack_chunks(&chunks, config, token_budget);
    if packed.is_empty() {
        return None;
    }
    Some(format!(
        "{CONTEXT_TAG_OPEN}\n{}\n{CONTEXT_TAG_CLOSE}",
        packed.join("\n---\n")
    ))
}

/// Filter by relevance and fit chunks into the budget, in score order.
fn pack_chunks(
    chunks: &[RetrievedChunk],
    config: &SemanticHistoryConfig,
    token_budget: u64,
) -> Vec<String> {
    let mut relevant: Vec<&RetrievedChunk> = chunks
        .iter()
        .filter(|c| c.score >= config.min_relevance_score)
        .collect();
    relevant.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    relevant.truncate(config.max_retrieved_chunks);

    let mut out = Vec::new();
    let mut remaining = token_budget;
    for chunk in relevant {
        let tokens = estimate_tokens(&chunk.text);
        if tokens <= remaining {
            remaining -= tokens;
            out.push(chunk.text.clone());
            continue;
        }
        // Truncation of a final chunk is allowed only if a meaningful
        // amount of it survives; otherwise the chunk is dropped.
        if remaining >= MIN_TRUNCATED_CHUNK_TOKENS {
            let keep_chars = (remaining * 4) as usize;
            let truncated: String = chunk.text.chars().take(keep_chars).collect();
            out.push(truncated);
        }
        break;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSearch(Vec<RetrievedChunk>);

    #[async_trait]
    impl MemorySearch for FixedSearch {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<RetrievedChunk>, String> {
            Ok(self.0.clone())
        }
    }

    struct FailingSearch;

    #[async_trait]
    impl MemorySearch for FailingSearch {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<RetrievedChunk>, String> {
            Err("backend down".to_string())
        }
    }

    fn config() -> SemanticHistoryConfig {
        SemanticHistoryConfig {
            enabled: true,
            max_retrieved_chunks: 5,
            min_relevance_score: 0.35,
        }
    }

    fn chunk(text: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            text: text.to_string(),
            score,
        }
    }

    #[tokio::test]
    async fn test_preamble_tagged_and_filtered() {
        let search = FixedSearch(vec![
            chunk("the user prefers metric units", 0.9),
            chunk("irrelevant noise", 0.1),
        ]);
        let preamble = retrieve_preamble(&search, &config(), "units?", 10_000)
            .await
            .unwrap();
        assert!(preamble.starts_with(CONTEXT_TAG_OPEN));
        assert!(preamble.ends_with(CONTEXT_TAG_CLOSE));
        assert!(preamble.contains("metric units"));
        assert!(!preamble.contains("irrelevant noise"));
    }

    #[tokio::test]
    async fn test_backend_failure_yields_none() {
        assert!(
            retrieve_preamble(&FailingSearch, &config(), "q", 10_000)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_nothing_relevant_yields_none() {
        let search = FixedSearch(vec![chunk("noise", 0.05)]);
        assert!(retrieve_preamble(&search, &config(), "q", 10_000)
            .await
            .is_none());
    }

    #[test]
    fn test_pack_respects_chunk_cap() {
        let chunks: Vec<RetrievedChunk> =
            (0..10).map(|i| chunk(&format!("chunk {i}"), 0.9)).collect();
        let packed = pack_chunks(&chunks, &config(), 100_000);
        assert_eq!(packed.len(), 5);
    }

    #[test]
    fn test_pack_orders_by_score() {
        let chunks = vec![chunk("low", 0.5), chunk("high", 0.95)];
        let packed = pack_chunks(&chunks, &config(), 100_000);
        assert_eq!(packed[0], "high");
    }

    #[test]
    fn test_final_chunk_truncated_when_enough_remains() {
        // Budget 150 tokens; first chunk 100, second chunk 400 — 50 tokens
        // remain, under the 100-token floor, so the second chunk drops.
        let chunks = vec![
            chunk(&"a".repeat(400), 0.9),
            chunk(&"b".repeat(1600), 0.8),
        ];
        let packed = pack_chunks(&chunks, &config(), 150);
        assert_eq!(packed.len(), 1);

        // Budget 250: 150 tokens remain for the second chunk — truncate.
        let packed = pack_chunks(&chunks, &config(), 250);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[1].chars().count(), 150 * 4);
    }

    #[test]
    fn test_zero_budget_packs_nothing() {
        let chunks = vec![chunk("anything", 0.9)];
        assert!(pack_chunks(&chunks, &config(), 0).is_empty());
    }
}
