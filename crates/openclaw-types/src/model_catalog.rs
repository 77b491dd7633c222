//! Model catalog types — context windows and provider defaults.
//!
//! The catalog sizes context budgets and seeds the provider factory. Config
//! may override or extend entries under `models.<id>`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Canonical provider base URLs — single source of truth.
// ---------------------------------------------------------------------------

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub const VLLM_BASE_URL: &str = "http://localhost:8000/v1";

/// Fallback context window when a model is not in the catalog.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 128_000;

/// A single model entry in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    /// Canonical model identifier (e.g. "claude-3.5-sonnet").
    pub id: String,
    /// Provider identifier (e.g. "anthropic").
    pub provider: String,
    /// Context window size in tokens.
    pub context_window: u64,
    /// Maximum output tokens.
    pub max_output_tokens: u64,
    /// Whether the model supports streaming responses.
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    /// Aliases for this model (e.g. ["sonnet"]).
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Lookup table over catalog entries, by id or alias.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: HashMap<String, ModelCatalogEntry>,
}

impl ModelCatalog {
    /// Catalog seeded with the models this build knows about.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for entry in builtin_entries() {
            catalog.insert(entry);
        }
        catalog
    }

    /// Insert or replace an entry (config overrides win over builtins).
    pub fn insert(&mut self, entry: ModelCatalogEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Find by canonical id or alias.
    pub fn find(&self, id_or_alias: &str) -> Option<&ModelCatalogEntry> {
        self.entries.get(id_or_alias).or_else(|| {
            self.entries
                .values()
                .find(|e| e.aliases.iter().any(|a| a == id_or_alias))
        })
    }

    /// Context window for a model, falling back to the conservative default.
    pub fn context_window(&self, id_or_alias: &str) -> u64 {
        self.find(id_or_alias)
            .map(|e| e.context_window)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn builtin_entries() -> Vec<ModelCatalogEntry> {
    fn entry(
        id: &str,
        provider: &str,
        context_window: u64,
        max_output_tokens: u64,
        aliases: &[&str],
    ) -> ModelCatalogEntry {
        ModelCatalogEntry {
            id: id.to_string(),
            provider: provider.to_string(),
            context_window,
            max_output_tokens,
            supports_streaming: true,
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
        }
    }

    vec![
        entry("claude-3.5-sonnet", "anthropic", 200_000, 8_192, &["sonnet"]),
        entry("claude-3.5-haiku", "anthropic", 200_000, 8_192, &["haiku"]),
        entry("gpt-4o", "openai", 128_000, 16_384, &[]),
        entry("gpt-4o-mini", "openai", 128_000, 16_384, &["4o-mini"]),
        entry("deepseek-chat", "deepseek", 64_000, 8_192, &[]),
        entry(
            "llama-3.3-70b-versatile",
            "groq",
            128_000,
            32_768,
            &["llama-70b"],
        ),
        entry("mistral-large-latest", "mistral", 128_000, 8_192, &[]),
    ]
}

/// Provider metadata: base URL and env var name for the API key.
#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    pub base_url: &'static str,
    pub api_key_env: &'static str,
    /// If true, a missing API key is an error.
    pub key_required: bool,
}

/// Get defaults for known providers.
pub fn provider_defaults(provider: &str) -> Option<ProviderDefaults> {
    match provider {
        "anthropic" => Some(ProviderDefaults {
            base_url: ANTHROPIC_BASE_URL,
            api_key_env: "ANTHROPIC_API_KEY",
            key_required: true,
        }),
        "openai" => Some(ProviderDefaults {
            base_url: OPENAI_BASE_URL,
            api_key_env: "OPENAI_API_KEY",
            key_required: true,
        }),
        "groq" => Some(ProviderDefaults {
            base_url: GROQ_BASE_URL,
            api_key_env: "GROQ_API_KEY",
            key_required: true,
        }),
        "openrouter" => Some(ProviderDefaults {
            base_url: OPENROUTER_BASE_URL,
            api_key_env: "OPENROUTER_API_KEY",
            key_required: true,
        }),
        "deepseek" => Some(ProviderDefaults {
            base_url: DEEPSEEK_BASE_URL,
            api_key_env: "DEEPSEEK_API_KEY",
            key_required: true,
        }),
        "mistral" => Some(ProviderDefaults {
            base_url: MISTRAL_BASE_URL,
            api_key_env: "MISTRAL_API_KEY",
            key_required: true,
        }),
        "ollama" => Some(ProviderDefaults {
            base_url: OLLAMA_BASE_URL,
            api_key_env: "OLLAMA_API_KEY",
            key_required: false,
        }),
        "vllm" => Some(ProviderDefaults {
            base_url: VLLM_BASE_URL,
            api_key_env: "VLLM_API_KEY",
            key_required: false,
        }),
        _ => None,
    }
}
