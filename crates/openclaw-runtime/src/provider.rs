//! Model provider interface.
//!
//! Providers stream [`ProviderEvent`]s into a channel; the agent loop folds
//! them into blocks and tool dispatches. Cancellation uses a `watch` signal
//! so an in-flight call can be abandoned without poisoning the session.

use async_trait::async_trait;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::model_catalog::provider_defaults;
use openclaw_types::session::{StopReason, TokenUsage};
use openclaw_types::tool::ToolDescriptor;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// One message of the conversation sent to a provider.
#[derive(Debug, Clone)]
pub enum ProviderMessage {
    User { content: String },
    Assistant { content: String },
    AssistantToolCall {
        call_id: String,
        tool: String,
        args: Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

/// A complete request for one streaming model call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ProviderMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u64,
}

/// Incremental output from a streaming model call.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta { text: String },
    /// A complete tool invocation (drivers aggregate argument deltas).
    ToolCall {
        call_id: String,
        tool: String,
        args: Value,
    },
    MessageEnd {
        stop_reason: StopReason,
        usage: TokenUsage,
    },
}

/// A streaming model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Stream one completion. Events go to `events`; the call returns when
    /// the stream ends or errors. `cancel` flipping to true abandons the
    /// call as soon as practical.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        events: mpsc::Sender<ProviderEvent>,
        cancel: watch::Receiver<bool>,
    ) -> OpenClawResult<()>;
}

/// Create a provider for a named backend.
///
/// Known providers resolve their base URL and API key env var from the
/// catalog defaults; any unknown provider with an explicit `base_url` is
/// treated as OpenAI-compatible.
pub fn create_provider(
    provider: &str,
    api_key: Option<String>,
    base_url: Option<String>,
) -> OpenClawResult<Arc<dyn ModelProvider>> {
    if let Some(defaults) = provider_defaults(provider) {
        let api_key = api_key
            .or_else(|| std::env::var(defaults.api_key_env).ok())
            .unwrap_or_default();
        if defaults.key_required && api_key.is_empty() {
            return Err(OpenClawError::ModelUnavailable(format!(
                "set {} for provider `{provider}`",
                defaults.api_key_env
            )));
        }
        let base_url = base_url.unwrap_or_else(|| defaults.base_url.to_string());
        return Ok(Arc::new(crate::providers::openai::OpenAiCompatProvider::new(
            provider, api_key, base_url,
        )));
    }

    if let Some(base_url) = base_url {
        return Ok(Arc::new(crate::providers::openai::OpenAiCompatProvider::new(
            provider,
            api_key.unwrap_or_default(),
            base_url,
        )));
    }

    Err(OpenClawError::ModelUnavailable(format!(
        "unknown provider `{provider}` and no base_url configured"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_provider_without_key_fails() {
        std::env::remove_var("GROQ_API_KEY");
        assert!(create_provider("groq", None, None).is_err());
    }

    #[test]
    fn test_create_known_provider_with_explicit_key() {
        let provider = create_provider("groq", Some("k".into()), None).unwrap();
        assert_eq!(provider.name(), "groq");
    }

    #[test]
    fn test_create_local_provider_without_key() {
        let provider = create_provider("ollama", None, None).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn test_custom_provider_needs_base_url() {
        assert!(create_provider("my-llm", Some("k".into()), None).is_err());
        assert!(create_provider(
            "my-llm",
            Some("k".into()),
            Some("http://localhost:9999/v1".into())
        )
        .is_ok());
    }
}
