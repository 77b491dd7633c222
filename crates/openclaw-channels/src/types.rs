//! Adapter contract and inbound/outbound message shapes.

use async_trait::async_trait;
use futures::Stream;
use openclaw_types::config::ChannelConfig;
use openclaw_types::error::OpenClawResult;
use openclaw_types::session::SessionKey;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A file or media reference carried alongside a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub url: String,
}

/// A normalised inbound message, ready for `agent.invoke`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub session_key: SessionKey,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub sender_id: String,
}

/// Outbound payloads an adapter can deliver.
#[derive(Debug, Clone)]
pub enum OutboundContent {
    Text(String),
}

/// The contract every messaging channel implements.
///
/// `startup` yields the adapter's inbound stream; the gateway consumes it
/// and routes each message through DM gating into `agent.invoke`. Egress is
/// the adapter's own subscription to `chat.delta` / `chat.message_end` for
/// its sessions, delivered through `send`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable provider id (lowercase alphanumeric), e.g. `"telegram"`.
    fn name(&self) -> &str;

    /// Connect to the provider and return the inbound message stream.
    async fn startup(
        &self,
        config: ChannelConfig,
    ) -> OpenClawResult<Pin<Box<dyn Stream<Item = InboundMessage> + Send>>>;

    /// Deliver an outbound message to a recipient on this channel.
    async fn send(&self, recipient: &str, content: OutboundContent) -> OpenClawResult<()>;

    /// Disconnect and stop the inbound stream.
    async fn shutdown(&self) -> OpenClawResult<()>;

    /// Current liveness snapshot for the periodic heartbeat.
    fn health(&self) -> crate::health::HealthReport;
}

/// Split a message into chunks that fit a channel's length limit.
///
/// Prefers breaking at the last newline in a window, then the last space,
/// and only then mid-word. Always splits on char boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = text.chars().collect();
    while rest.len() > max_len {
        let window = &rest[..max_len];
        let break_at = window
            .iter()
            .rposition(|c| *c == '\n')
            .or_else(|| window.iter().rposition(|c| *c == ' '))
            .map(|i| i + 1)
            .unwrap_or(max_len);
        let head: String = rest.drain(..break_at).collect();
        chunks.push(head.trim_end().to_string());
    }
    if !rest.is_empty() {
        chunks.push(rest.into_iter().collect());
    }
    chunks
}
