//! OpenAI-compatible streaming driver.
//!
//! Speaks `POST {base}/chat/completions` with `stream: true` and parses the
//! SSE response line by line. Tool-call argument deltas are accumulated per
//! index and emitted as whole [`ProviderEvent::ToolCall`]s when the stream
//! finishes, so downstream code never sees partial JSON.

use crate::provider::{CompletionRequest, ModelProvider, ProviderEvent, ProviderMessage};
use async_trait::async_trait;
use futures::StreamExt;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::session::{StopReason, TokenUsage};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub struct OpenAiCompatProvider {
    name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(name: &str, api_key: String, base_url: String) -> Self {
        Self {
            name: name.to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        for msg in &request.messages {
            match msg {
                ProviderMessage::User { content } => {
                    messages.push(json!({"role": "user", "content": content}));
                }
                ProviderMessage::Assistant { content } => {
                    messages.push(json!({"role": "assistant", "content": content}));
                }
                ProviderMessage::AssistantToolCall {
                    call_id,
                    tool,
                    args,
                } => {
                    messages.push(json!({
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": call_id,
                            "type": "function",
                            "function": {"name": tool, "arguments": args.to_string()}
                        }]
                    }));
                }
                ProviderMessage::ToolResult {
                    call_id, content, ..
                } => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": content
                    }));
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.schema,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

/// Tool-call accumulator: one slot per streamed tool_calls index.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        events: mpsc::Sender<ProviderEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> OpenClawResult<()> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request);

        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| OpenClawError::ModelUnavailable(format!("{}: {e}", self.name)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(provider = %self.name, %status, "completion request rejected");
            return Err(match status.as_u16() {
                429 => OpenClawError::RateLimited,
                401 | 403 => OpenClawError::AuthExpired,
                _ => OpenClawError::ModelUnavailable(format!(
                    "{}: HTTP {status}: {}",
                    self.name,
                    text.chars().take(256).collect::<String>()
                )),
            });
        }

        let mut stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut pending_tools: BTreeMap<u64, PendingToolCall> = BTreeMap::new();
        let mut usage = TokenUsage::default();
        let mut stop_reason = StopReason::EndTurn;
        let mut saw_done = false;
        let mut cancel_live = true;

        'outer: loop {
            let chunk = tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        return Err(OpenClawError::ModelUnavailable(format!(
                            "{}: stream error: {e}",
                            self.name
                        )))
                    }
                    None => break 'outer,
                },
                changed = cancel.changed(), if cancel_live => {
                    if changed.is_err() {
                        // Cancel source gone; the call simply runs out.
                        cancel_live = false;
                    } else if *cancel.borrow() {
                        debug!(provider = %self.name, "completion cancelled mid-stream");
                        let _ = events
                            .send(ProviderEvent::MessageEnd {
                                stop_reason: StopReason::Cancelled,
                                usage,
                            })
                            .await;
                        return Ok(());
                    }
                    continue;
                }
            };

            line_buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=newline).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    saw_done = true;
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(data) else {
                    continue;
                };

                if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
                    usage.input_tokens = u["prompt_tokens"].as_u64().unwrap_or(0);
                    usage.output_tokens = u["completion_tokens"].as_u64().unwrap_or(0);
                }

                let Some(choice) = value["choices"].get(0) else {
                    continue;
                };

                if let Some(text) = choice["delta"]["content"].as_str() {
                    if !text.is_empty()
                        && events
                            .send(ProviderEvent::TextDelta {
                                text: text.to_string(),
                            })
                            .await
                            .is_err()
                    {
                        break 'outer;
                    }
                }

                if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
                    for call in calls {
                        let index = call["index"].as_u64().unwrap_or(0);
                        let slot = pending_tools.entry(index).or_default();
                        if let Some(id) = call["id"].as_str() {
                            slot.id = id.to_string();
                        }
                        if let Some(name) = call["function"]["name"].as_str() {
                            slot.name.push_str(name);
                        }
                        if let Some(args) = call["function"]["arguments"].as_str() {
                            slot.arguments.push_str(args);
                        }
                    }
                }

                if let Some(reason) = choice["finish_reason"].as_str() {
                    stop_reason = match reason {
                        "tool_calls" => StopReason::ToolUse,
                        "length" => StopReason::MaxTokens,
                        _ => StopReason::EndTurn,
                    };
                }
            }
        }

        if !saw_done && pending_tools.is_empty() && stop_reason == StopReason::EndTurn {
            debug!(provider = %self.name, "stream ended without [DONE]");
        }

        for (_, call) in pending_tools {
            let args = serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| Value::String(call.arguments.clone()));
            let _ = events
                .send(ProviderEvent::ToolCall {
                    call_id: if call.id.is_empty() {
                        format!("call-{}", uuid::Uuid::new_v4())
                    } else {
                        call.id
                    },
                    tool: call.name,
                    args,
                })
                .await;
        }

        let _ = events
            .send(ProviderEvent::MessageEnd { stop_reason, usage })
            .await;
        Ok(())
    }
}
