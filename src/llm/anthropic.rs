//! Anthropic Messages API client with SSE streaming.
//!
//! Decodes `content_block_delta` text fragments into live deltas and
//! accumulates `tool_use` blocks (id/name from `content_block_start`,
//! arguments from `input_json_delta` fragments) into the completed turn.

use crate::errors::{AnalystError, Result};
use crate::llm::{
    AssistantTurn, ChatProvider, ChatRequest, ChatStream, StreamEvent, ToolCall,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::warn;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    http_client: HttpClient,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_model(api_key, DEFAULT_MODEL.to_string())
    }

    pub fn with_model(api_key: String, model: String) -> Self {
        let base_url = std::env::var("ANTHROPIC_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| API_BASE.to_string());
        Self {
            api_key,
            http_client: HttpClient::new(),
            base_url,
            model,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": request.messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, request: ChatRequest) -> Result<ChatStream> {
        let body = self.build_body(&request);
        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalystError::Upstream(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AnalystError::Upstream(format!(
                "API returned {status}: {detail}"
            )));
        }

        Ok(decode_sse(response))
    }
}

fn decode_sse(response: reqwest::Response) -> ChatStream {
    let stream = try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        let mut state = TurnAccumulator::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| AnalystError::Upstream(format!("stream error: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some((split_idx, delim_len)) = find_event_boundary(&buffer) {
                let event_text = buffer[..split_idx].to_string();
                buffer.drain(..split_idx + delim_len);

                let Some(payload) = extract_data_payload(&event_text) else {
                    continue;
                };
                if payload.trim().is_empty() {
                    continue;
                }
                let event: Value = serde_json::from_str(payload.trim())
                    .map_err(|e| AnalystError::Upstream(format!("bad stream event: {e}")))?;
                if let Some(delta) = state.apply(&event)? {
                    yield StreamEvent::TextDelta(delta);
                }
            }
        }

        yield StreamEvent::Completed(state.finish());
    };
    Box::pin(stream)
}

/// Boundary between SSE events: a blank line, either LF or CRLF framed.
fn find_event_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Concatenated `data:` lines of one SSE event.
fn extract_data_payload(event_text: &str) -> Option<String> {
    let mut payload = String::new();
    for line in event_text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            payload.push_str(rest.trim_start());
        }
    }
    if payload.is_empty() { None } else { Some(payload) }
}

#[derive(Default)]
struct PartialToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Accumulates stream events into a completed [`AssistantTurn`].
#[derive(Default)]
struct TurnAccumulator {
    text: String,
    // Keyed by content block index; text blocks leave a None slot.
    tools: Vec<Option<PartialToolUse>>,
    stop_reason: Option<String>,
}

impl TurnAccumulator {
    /// Apply one decoded event; returns a text delta to forward, if any.
    fn apply(&mut self, event: &Value) -> Result<Option<String>> {
        match event.get("type").and_then(|t| t.as_str()) {
            Some("content_block_start") => {
                let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                let block = &event["content_block"];
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    self.slot(index).replace(PartialToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input_json: String::new(),
                    });
                }
                Ok(None)
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                let delta = &event["delta"];
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_string();
                        self.text.push_str(&text);
                        Ok(Some(text))
                    }
                    Some("input_json_delta") => {
                        let fragment = delta["partial_json"].as_str().unwrap_or_default();
                        if let Some(tool) = self.slot(index) {
                            tool.input_json.push_str(fragment);
                        }
                        Ok(None)
                    }
                    _ => Ok(None),
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                Ok(None)
            }
            Some("error") => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                Err(AnalystError::Upstream(message.to_string()))
            }
            // message_start, content_block_stop, message_stop, ping
            _ => Ok(None),
        }
    }

    fn slot(&mut self, index: usize) -> &mut Option<PartialToolUse> {
        if self.tools.len() <= index {
            self.tools.resize_with(index + 1, || None);
        }
        &mut self.tools[index]
    }

    fn finish(self) -> AssistantTurn {
        let tool_calls = self
            .tools
            .into_iter()
            .flatten()
            .map(|tool| {
                let input = if tool.input_json.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&tool.input_json).unwrap_or_else(|e| {
                        warn!("unparseable tool input from stream: {e}");
                        json!({})
                    })
                };
                ToolCall {
                    id: tool.id,
                    name: tool.name,
                    input,
                }
            })
            .collect();

        AssistantTurn {
            text: self.text,
            tool_calls,
            stop_reason: self.stop_reason,
        }
    }
}
