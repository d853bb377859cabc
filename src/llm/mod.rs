//! Model capability boundary.
//!
//! The invocation loop drives any [`ChatProvider`]: it hands over a system
//! prompt, conversation history, and a declared tool interface, and consumes
//! a stream of text deltas ending in a completed assistant turn that may
//! carry tool invocation requests.

pub mod anthropic;

use crate::errors::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content block in Anthropic message shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Tool results travel back as a user message of `tool_result` blocks.
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        Self {
            role: Role::User,
            content: results
                .into_iter()
                .map(|(tool_use_id, content)| ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                })
                .collect(),
        }
    }
}

/// A tool declared to the model: name, natural-language description, and a
/// JSON schema for its input.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A model-requested tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// The fully assembled assistant turn a stream resolves to.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<String>,
}

impl AssistantTurn {
    /// Re-encode the turn as history blocks for the next round trip.
    pub fn into_message(self) -> ChatMessage {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text { text: self.text });
        }
        for call in self.tool_calls {
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: call.input,
            });
        }
        ChatMessage {
            role: Role::Assistant,
            content,
        }
    }
}

#[derive(Debug)]
pub enum StreamEvent {
    /// Incremental assistant text, streamed to the caller as it arrives.
    TextDelta(String),
    /// Terminal event carrying the assembled turn.
    Completed(AssistantTurn),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// Universal chat-completion provider.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Stream one completion for the request.
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_turn_reencodes_as_history_blocks() {
        let turn = AssistantTurn {
            text: "let me check".to_string(),
            tool_calls: vec![ToolCall {
                id: "toolu_1".to_string(),
                name: "runPython".to_string(),
                input: serde_json::json!({"code": "print(1)"}),
            }],
            stop_reason: Some("tool_use".to_string()),
        };

        let message = turn.into_message();
        assert!(matches!(message.role, Role::Assistant));
        assert_eq!(message.content.len(), 2);
        assert!(matches!(message.content[0], ContentBlock::Text { .. }));
        assert!(
            matches!(message.content[1], ContentBlock::ToolUse { ref name, .. } if name == "runPython")
        );
    }

    #[test]
    fn content_blocks_serialize_with_type_tags() {
        let message = ChatMessage::tool_results(vec![(
            "toolu_1".to_string(),
            "{\"logs\":\"ok\"}".to_string(),
        )]);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][0]["type"], "tool_result");
        assert_eq!(value["content"][0]["tool_use_id"], "toolu_1");
    }
}
