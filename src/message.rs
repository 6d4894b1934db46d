//! Conversation data model shared by every component.
//!
//! `Message`, `ToolCall` and `TokenUsage` are the only types that cross the boundary
//! between the orchestrator and the external conversation store; everything else in
//! this module (`ToolCallBuffer`, `Delta`, `StreamChunk`) is internal to the streaming
//! pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

/// A conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One element of a conversation.
///
/// Invariants (enforced by construction, not at runtime):
/// - a `Tool` message always carries `tool_call_id`.
/// - an `Assistant` message may have empty `content` only when `tool_calls` is
///   `Some` (a protocol placeholder, never persisted on its own).
/// - messages are appended, never mutated, once pushed into a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A single tool invocation request, fully reassembled.
///
/// `arguments` is kept as a string (not a parsed `Value`) because the wire payload may
/// be JSON (OpenAI dialect) or a flattened JSON object synthesized from an XML dialect
/// — callers that need structured access parse it themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub name: String,
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Dispatchable iff `name` is non-empty and `arguments` is a non-empty balanced
    /// JSON object. Dialect-specific completeness is decided earlier, in the
    /// reassembler; by the time a `ToolCall` exists it is always JSON.
    pub fn is_dispatchable(&self) -> bool {
        if self.name.is_empty() {
            return false;
        }
        matches!(serde_json::from_str::<Value>(&self.arguments), Ok(Value::Object(_)))
    }

    /// Canonical `name(sorted-key=value, ...)` form used for deduplication.
    pub fn signature(&self) -> String {
        let args: Value = serde_json::from_str(&self.arguments).unwrap_or(Value::Null);
        let mut pairs: Vec<(String, String)> = match &args {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            _ => Vec::new(),
        };
        pairs.sort();
        let body = pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.name, body)
    }
}

/// Description of a tool sent to the LLM as part of the request's `tools` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of executing a tool call, fed back into the conversation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Token accounting for one completed turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: Option<u64>,
}

/// Mutable accumulator for one in-progress tool call, keyed in the reassembler's
/// buffer table by `id`.
#[derive(Debug, Clone)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub dialect: Option<crate::dialect::Dialect>,
    pub last_updated: Instant,
    /// `true` once `id` was synthesized locally rather than supplied by the LLM.
    pub synthetic_id: bool,
}

impl ToolCallBuffer {
    pub fn new(id: String, synthetic_id: bool) -> Self {
        Self {
            id,
            name: String::new(),
            arguments: String::new(),
            dialect: None,
            last_updated: Instant::now(),
            synthetic_id,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Instant::now();
    }
}

/// A per-choice incremental update within one `StreamChunk`.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub thinking: Option<String>,
    pub thinking_encrypted: bool,
    pub tool_call_fragments: Vec<ToolCallFragment>,
}

/// One piece of a tool call as it arrives on the wire; `id`/`name`/`arguments` are all
/// optional because a single fragment rarely carries all three at once.
#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One parsed SSE event.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub choices: Vec<StreamChoice>,
    pub usage: Option<TokenUsage>,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}
