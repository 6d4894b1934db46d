//! C1 — SSE/Delta Parser.
//!
//! Transforms a byte stream from a chat-completions endpoint into a finite, ordered
//! sequence of [`StreamChunk`]s. The line-splitting/JSON-decoding core
//! ([`SseParser::feed`]) is plain, synchronous and fully unit-testable; [`parse_stream`]
//! is the thin adapter that drives it over an async byte stream (the injected
//! transport — see `transport.rs` — is the only piece that knows about `reqwest`).

use crate::error::CoreError;
use crate::message::{Delta, StreamChoice, StreamChunk, TokenUsage, ToolCallFragment};
use crate::{dialect, recovery};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

const THINKING_FIELDS: &[&str] = &[
    "thinking",
    "reasoning_content",
    "encrypted_thinking",
    "encrypted_reasoning",
    "redacted_thinking",
];

const ENCRYPTED_THINKING_FIELDS: &[&str] = &["encrypted_thinking", "encrypted_reasoning", "redacted_thinking"];

/// Incremental line splitter + JSON decoder. One instance per request.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes`, splits on `\n`, and parses every complete line. Any trailing
    /// partial line is kept in the internal buffer for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]);
            if let Some(chunk) = parse_line(line.trim_end_matches('\r')) {
                chunks.push(chunk);
            }
        }
        chunks
    }
}

/// Parses a single already-newline-stripped SSE line. Returns `None` for anything
/// other than a `data: ` line, or for a malformed line the fallback parser also
/// couldn't salvage anything from.
pub fn parse_line(line: &str) -> Option<StreamChunk> {
    let body = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if body == "[DONE]" {
        return Some(StreamChunk {
            done: true,
            ..Default::default()
        });
    }

    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.get("choices").and_then(Value::as_array).is_some() => {
            Some(decode_openai_shape(value))
        }
        Ok(_) | Err(_) => fallback_parse(body),
    }
}

fn decode_openai_shape(value: Value) -> StreamChunk {
    let wire: WireChunk = serde_json::from_value(value).unwrap_or_default();
    let choices = wire
        .choices
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, choice)| decode_choice(i as u32, choice))
        .collect();

    StreamChunk {
        choices,
        usage: wire.usage.map(Into::into),
        done: false,
    }
}

fn decode_choice(index: u32, choice: WireChoice) -> StreamChoice {
    let index = choice.index.unwrap_or(index);
    let wire_delta = choice.delta.unwrap_or_default();

    let mut thinking = None;
    let mut thinking_encrypted = false;
    for field in THINKING_FIELDS {
        if let Some(text) = wire_delta.thinking_field(field) {
            if !text.is_empty() {
                thinking = Some(text);
                thinking_encrypted = ENCRYPTED_THINKING_FIELDS.contains(field);
                break;
            }
        }
    }

    let mut content = wire_delta.content.unwrap_or_default();
    if thinking.is_none() {
        if let Some((extracted_thinking, remaining)) = split_embedded_thinking(&content) {
            thinking = Some(extracted_thinking);
            content = remaining;
        }
    }

    let tool_call_fragments = wire_delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|f| ToolCallFragment {
            id: f.id,
            name: f.function.as_ref().and_then(|fun| fun.name.clone()),
            arguments: f.function.and_then(|fun| fun.arguments),
        })
        .collect();

    StreamChoice {
        index,
        delta: Delta {
            role: wire_delta.role.as_deref().and_then(role_from_str),
            content: if content.is_empty() { None } else { Some(content) },
            thinking,
            thinking_encrypted,
            tool_call_fragments,
        },
        finish_reason: choice.finish_reason,
    }
}

fn role_from_str(s: &str) -> Option<crate::message::Role> {
    match s {
        "user" => Some(crate::message::Role::User),
        "assistant" => Some(crate::message::Role::Assistant),
        "system" => Some(crate::message::Role::System),
        "tool" => Some(crate::message::Role::Tool),
        _ => None,
    }
}

/// Splits the first `<thinking>...</thinking>` block out of `content`, returning
/// `(thinking_text, remaining_content)`. Unclosed tags are left untouched — callers
/// get another pass once the closing tag eventually arrives.
fn split_embedded_thinking(content: &str) -> Option<(String, String)> {
    let start = content.find("<thinking>")?;
    let after = &content[start + "<thinking>".len()..];
    let end = after.find("</thinking>")?;
    let thinking = after[..end].to_string();
    let mut remaining = String::new();
    remaining.push_str(&content[..start]);
    remaining.push_str(&after[end + "</thinking>".len()..]);
    Some((thinking, remaining))
}

/// Non-OpenAI-shape fallback: the raw line is handed to the dialect-aware recovery
/// heuristics so at least a name and/or a raw argument slice can be salvaged. Returns
/// `None` if nothing useful could be extracted (the line is then logged and skipped).
fn fallback_parse(body: &str) -> Option<StreamChunk> {
    let dialect = dialect::detect(body);
    if dialect == dialect::Dialect::Unknown && recovery::extract_name(body).is_none() {
        log::warn!("sse: unparseable line dropped: {}", truncate_for_log(body));
        return None;
    }

    let fragment = ToolCallFragment {
        id: None,
        name: recovery::extract_name(body),
        arguments: Some(body.to_string()),
    };

    Some(StreamChunk {
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta {
                tool_call_fragments: vec![fragment],
                ..Default::default()
            },
            finish_reason: None,
        }],
        usage: None,
        done: false,
    })
}

fn truncate_for_log(s: &str) -> String {
    if s.len() > 200 {
        format!("{}...", &s[..200])
    } else {
        s.to_string()
    }
}

/// Drives an [`SseParser`] over an async byte stream, yielding [`StreamChunk`]s in
/// order. Terminates on the `[DONE]` chunk, on stream exhaustion, or on a transport
/// error (surfaced as `Err`, never as an extra chunk).
pub fn parse_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<StreamChunk, CoreError>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut parser = SseParser::new();
        futures::pin_mut!(byte_stream);
        while let Some(next) = byte_stream.next().await {
            match next {
                Ok(bytes) => {
                    for chunk in parser.feed(&bytes) {
                        let done = chunk.done;
                        yield Ok(chunk);
                        if done {
                            return;
                        }
                    }
                }
                Err(e) => {
                    yield Err(CoreError::Transport(e.to_string()));
                    return;
                }
            }
        }
    }
}

#[derive(Deserialize, Default)]
struct WireChunk {
    choices: Option<Vec<WireChoice>>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Default)]
struct WireChoice {
    index: Option<u32>,
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    role: Option<String>,
    content: Option<String>,
    thinking: Option<String>,
    reasoning_content: Option<String>,
    encrypted_thinking: Option<String>,
    encrypted_reasoning: Option<String>,
    redacted_thinking: Option<String>,
    tool_calls: Option<Vec<WireToolCallFragment>>,
}

impl WireDelta {
    fn thinking_field(&self, name: &str) -> Option<String> {
        match name {
            "thinking" => self.thinking.clone(),
            "reasoning_content" => self.reasoning_content.clone(),
            "encrypted_thinking" => self.encrypted_thinking.clone(),
            "encrypted_reasoning" => self.encrypted_reasoning.clone(),
            "redacted_thinking" => self.redacted_thinking.clone(),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct WireToolCallFragment {
    id: Option<String>,
    function: Option<WireFunctionFragment>,
}

#[derive(Deserialize)]
struct WireFunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
    reasoning_tokens: Option<u64>,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        Self {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
            reasoning_tokens: u.reasoning_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_done_marker() {
        let chunk = parse_line("data: [DONE]").unwrap();
        assert!(chunk.done);
    }

    #[test]
    fn ignores_non_data_lines() {
        assert!(parse_line(": heartbeat").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn parses_openai_content_delta() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":"hi"}}]}"#;
        let chunk = parse_line(line).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
        assert!(!chunk.done);
    }

    #[test]
    fn extracts_named_thinking_field() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"reasoning_content":"pondering"}}]}"#;
        let chunk = parse_line(line).unwrap();
        assert_eq!(chunk.choices[0].delta.thinking.as_deref(), Some("pondering"));
        assert!(!chunk.choices[0].delta.thinking_encrypted);
    }

    #[test]
    fn marks_encrypted_thinking_fields() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"encrypted_thinking":"xyz"}}]}"#;
        let chunk = parse_line(line).unwrap();
        assert!(chunk.choices[0].delta.thinking_encrypted);
    }

    #[test]
    fn splits_embedded_thinking_tag() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"<thinking>hmm</thinking>answer"}}]}"#;
        let chunk = parse_line(line).unwrap();
        assert_eq!(chunk.choices[0].delta.thinking.as_deref(), Some("hmm"));
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("answer"));
    }

    #[test]
    fn extracts_tool_call_fragment() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"id":"c1","function":{"name":"bash","arguments":"{\"command\":"}}]}}]}"#;
        let chunk = parse_line(line).unwrap();
        let fragment = &chunk.choices[0].delta.tool_call_fragments[0];
        assert_eq!(fragment.id.as_deref(), Some("c1"));
        assert_eq!(fragment.name.as_deref(), Some("bash"));
    }

    #[test]
    fn malformed_json_with_no_recoverable_content_is_dropped() {
        assert!(parse_line("data: {not json at all").is_none());
    }

    #[test]
    fn non_openai_shape_falls_back_to_tool_fragment() {
        let line = r#"data: <tool_call><function=list><parameter=path>/</parameter></function></tool_call>"#;
        let chunk = parse_line(line).unwrap();
        let fragment = &chunk.choices[0].delta.tool_call_fragments[0];
        assert_eq!(fragment.name.as_deref(), Some("list"));
    }

    #[test]
    fn feed_handles_split_lines_across_calls() {
        let mut parser = SseParser::new();
        let mut chunks = parser.feed(b"data: {\"choices\":[{\"index\":0,\"del");
        assert!(chunks.is_empty());
        chunks = parser.feed(b"ta\":{\"content\":\"hi\"}}]}\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("hi"));
    }
}
