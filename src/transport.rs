//! Injected HTTP/SSE transport (§6 External Interfaces).
//!
//! The core treats the transport as a collaborator: `Transport::open_stream` hands the
//! orchestrator a `StreamChunk` stream without the orchestrator ever touching `reqwest`
//! directly. `HttpTransport` is the concrete implementation, built the same way the
//! teacher's `OpenAIProvider` builds its request (see `llm/openai.rs`): a JSON body
//! posted to `{base_url}/chat/completions` with `stream: true`, decoded through
//! `eventsource-stream` and handed to `sse::parse_stream`.

use crate::config::EndpointConfig;
use crate::error::CoreError;
use crate::message::{Message, Role, StreamChunk, Tool, ToolCall};
use crate::sse;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::RwLock;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, CoreError>> + Send>>;

/// Tuning parameters carried on every request; all optional per §6.
#[derive(Clone, Debug, Default)]
pub struct RequestParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub logit_bias: Option<serde_json::Value>,
    pub seed: Option<i64>,
}

/// The boundary C1-C3 are written against; see the Non-goal "implementing the HTTP/SSE
/// transport itself (treated as an injected dependency)".
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_stream(&self, messages: &[Message], tools: &[Tool]) -> Result<ChunkStream, CoreError>;

    /// Rebuilds the client with new connection parameters (`arkConfigure`). Emits no
    /// response beyond an internal debug log, per §4.3.
    async fn configure(&self, endpoint: EndpointConfig);
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: RwLock<EndpointConfig>,
    params: RequestParams,
}

impl HttpTransport {
    pub fn new(endpoint: EndpointConfig, params: RequestParams) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: RwLock::new(endpoint),
            params,
        }
    }

    fn endpoint(&self) -> EndpointConfig {
        self.endpoint.read().map(|e| e.clone()).unwrap_or_else(|p| p.into_inner().clone())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, messages: &[Message], tools: &[Tool]) -> Result<ChunkStream, CoreError> {
        let endpoint = self.endpoint();
        let body = build_request(&endpoint.model, messages, tools, &self.params);

        let mut request = self
            .client
            .post(format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", endpoint.api_key))
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "close")
            .json(&body);

        if endpoint.is_openrouter() {
            request = request
                .header("HTTP-Referer", "https://github.com/ark-core")
                .header("X-Title", "ark");
        }

        let response = request.send().await.map_err(|e| CoreError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Transport(format!("HTTP {status}: {text}")));
        }

        let byte_stream = response.bytes_stream().eventsource().map(|event| {
            event
                .map(|e| bytes::Bytes::from(format!("data: {}\n", e.data)))
                .map_err(|e| e.to_string())
        });

        Ok(Box::pin(sse::parse_stream(byte_stream)))
    }

    async fn configure(&self, endpoint: EndpointConfig) {
        if let Ok(mut guard) = self.endpoint.write() {
            *guard = endpoint;
        }
        log::debug!("transport: reconfigured endpoint");
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logit_bias: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

fn convert_message(msg: &Message) -> WireMessage {
    WireMessage {
        role: role_str(msg.role),
        content: msg.content.clone(),
        tool_calls: msg.tool_calls.as_ref().map(|calls| calls.iter().map(convert_tool_call).collect()),
        tool_call_id: msg.tool_call_id.clone(),
    }
}

fn convert_tool_call(call: &ToolCall) -> WireToolCall {
    WireToolCall {
        id: call.id.clone(),
        kind: "function",
        function: WireFunctionCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        },
    }
}

fn build_request(model: &str, messages: &[Message], tools: &[Tool], params: &RequestParams) -> WireRequest {
    let wire_tools = if tools.is_empty() {
        None
    } else {
        Some(
            tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    };

    WireRequest {
        model: model.to_string(),
        messages: messages.iter().map(convert_message).collect(),
        stream: true,
        max_tokens: params.max_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        stop: params.stop.clone(),
        presence_penalty: params.presence_penalty,
        frequency_penalty: params.frequency_penalty,
        logit_bias: params.logit_bias.clone(),
        seed: params.seed,
        tools: wire_tools,
    }
}
