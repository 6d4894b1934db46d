//! C3 — Orchestrator.
//!
//! Drives the LLM ↔ tool conversation loop: one top-level request may trigger many
//! turns, each a full SSE round-trip through C1/C2 followed by zero or more tool
//! dispatches through the worker coordinator (C4). Recursion is expressed as an
//! iterative loop with an explicit depth counter, per the "Recursive orchestrator →
//! iterative loop" design note — no stack growth proportional to turn count.

use crate::config::CoreConfig;
use crate::dialect;
use crate::error::{CoreError, DuplicateLimitKind};
use crate::message::{Message, Role, StreamChunk, Tool, ToolCall, TokenUsage};
use crate::reassembler::Reassembler;
use crate::recovery;
use crate::transport::Transport;
use crate::worker::{ApiResponse, ToolOutcome, ToolRequest};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

/// Per-request duplicate-call bookkeeping: depth → (signature → attempt count), plus
/// a global (signature → attempt count) table. Created at request entry, discarded
/// when the request completes.
#[derive(Default)]
struct DuplicateFeedbackTracker {
    per_depth: HashMap<u32, HashMap<String, u32>>,
    global: HashMap<String, u32>,
}

impl DuplicateFeedbackTracker {
    /// Checks existing counts against the configured limits *before* recording this
    /// attempt; only records (and permits) the attempt when neither limit is already
    /// met. This makes the Nth attempt (N = max_attempts_per_level) the last allowed
    /// one and the (N+1)th the one that trips the error.
    fn check_and_record(&mut self, depth: u32, signature: &str, cfg: &CoreConfig) -> Result<(), CoreError> {
        let global_count = *self.global.get(signature).unwrap_or(&0);
        if global_count >= cfg.max_total_attempts {
            return Err(CoreError::DuplicateLimit {
                signature: signature.to_string(),
                limit_kind: DuplicateLimitKind::Global,
            });
        }
        let per_depth_count = *self
            .per_depth
            .get(&depth)
            .and_then(|m| m.get(signature))
            .unwrap_or(&0);
        if per_depth_count >= cfg.max_attempts_per_level {
            return Err(CoreError::DuplicateLimit {
                signature: signature.to_string(),
                limit_kind: DuplicateLimitKind::PerDepth,
            });
        }
        *self.per_depth.entry(depth).or_default().entry(signature.to_string()).or_insert(0) += 1;
        *self.global.entry(signature.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

struct TurnResult {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
    cancelled: bool,
}

pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    tool_tx: mpsc::Sender<ToolRequest>,
    tool_inbox: Arc<Mutex<HashMap<(String, String), ToolOutcome>>>,
    active_requests: Arc<Mutex<HashSet<String>>>,
    config: CoreConfig,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        tool_tx: mpsc::Sender<ToolRequest>,
        tool_inbox: Arc<Mutex<HashMap<(String, String), ToolOutcome>>>,
        active_requests: Arc<Mutex<HashSet<String>>>,
        config: CoreConfig,
    ) -> Self {
        Self {
            transport,
            tool_tx,
            tool_inbox,
            active_requests,
            config,
        }
    }

    async fn is_active(&self, request_id: &str) -> bool {
        self.active_requests.lock().await.contains(request_id)
    }

    async fn finish_request(&self, request_id: &str) {
        self.active_requests.lock().await.remove(request_id);
    }

    /// Runs one top-level request to completion: one or more turns until the LLM
    /// stops requesting tools, a limit trips, or the request is cancelled.
    pub async fn run_request(
        &self,
        request_id: String,
        mut messages: Vec<Message>,
        tools: Vec<Tool>,
        responses: &mpsc::Sender<ApiResponse>,
    ) {
        self.active_requests.lock().await.insert(request_id.clone());
        let _ = responses
            .send(ApiResponse::Ready {
                request_id: request_id.clone(),
            })
            .await;

        let mut depth: u32 = 0;
        let mut executed_calls: Vec<String> = Vec::new();
        let mut tracker = DuplicateFeedbackTracker::default();

        loop {
            if !self.is_active(&request_id).await {
                return;
            }

            let turn = match self.run_turn(&request_id, &messages, &tools, responses).await {
                Ok(turn) => turn,
                Err(e) => {
                    let _ = responses
                        .send(ApiResponse::StreamError {
                            request_id: request_id.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    self.finish_request(&request_id).await;
                    return;
                }
            };

            if turn.cancelled {
                let _ = responses
                    .send(ApiResponse::StreamError {
                        request_id: request_id.clone(),
                        error: CoreError::Cancel.to_string(),
                    })
                    .await;
                self.finish_request(&request_id).await;
                return;
            }

            if turn.tool_calls.is_empty() {
                messages.push(Message::assistant(turn.content.clone()));
                let _ = responses
                    .send(ApiResponse::StreamChunk {
                        request_id: request_id.clone(),
                        content: String::new(),
                        done: true,
                        thinking_content: None,
                        is_encrypted: false,
                        tool_calls: None,
                    })
                    .await;
                let _ = responses
                    .send(ApiResponse::StreamComplete {
                        request_id: request_id.clone(),
                        usage: turn.usage.unwrap_or_default(),
                        finish_reason: "stop".to_string(),
                    })
                    .await;
                self.finish_request(&request_id).await;
                return;
            }

            // 1. Completion short-circuit.
            if self.config.is_completion_signal(&turn.content) {
                messages.push(Message::assistant(turn.content.clone()));
                let _ = responses
                    .send(ApiResponse::StreamComplete {
                        request_id: request_id.clone(),
                        usage: turn.usage.unwrap_or_default(),
                        finish_reason: "stop".to_string(),
                    })
                    .await;
                self.finish_request(&request_id).await;
                return;
            }

            // 2. Depth check.
            if depth >= self.config.max_turns {
                if !turn.content.is_empty() {
                    messages.push(Message::assistant(turn.content.clone()));
                }
                let _ = responses
                    .send(ApiResponse::StreamError {
                        request_id: request_id.clone(),
                        error: CoreError::DepthExceeded {
                            depth,
                            max_turns: self.config.max_turns,
                        }
                        .to_string(),
                    })
                    .await;
                self.finish_request(&request_id).await;
                return;
            }

            // 3. Deduplication against calls already executed this request.
            let mut unique_calls = Vec::new();
            let mut seen_ids = HashSet::new();
            for call in &turn.tool_calls {
                let signature = call.signature();
                if executed_calls.contains(&signature) {
                    continue;
                }
                if !seen_ids.insert(call.id.clone()) {
                    continue;
                }
                unique_calls.push(call.clone());
            }

            // 4. All duplicates.
            if unique_calls.is_empty() {
                let mut limit_error = None;
                for call in &turn.tool_calls {
                    if let Err(e) = tracker.check_and_record(depth, &call.signature(), &self.config) {
                        limit_error = Some(e);
                        break;
                    }
                }
                if let Some(e) = limit_error {
                    let _ = responses
                        .send(ApiResponse::StreamError {
                            request_id: request_id.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    self.finish_request(&request_id).await;
                    return;
                }

                if !turn.content.is_empty() {
                    messages.push(Message::assistant_with_tool_calls(
                        turn.content.clone(),
                        turn.tool_calls.clone(),
                    ));
                }
                if let Some(first) = turn.tool_calls.first() {
                    messages.push(Message::tool_result(
                        first.id.clone(),
                        "This tool call was already executed in this conversation; try a different approach.",
                    ));
                }
                depth += 1;
                continue;
            }

            // 5. Normal case.
            if !turn.content.is_empty() {
                messages.push(Message::assistant_with_tool_calls(turn.content.clone(), unique_calls.clone()));
            }
            for call in &unique_calls {
                executed_calls.push(call.signature());
            }

            // 6. Dispatch each unique call, in order.
            for call in &unique_calls {
                if !self.is_active(&request_id).await {
                    self.finish_request(&request_id).await;
                    return;
                }

                let _ = responses
                    .send(ApiResponse::ToolCallRequest {
                        request_id: request_id.clone(),
                        tool_name: call.name.clone(),
                        tool_call_id: call.id.clone(),
                        args: argument_preview(call),
                        icon: icon_for(&call.name),
                        status: "running",
                    })
                    .await;

                if self
                    .tool_tx
                    .send(ToolRequest::Execute {
                        request_id: request_id.clone(),
                        call_id: call.id.clone(),
                        call: call.clone(),
                    })
                    .await
                    .is_err()
                {
                    messages.push(Message::tool_result(
                        call.id.clone(),
                        "Error: tool worker queue closed",
                    ));
                    let _ = responses
                        .send(ApiResponse::ToolCallResult {
                            request_id: request_id.clone(),
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            success: false,
                            summary: "tool worker queue closed".to_string(),
                            execution_time: std::time::Duration::ZERO,
                        })
                        .await;
                    continue;
                }

                let started = Instant::now();
                let outcome = self.wait_for_tool_response(&request_id, &call.id).await;
                let elapsed = started.elapsed();

                match outcome {
                    Some(ToolOutcome::Success(result)) => {
                        messages.push(Message::tool_result(call.id.clone(), result.content.clone()));
                        let _ = responses
                            .send(ApiResponse::ToolCallResult {
                                request_id: request_id.clone(),
                                tool_call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                success: !result.is_error,
                                summary: summarize(&result.content),
                                execution_time: elapsed,
                            })
                            .await;
                    }
                    Some(ToolOutcome::Error(err)) => {
                        messages.push(Message::tool_result(call.id.clone(), format!("Error: {err}")));
                        let _ = responses
                            .send(ApiResponse::ToolCallResult {
                                request_id: request_id.clone(),
                                tool_call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                success: false,
                                summary: err,
                                execution_time: elapsed,
                            })
                            .await;
                    }
                    None => {
                        messages.push(Message::tool_result(
                            call.id.clone(),
                            "Error: Tool execution timed out",
                        ));
                        let _ = responses
                            .send(ApiResponse::ToolCallResult {
                                request_id: request_id.clone(),
                                tool_call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                success: false,
                                summary: "timed out".to_string(),
                                execution_time: elapsed,
                            })
                            .await;
                    }
                }
            }

            depth += 1;
        }
    }

    /// Polls the shared tool-response inbox every `tool_poll_interval` up to
    /// `tool_timeout`. Returns `None` on timeout.
    async fn wait_for_tool_response(&self, request_id: &str, call_id: &str) -> Option<ToolOutcome> {
        let key = (request_id.to_string(), call_id.to_string());
        let deadline = Instant::now() + self.config.tool_timeout;
        loop {
            if let Some(outcome) = self.tool_inbox.lock().await.remove(&key) {
                return Some(outcome);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.tool_poll_interval).await;
        }
    }

    /// Runs one LLM round-trip: opens the SSE stream, forwards content/thinking,
    /// feeds tool-call fragments to the reassembler, and harvests completed calls.
    async fn run_turn(
        &self,
        request_id: &str,
        messages: &[Message],
        tools: &[Tool],
        responses: &mpsc::Sender<ApiResponse>,
    ) -> Result<TurnResult, CoreError> {
        let mut stream = self.transport.open_stream(messages, tools).await?;
        let mut reassembler = Reassembler::new(self.config.stale_buffer, self.config.empty_buffer_fail);

        let mut content = String::new();
        let mut first_content_chunk = true;
        let mut thinking_acc = String::new();
        let mut usage = None;
        let mut harvested = Vec::new();
        let mut cancelled = false;
        // XML tool-call dialects are sometimes embedded directly in `content` rather
        // than in a structured tool-call delta; once an opening marker is seen, the
        // rest of the accumulated text is diverted into the reassembler instead of
        // being forwarded to the UI, until its dialect's closing tag appears.
        let mut diverting_content = false;

        while let Some(next) = stream.next().await {
            if !self.is_active(request_id).await {
                cancelled = true;
                break;
            }

            let chunk: StreamChunk = next?;
            if chunk.done {
                break;
            }

            for choice in chunk.choices {
                for fragment in choice.delta.tool_call_fragments {
                    reassembler.feed(fragment);
                }

                if let Some(text) = choice.delta.content {
                    let opens_diversion = !diverting_content && dialect::detect(&text) != dialect::Dialect::Unknown;
                    if diverting_content || opens_diversion {
                        // The fragment that flips `diverting_content` on must also carry
                        // the extracted name so `Reassembler::feed` creates a buffer
                        // (case 1/2) instead of silently dropping a name-less,
                        // id-less fragment as an orphan continuation (case 3 requires an
                        // existing named buffer to continue). Later diverted fragments
                        // correctly omit the name to continue that same buffer.
                        let name = if opens_diversion { recovery::extract_name(&text) } else { None };
                        diverting_content = true;
                        reassembler.feed(crate::message::ToolCallFragment {
                            id: None,
                            name,
                            arguments: Some(text),
                        });
                    } else {
                        let mut text = text;
                        if first_content_chunk {
                            text = text.trim_start_matches('\n').to_string();
                        }
                        if !text.is_empty() {
                            first_content_chunk = false;
                            content.push_str(&text);
                            let _ = responses
                                .send(ApiResponse::StreamChunk {
                                    request_id: request_id.to_string(),
                                    content: text,
                                    done: false,
                                    thinking_content: None,
                                    is_encrypted: false,
                                    tool_calls: None,
                                })
                                .await;
                        }
                    }
                }

                if let Some(thinking) = choice.delta.thinking {
                    thinking_acc.push_str(&thinking);
                    if thinking_acc.len() >= self.config.min_thinking_len {
                        let flushed = std::mem::take(&mut thinking_acc);
                        crate::logger::log_thinking(
                            thinking_dialect_tag(choice.delta.thinking_encrypted),
                            choice.delta.thinking_encrypted,
                            &flushed,
                        );
                        let _ = responses
                            .send(ApiResponse::StreamChunk {
                                request_id: request_id.to_string(),
                                content: String::new(),
                                done: false,
                                thinking_content: Some(flushed),
                                is_encrypted: choice.delta.thinking_encrypted,
                                tool_calls: None,
                            })
                            .await;
                    }
                }
            }

            if let Some(u) = chunk.usage {
                usage = Some(u);
            }

            harvested.extend(reassembler.harvest());
        }

        harvested.extend(reassembler.finish());
        debug_assert!(reassembler.is_empty());

        if !thinking_acc.is_empty() && !cancelled {
            crate::logger::log_thinking(thinking_dialect_tag(false), false, &thinking_acc);
            let _ = responses
                .send(ApiResponse::StreamChunk {
                    request_id: request_id.to_string(),
                    content: String::new(),
                    done: false,
                    thinking_content: Some(thinking_acc),
                    is_encrypted: false,
                    tool_calls: None,
                })
                .await;
        }

        Ok(TurnResult {
            content,
            tool_calls: harvested,
            usage,
            cancelled,
        })
    }
}

fn argument_preview(call: &ToolCall) -> String {
    const MAX: usize = 200;
    if call.arguments.len() > MAX {
        format!("{}...", &call.arguments[..MAX])
    } else {
        call.arguments.clone()
    }
}

fn summarize(content: &str) -> String {
    const MAX: usize = 200;
    if content.len() > MAX {
        format!("{}... ({} chars)", &content[..MAX], content.len())
    } else {
        content.to_string()
    }
}

/// Thinking content has no OpenAI/Anthropic/Qwen dialect of its own (that concept
/// belongs to C2's tool-call fragments); the persisted-state tag instead distinguishes
/// the two wire shapes the field-probe list in `sse.rs` actually sees.
fn thinking_dialect_tag(encrypted: bool) -> &'static str {
    if encrypted {
        "encrypted_reasoning"
    } else {
        "plain_reasoning"
    }
}

fn icon_for(tool_name: &str) -> &'static str {
    match tool_name {
        "bash" => "\u{1F527}",
        "editor__Edit" => "\u{1F4DD}",
        _ => "\u{2699}",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    #[test]
    fn duplicate_tracker_allows_exactly_max_attempts_per_level() {
        let cfg = CoreConfig::default();
        let mut tracker = DuplicateFeedbackTracker::default();
        assert!(tracker.check_and_record(1, "bash(command=\"pwd\")", &cfg).is_ok());
        assert!(tracker.check_and_record(1, "bash(command=\"pwd\")", &cfg).is_ok());
        let err = tracker.check_and_record(1, "bash(command=\"pwd\")", &cfg).unwrap_err();
        assert!(matches!(
            err,
            CoreError::DuplicateLimit {
                limit_kind: DuplicateLimitKind::PerDepth,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_tracker_enforces_global_limit_across_depths() {
        let cfg = CoreConfig::default();
        let mut tracker = DuplicateFeedbackTracker::default();
        for depth in 0..3 {
            assert!(tracker.check_and_record(depth, "bash(command=\"pwd\")", &cfg).is_ok());
            assert!(tracker.check_and_record(depth, "bash(command=\"pwd\")", &cfg).is_ok());
        }
        let err = tracker.check_and_record(3, "bash(command=\"pwd\")", &cfg).unwrap_err();
        assert!(matches!(
            err,
            CoreError::DuplicateLimit {
                limit_kind: DuplicateLimitKind::Global,
                ..
            }
        ));
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    use crate::message::{Delta, StreamChoice, ToolCallFragment};
    use crate::transport::ChunkStream;
    use std::collections::VecDeque;

    /// Hands back one pre-scripted turn (a `Vec` of already-parsed `StreamChunk`s) per
    /// `open_stream` call, in order. Stands in for a real SSE transport in end-to-end
    /// orchestrator tests so scenarios S1/S4/S6 can be driven without a network.
    struct ScriptedTransport {
        turns: Mutex<VecDeque<Vec<StreamChunk>>>,
    }

    impl ScriptedTransport {
        fn new(turns: Vec<Vec<StreamChunk>>) -> Self {
            Self {
                turns: Mutex::new(turns.into_iter().collect()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn open_stream(&self, _messages: &[Message], _tools: &[Tool]) -> Result<ChunkStream, CoreError> {
            let turn = self.turns.lock().await.pop_front().unwrap_or_default();
            let delayed = async_stream::stream! {
                for chunk in turn {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    yield Ok(chunk);
                }
            };
            Ok(Box::pin(delayed))
        }

        async fn configure(&self, _endpoint: crate::config::EndpointConfig) {}
    }

    fn content_chunk(text: &str) -> StreamChunk {
        StreamChunk {
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    content: Some(text.to_string()),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
            done: false,
        }
    }

    fn tool_call_chunk(id: &str, name: &str, arguments: &str) -> StreamChunk {
        StreamChunk {
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    tool_call_fragments: vec![ToolCallFragment {
                        id: Some(id.to_string()),
                        name: Some(name.to_string()),
                        arguments: Some(arguments.to_string()),
                    }],
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
            done: false,
        }
    }

    fn done_chunk(usage: Option<TokenUsage>) -> StreamChunk {
        StreamChunk {
            choices: vec![],
            usage,
            done: true,
        }
    }

    fn new_test_orchestrator(turns: Vec<Vec<StreamChunk>>) -> (Orchestrator, mpsc::Receiver<ToolRequest>) {
        let (tool_tx, tool_rx) = mpsc::channel(16);
        let tool_inbox = Arc::new(Mutex::new(HashMap::new()));
        let active_requests = Arc::new(Mutex::new(HashSet::new()));
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedTransport::new(turns)),
            tool_tx,
            tool_inbox,
            active_requests,
            CoreConfig::default(),
        );
        (orchestrator, tool_rx)
    }

    /// S1 — single tool call, tool worker succeeds, follow-up turn has no tool calls.
    /// Expected downstream order: Ready; ToolCallRequest; ToolCallResult; StreamChunk
    /// ("Found 2 entries"); StreamChunk("", done=true); StreamComplete.
    #[tokio::test]
    async fn s1_single_call_happy_path_end_to_end() {
        let (orchestrator, mut tool_rx) = new_test_orchestrator(vec![
            vec![tool_call_chunk("c1", "bash", r#"{"command":"ls"}"#), done_chunk(None)],
            vec![content_chunk("Found 2 entries"), done_chunk(Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                reasoning_tokens: None,
            }))],
        ]);

        let inbox = orchestrator.tool_inbox.clone();
        tokio::spawn(async move {
            if let Some(ToolRequest::Execute { request_id, call_id, .. }) = tool_rx.recv().await {
                inbox.lock().await.insert(
                    (request_id, call_id.clone()),
                    ToolOutcome::Success(crate::message::ToolResult {
                        tool_call_id: call_id,
                        content: "a\nb".to_string(),
                        is_error: false,
                    }),
                );
            }
        });

        let (responses_tx, mut responses_rx) = mpsc::channel(32);
        orchestrator
            .run_request(
                "req-1".to_string(),
                vec![Message::user("list the directory")],
                vec![],
                &responses_tx,
            )
            .await;
        drop(responses_tx);

        let mut events = Vec::new();
        while let Some(event) = responses_rx.recv().await {
            events.push(event);
        }

        assert!(matches!(events[0], ApiResponse::Ready { .. }));
        assert!(matches!(events[1], ApiResponse::ToolCallRequest { ref tool_name, .. } if tool_name == "bash"));
        assert!(matches!(events[2], ApiResponse::ToolCallResult { success: true, .. }));
        assert!(matches!(
            events[3],
            ApiResponse::StreamChunk { ref content, done: false, .. } if content == "Found 2 entries"
        ));
        assert!(matches!(events[4], ApiResponse::StreamChunk { done: true, .. }));
        assert!(matches!(events[5], ApiResponse::StreamComplete { .. }));
    }

    /// S4 — the LLM repeats the same call every turn past `max_total_attempts`, which
    /// must trip `DuplicateLimitError` rather than recurse forever. Each repeated
    /// duplicate is filtered at a strictly increasing depth (the orchestrator recurses
    /// one level per turn even on an all-duplicates turn), so it is the *global*
    /// counter — not the per-depth one — that eventually trips here: one real
    /// dispatch followed by `max_total_attempts` (default 6) duplicate turns is
    /// exactly one turn short of tripping, so a 7th duplicate turn is required.
    #[tokio::test]
    async fn s4_duplicate_loop_trips_global_limit() {
        let repeated = tool_call_chunk("dup", "bash", r#"{"command":"pwd"}"#);
        let mut turns = vec![vec![repeated.clone(), done_chunk(None)]];
        for _ in 0..7 {
            turns.push(vec![repeated.clone(), done_chunk(None)]);
        }
        let (orchestrator, mut tool_rx) = new_test_orchestrator(turns);

        let inbox = orchestrator.tool_inbox.clone();
        tokio::spawn(async move {
            while let Some(ToolRequest::Execute { request_id, call_id, .. }) = tool_rx.recv().await {
                inbox.lock().await.insert(
                    (request_id, call_id.clone()),
                    ToolOutcome::Success(crate::message::ToolResult {
                        tool_call_id: call_id,
                        content: "/home".to_string(),
                        is_error: false,
                    }),
                );
            }
        });

        let (responses_tx, mut responses_rx) = mpsc::channel(32);
        orchestrator
            .run_request("req-4".to_string(), vec![Message::user("pwd")], vec![], &responses_tx)
            .await;
        drop(responses_tx);

        let mut saw_duplicate_limit_error = false;
        while let Some(event) = responses_rx.recv().await {
            if let ApiResponse::StreamError { error, .. } = event {
                assert!(error.contains("duplicate-call limit"));
                saw_duplicate_limit_error = true;
            }
        }
        assert!(saw_duplicate_limit_error);
    }

    /// S6 — cancellation mid-stream drops subsequent chunks and yields exactly one
    /// `StreamError("Stream canceled by user")`, never a `StreamComplete`.
    #[tokio::test]
    async fn s6_cancellation_mid_stream() {
        let turn = vec![
            content_chunk("a"),
            content_chunk("b"),
            content_chunk("c"),
            content_chunk("d"),
            content_chunk("e"),
            content_chunk("f"),
            content_chunk("g"),
            done_chunk(None),
        ];
        let (orchestrator, _tool_rx) = new_test_orchestrator(vec![turn]);
        let active_requests = orchestrator.active_requests.clone();

        let (responses_tx, mut responses_rx) = mpsc::channel(32);
        let request_id = "req-6".to_string();
        let handle = {
            let request_id = request_id.clone();
            tokio::spawn(async move {
                orchestrator
                    .run_request(request_id, vec![Message::user("stream forever")], vec![], &responses_tx)
                    .await;
            })
        };

        let mut seen_chunks = 0;
        let mut saw_cancel_error = false;
        let mut saw_complete = false;
        while let Some(event) = responses_rx.recv().await {
            match event {
                ApiResponse::StreamChunk { .. } => {
                    seen_chunks += 1;
                    if seen_chunks == 3 {
                        active_requests.lock().await.remove(&request_id);
                    }
                }
                ApiResponse::StreamError { error, .. } => {
                    assert_eq!(error, "Stream canceled by user");
                    saw_cancel_error = true;
                }
                ApiResponse::StreamComplete { .. } => saw_complete = true,
                _ => {}
            }
        }

        handle.await.unwrap();
        assert!(saw_cancel_error);
        assert!(!saw_complete);
    }

    /// A Qwen-style tool call delivered purely through `content` deltas (no structured
    /// `tool_calls` field at all) must still be harvested and dispatched. This exercises
    /// the content-diversion path in `run_turn` end to end, through the real
    /// `Reassembler`, rather than constructing an already-named `ToolCallFragment` by
    /// hand — the diversion path must supply the name itself on the fragment that opens
    /// the buffer, or the call is silently dropped.
    #[tokio::test]
    async fn content_embedded_qwen_tool_call_is_harvested() {
        let (orchestrator, mut tool_rx) = new_test_orchestrator(vec![
            vec![
                content_chunk("<tool_call><function=list>"),
                content_chunk("<parameter=path>/</parameter></function></tool_call>"),
                done_chunk(None),
            ],
            vec![content_chunk("Listed root"), done_chunk(None)],
        ]);

        let inbox = orchestrator.tool_inbox.clone();
        tokio::spawn(async move {
            if let Some(ToolRequest::Execute {
                request_id,
                call_id,
                call,
            }) = tool_rx.recv().await
            {
                assert_eq!(call.name, "list");
                let args: serde_json::Value = serde_json::from_str(&call.arguments).unwrap();
                assert_eq!(args["path"], "/");
                inbox.lock().await.insert(
                    (request_id, call_id.clone()),
                    ToolOutcome::Success(crate::message::ToolResult {
                        tool_call_id: call_id,
                        content: "/".to_string(),
                        is_error: false,
                    }),
                );
            }
        });

        let (responses_tx, mut responses_rx) = mpsc::channel(32);
        orchestrator
            .run_request(
                "req-content".to_string(),
                vec![Message::user("list the root directory")],
                vec![],
                &responses_tx,
            )
            .await;
        drop(responses_tx);

        let mut saw_tool_request = false;
        let mut saw_tool_result = false;
        while let Some(event) = responses_rx.recv().await {
            match event {
                ApiResponse::ToolCallRequest { tool_name, .. } => {
                    assert_eq!(tool_name, "list");
                    saw_tool_request = true;
                }
                ApiResponse::ToolCallResult { success, .. } => {
                    assert!(success);
                    saw_tool_result = true;
                }
                _ => {}
            }
        }
        assert!(saw_tool_request);
        assert!(saw_tool_result);
    }
}
