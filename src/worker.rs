//! C4 — Worker Coordinator.
//!
//! Spawns two long-lived tokio tasks — the API worker (hosting the orchestrator) and
//! the tool worker (hosting the tool registry) — and wires them together with bounded
//! channels. Tokio tasks stand in for the "OS thread" workers of the original design and
//! `tokio::sync::mpsc` stands in for its typed bounded queues; see SPEC_FULL.md §4.3 for
//! why this substitution preserves every ordering and cancellation guarantee.

use crate::config::{CoreConfig, EndpointConfig};
use crate::message::{Message, Tool, ToolCall, ToolResult, TokenUsage};
use crate::orchestrator::Orchestrator;
use crate::transport::Transport;
use crate::tools::ToolRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Requests flowing into the API worker.
pub enum ApiRequest {
    ChatRequest {
        request_id: String,
        messages: Vec<Message>,
        tools: Vec<Tool>,
    },
    StreamCancel {
        request_id: String,
    },
    Configure(EndpointConfig),
    Shutdown,
}

/// Downstream events flowing out of the API worker, one variant per response kind
/// the orchestrator can emit.
#[derive(Debug, Clone)]
pub enum ApiResponse {
    Ready {
        request_id: String,
    },
    StreamChunk {
        request_id: String,
        content: String,
        done: bool,
        thinking_content: Option<String>,
        is_encrypted: bool,
        tool_calls: Option<Vec<ToolCall>>,
    },
    ToolCallRequest {
        request_id: String,
        tool_name: String,
        tool_call_id: String,
        args: String,
        icon: &'static str,
        status: &'static str,
    },
    ToolCallResult {
        request_id: String,
        tool_call_id: String,
        tool_name: String,
        success: bool,
        summary: String,
        execution_time: std::time::Duration,
    },
    StreamComplete {
        request_id: String,
        usage: TokenUsage,
        finish_reason: String,
    },
    StreamError {
        request_id: String,
        error: String,
    },
}

/// Requests flowing into the tool worker.
pub enum ToolRequest {
    Execute {
        request_id: String,
        call_id: String,
        call: ToolCall,
    },
    Shutdown,
}

/// Responses flowing out of the tool worker, drained into the orchestrator's shared
/// inbox by the router task below.
pub enum ToolResponse {
    Result {
        request_id: String,
        call_id: String,
        result: ToolResult,
    },
    Error {
        request_id: String,
        call_id: String,
        error: String,
    },
}

/// What the orchestrator finds waiting in the shared inbox for a dispatched call.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success(ToolResult),
    Error(String),
}

/// Handle to the running worker pair. Dropping it does not stop the workers; call
/// `shutdown` explicitly.
pub struct WorkerCoordinator {
    api_requests_tx: mpsc::Sender<ApiRequest>,
    shutdown: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
    api_handle: JoinHandle<()>,
    tool_handle: JoinHandle<()>,
    router_handle: JoinHandle<()>,
}

impl WorkerCoordinator {
    /// Spawns the API worker, the tool worker, and the response router, returning a
    /// handle plus the channel the UI layer should consume for `ApiResponse` events.
    pub fn spawn(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        tools: Arc<ToolRegistry>,
    ) -> (Self, mpsc::Receiver<ApiResponse>) {
        let capacity = config.queue_capacity;
        let (api_requests_tx, mut api_requests_rx) = mpsc::channel::<ApiRequest>(capacity);
        let (api_responses_tx, api_responses_rx) = mpsc::channel::<ApiResponse>(capacity);
        let (tool_requests_tx, mut tool_requests_rx) = mpsc::channel::<ToolRequest>(capacity);
        let (tool_responses_tx, mut tool_responses_rx) = mpsc::channel::<ToolResponse>(capacity);

        let shutdown = Arc::new(AtomicBool::new(false));
        let live_workers = Arc::new(AtomicUsize::new(0));
        let active_requests: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let tool_inbox: Arc<Mutex<HashMap<(String, String), ToolOutcome>>> = Arc::new(Mutex::new(HashMap::new()));

        // Router: drains tool_responses into the shared inbox the orchestrator polls.
        let router_inbox = tool_inbox.clone();
        let router_handle = tokio::spawn(async move {
            while let Some(response) = tool_responses_rx.recv().await {
                let (key, outcome) = match response {
                    ToolResponse::Result {
                        request_id,
                        call_id,
                        result,
                    } => ((request_id, call_id), ToolOutcome::Success(result)),
                    ToolResponse::Error {
                        request_id,
                        call_id,
                        error,
                    } => ((request_id, call_id), ToolOutcome::Error(error)),
                };
                router_inbox.lock().await.insert(key, outcome);
            }
        });

        // Tool worker: executes one call at a time against the registry.
        let tool_live = live_workers.clone();
        let tool_handle = tokio::spawn(async move {
            tool_live.fetch_add(1, Ordering::SeqCst);
            while let Some(request) = tool_requests_rx.recv().await {
                match request {
                    ToolRequest::Execute {
                        request_id,
                        call_id,
                        call,
                    } => {
                        let response = match tools.execute(&call).await {
                            Ok(content) => ToolResponse::Result {
                                request_id,
                                call_id,
                                result: ToolResult {
                                    tool_call_id: call.id.clone(),
                                    content,
                                    is_error: false,
                                },
                            },
                            Err(error) => ToolResponse::Error {
                                request_id,
                                call_id,
                                error,
                            },
                        };
                        if tool_responses_tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    ToolRequest::Shutdown => break,
                }
            }
            tool_live.fetch_sub(1, Ordering::SeqCst);
        });

        // API worker: a single task hosting the orchestrator. Requests are serialized
        // through this one worker, so only one `run_request` is ever in flight — a
        // `ChatRequest` is driven to completion inline rather than spawned off.
        // `StreamCancel`/`Configure` still need to reach the orchestrator *while* that
        // request streams, so they're raced against the in-flight future with
        // `tokio::select!` instead of waiting behind it in the queue. A `ChatRequest`
        // (or `Shutdown`) that arrives mid-stream is held in `pending` and handled
        // first on the next iteration, preserving queue order.
        let api_live = live_workers.clone();
        let api_shutdown = shutdown.clone();
        let orchestrator_transport = transport;
        let orchestrator_tool_tx = tool_requests_tx;
        let orchestrator_inbox = tool_inbox;
        let orchestrator_active = active_requests;
        let mut current_config = config;
        let api_handle = tokio::spawn(async move {
            api_live.fetch_add(1, Ordering::SeqCst);
            let mut pending: Option<ApiRequest> = None;
            'outer: loop {
                let request = match pending.take() {
                    Some(request) => request,
                    None => match api_requests_rx.recv().await {
                        Some(request) => request,
                        None => break 'outer,
                    },
                };

                if api_shutdown.load(Ordering::SeqCst) {
                    break 'outer;
                }

                match request {
                    ApiRequest::ChatRequest {
                        request_id,
                        messages,
                        tools,
                    } => {
                        let orchestrator = Orchestrator::new(
                            orchestrator_transport.clone(),
                            orchestrator_tool_tx.clone(),
                            orchestrator_inbox.clone(),
                            orchestrator_active.clone(),
                            current_config.clone(),
                        );
                        let responses = api_responses_tx.clone();
                        let run = orchestrator.run_request(request_id, messages, tools, &responses);
                        tokio::pin!(run);

                        // Drive this request to completion, but keep servicing
                        // cancellation/configuration requests that arrive while it's
                        // still streaming. Any other request kind queued in the
                        // meantime is stashed in `pending` and dealt with once this one
                        // finishes, so requests stay strictly serialized.
                        let mut channel_closed = false;
                        loop {
                            if channel_closed {
                                (&mut run).await;
                                break;
                            }
                            tokio::select! {
                                _ = &mut run => break,
                                next = api_requests_rx.recv() => {
                                    match next {
                                        Some(ApiRequest::StreamCancel { request_id }) => {
                                            orchestrator_active.lock().await.remove(&request_id);
                                        }
                                        Some(ApiRequest::Configure(endpoint)) => {
                                            orchestrator_transport.configure(endpoint).await;
                                        }
                                        Some(other) => pending = Some(other),
                                        None => channel_closed = true,
                                    }
                                }
                            }
                        }
                    }
                    ApiRequest::StreamCancel { request_id } => {
                        orchestrator_active.lock().await.remove(&request_id);
                    }
                    ApiRequest::Configure(endpoint) => {
                        orchestrator_transport.configure(endpoint).await;
                    }
                    ApiRequest::Shutdown => break 'outer,
                }
            }
            api_live.fetch_sub(1, Ordering::SeqCst);
        });

        (
            Self {
                api_requests_tx,
                shutdown,
                live_workers,
                api_handle,
                tool_handle,
                router_handle,
            },
            api_responses_rx,
        )
    }

    pub fn requests(&self) -> mpsc::Sender<ApiRequest> {
        self.api_requests_tx.clone()
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Signals both workers to stop after their current in-flight work drains, and
    /// waits for both tasks to exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.api_requests_tx.send(ApiRequest::Shutdown).await;
        let _ = self.api_handle.await;
        let _ = self.tool_handle.await;
        self.router_handle.abort();
    }
}
