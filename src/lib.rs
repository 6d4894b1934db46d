//! `ark-core` — the streaming/tool-calling engine behind an interactive terminal LLM
//! assistant.
//!
//! Four components, in dependency order: the SSE/delta parser (`sse`), the tool-call
//! reassembler (`reassembler`, backed by `dialect` and `recovery`), the orchestrator
//! (`orchestrator`) that drives the LLM/tool conversation loop, and the worker
//! coordinator (`worker`) that owns the channels between them. `message` holds the
//! shared data model; `transport` is the injected HTTP/SSE boundary; `tools` holds the
//! concrete tool implementations the orchestrator dispatches to in this crate's binary
//! and tests.

pub mod config;
pub mod dialect;
pub mod error;
pub mod logger;
pub mod message;
pub mod orchestrator;
pub mod reassembler;
pub mod recovery;
pub mod sse;
pub mod tools;
pub mod transport;
pub mod worker;

pub use config::{CompletionSignal, CoreConfig, EndpointConfig};
pub use error::CoreError;
pub use message::{Message, Role, Tool, ToolCall, ToolResult, TokenUsage};
pub use worker::{ApiRequest, ApiResponse, WorkerCoordinator};
