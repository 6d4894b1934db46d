//! Injected configuration for the orchestrator.
//!
//! Every tunable that would otherwise be scattered across constants lives here as one
//! struct built once at startup and passed into the orchestrator.
//!
//! One constant has no field here: the request queue's "idle-poll interval" (10ms in
//! thread-based designs). That names the cost of busy-polling an empty queue on a plain
//! OS thread; `worker.rs`'s `mpsc::Receiver::recv` suspends the task directly instead, so
//! there is nothing to poll and no interval to configure.

use std::sync::Arc;
use std::time::Duration;

/// `fn(&str) -> bool` deciding whether assistant content signals task completion
/// before any pending tool calls are dispatched. The exact phrases are domain-specific
/// and deliberately not part of this crate (spec Open Question, §9).
pub type CompletionSignal = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CoreConfig {
    /// Maximum recursion depth for the tool-execution loop (default 30).
    pub max_turns: u32,
    /// Maximum same-signature attempts at a single depth before aborting (default 2).
    pub max_attempts_per_level: u32,
    /// Maximum same-signature attempts across the whole request (default 6).
    pub max_total_attempts: u32,
    /// Tool-call buffer staleness threshold (default 30s).
    pub stale_buffer: Duration,
    /// Threshold for aging out a buffer whose dialect never resolved (default 5s).
    pub empty_buffer_fail: Duration,
    /// Per-call tool execution timeout (default 300s), polled every `tool_poll_interval`.
    pub tool_timeout: Duration,
    pub tool_poll_interval: Duration,
    /// Minimum aggregated thinking length before it is persisted (default 50 chars).
    pub min_thinking_len: usize,
    /// Bounded-channel capacity shared by all four worker queues (default 64).
    pub queue_capacity: usize,
    pub completion_signal: Option<CompletionSignal>,
}

impl CoreConfig {
    pub fn with_completion_signal(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.completion_signal = Some(Arc::new(f));
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub(crate) fn is_completion_signal(&self, content: &str) -> bool {
        match &self.completion_signal {
            Some(f) => f(content),
            None => false,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_turns: 30,
            max_attempts_per_level: 2,
            max_total_attempts: 6,
            stale_buffer: Duration::from_secs(30),
            empty_buffer_fail: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(300),
            tool_poll_interval: Duration::from_millis(100),
            min_thinking_len: 50,
            queue_capacity: 64,
            completion_signal: None,
        }
    }
}

/// Endpoint connection parameters; rebuilt wholesale on an `arkConfigure` request.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn is_openrouter(&self) -> bool {
        self.base_url.contains("openrouter.ai")
    }
}
