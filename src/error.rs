//! Core error taxonomy.
//!
//! One distinct kind per failure mode; see the module-level docs in `orchestrator` for
//! how each variant propagates (transport/tool errors abort one turn and get folded
//! into the conversation, limit errors abort the whole request).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("tool dispatch error: {0}")]
    ToolDispatch(String),

    #[error("tool call timed out after {0:?}")]
    ToolTimeout(Duration),

    #[error("recursion depth {depth} exceeded max turns {max_turns}")]
    DepthExceeded { depth: u32, max_turns: u32 },

    #[error("duplicate-call limit exceeded for `{signature}`: {limit_kind}")]
    DuplicateLimit {
        signature: String,
        limit_kind: DuplicateLimitKind,
    },

    #[error("Stream canceled by user")]
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateLimitKind {
    PerDepth,
    Global,
}

impl std::fmt::Display for DuplicateLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateLimitKind::PerDepth => write!(f, "per-depth limit"),
            DuplicateLimitKind::Global => write!(f, "global limit"),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}
