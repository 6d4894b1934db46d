//! C2 — Tool-Call Reassembler.
//!
//! Buffers partial tool-call deltas across arbitrary chunk boundaries, detects the
//! provider dialect per buffer, and decides when a buffer is complete enough to
//! dispatch. This is the most delicate subsystem in the crate — see `dialect.rs` for
//! the completeness predicates and `recovery.rs` for the end-of-stream salvage path.

use crate::dialect::{self, Dialect};
use crate::message::{ToolCall, ToolCallBuffer, ToolCallFragment};
use crate::recovery;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct Reassembler {
    buffers: HashMap<String, ToolCallBuffer>,
    stale_buffer: Duration,
    empty_buffer_fail: Duration,
}

impl Reassembler {
    pub fn new(stale_buffer: Duration, empty_buffer_fail: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            stale_buffer,
            empty_buffer_fail,
        }
    }

    /// Number of buffers currently in flight. Used to assert the "buffer table is
    /// empty after stream termination" invariant in tests.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Applies the three-case upsert logic from §4.2 to one incoming fragment.
    pub fn feed(&mut self, fragment: ToolCallFragment) {
        match fragment.id.filter(|id| !id.is_empty()) {
            Some(id) => {
                let buffer = self
                    .buffers
                    .entry(id.clone())
                    .or_insert_with(|| ToolCallBuffer::new(id, false));
                apply(buffer, fragment.name, fragment.arguments);
            }
            None => match fragment.name {
                Some(name) => {
                    let id = synthesize_id();
                    let mut buffer = ToolCallBuffer::new(id.clone(), true);
                    apply(&mut buffer, Some(name), fragment.arguments);
                    self.buffers.insert(id, buffer);
                }
                None => {
                    if let Some(key) = self.most_recent_named_key() {
                        if let Some(buffer) = self.buffers.get_mut(&key) {
                            apply(buffer, None, fragment.arguments);
                        }
                    }
                    // No buffer to continue yet: an orphan fragment with neither id
                    // nor name and no prior named buffer. Nothing useful to do with
                    // it; it is implicitly dropped.
                }
            },
        }
    }

    /// Preferring the buffer whose arguments are non-empty, then the most recently
    /// updated, among all buffers that already have a name.
    fn most_recent_named_key(&self) -> Option<String> {
        self.buffers
            .values()
            .filter(|b| !b.name.is_empty())
            .max_by_key(|b| (!b.arguments.is_empty(), b.last_updated))
            .map(|b| b.id.clone())
    }

    /// Removes and returns every buffer that is now harvestable, then runs
    /// stale-buffer GC over what remains (§4.2 "on every harvest attempt").
    pub fn harvest(&mut self) -> Vec<ToolCall> {
        let mut harvested = Vec::new();
        let mut ready_ids = Vec::new();

        for (id, buffer) in self.buffers.iter_mut() {
            ensure_dialect(buffer);
            if let Some(dialect) = buffer.dialect {
                if !buffer.name.is_empty() && dialect::is_complete(dialect, &buffer.arguments) {
                    ready_ids.push(id.clone());
                }
            }
        }

        for id in ready_ids {
            if let Some(buffer) = self.buffers.remove(&id) {
                harvested.push(to_tool_call(&buffer));
            }
        }

        self.gc();
        harvested
    }

    /// Stale-buffer GC per §4.2: 30s without update, synthetic+empty, or
    /// dialect-never-resolved after 5s.
    fn gc(&mut self) {
        let now = std::time::Instant::now();
        self.buffers.retain(|_, buffer| {
            let age = now.saturating_duration_since(buffer.last_updated);
            if age > self.stale_buffer {
                log::warn!("reassembler: dropping stale buffer {} after {:?}", buffer.id, age);
                return false;
            }
            if buffer.synthetic_id && buffer.name.is_empty() && buffer.arguments.is_empty() {
                return false;
            }
            if buffer.dialect.is_none() && buffer.arguments.is_empty() && age > self.empty_buffer_fail {
                log::warn!("reassembler: dropping buffer {} with unresolved dialect", buffer.id);
                return false;
            }
            true
        });
    }

    /// Stream has ended: harvest whatever is complete, then run heuristic recovery on
    /// anything left with a name but unparseable arguments, and drop the rest.
    pub fn finish(&mut self) -> Vec<ToolCall> {
        let mut calls = self.harvest();
        let remaining: Vec<ToolCallBuffer> = self.buffers.drain().map(|(_, b)| b).collect();
        for buffer in remaining {
            if buffer.name.is_empty() {
                continue;
            }
            let pairs = recovery::extract_kv_pairs(&buffer.arguments);
            let name = recovery::extract_name(&buffer.arguments).unwrap_or_else(|| buffer.name.clone());
            if !pairs.is_empty() || !name.is_empty() {
                calls.push(ToolCall {
                    id: synthesize_id(),
                    kind: "function".to_string(),
                    name,
                    arguments: recovery::kv_pairs_to_json(&pairs),
                });
            } else {
                log::warn!("reassembler: discarding unrecoverable buffer {}", buffer.id);
            }
        }
        calls
    }
}

fn apply(buffer: &mut ToolCallBuffer, name: Option<String>, arguments: Option<String>) {
    if let Some(name) = name {
        buffer.name.push_str(&name);
    }
    if let Some(arguments) = arguments {
        buffer.arguments.push_str(&arguments);
    }
    buffer.touch();
    ensure_dialect(buffer);
}

fn ensure_dialect(buffer: &mut ToolCallBuffer) {
    if buffer.dialect.is_some() {
        return;
    }
    let sample: &str = if !buffer.arguments.is_empty() {
        &buffer.arguments
    } else {
        &buffer.name
    };
    let detected = dialect::detect(sample);
    if detected != Dialect::Unknown {
        buffer.dialect = Some(detected);
    } else if !buffer.arguments.is_empty() {
        // Enough text to commit to "Unknown" rather than re-probing forever.
        buffer.dialect = Some(Dialect::Unknown);
    }
}

fn to_tool_call(buffer: &ToolCallBuffer) -> ToolCall {
    let arguments = match buffer.dialect {
        Some(Dialect::AnthropicXml) | Some(Dialect::QwenGlmXml) => {
            let pairs = recovery::extract_kv_pairs(&buffer.arguments);
            recovery::kv_pairs_to_json(&pairs)
        }
        Some(Dialect::Unknown) if !dialect::is_valid(Dialect::OpenAiJson, &buffer.arguments) => {
            let pairs = recovery::extract_kv_pairs(&buffer.arguments);
            recovery::kv_pairs_to_json(&pairs)
        }
        _ => buffer.arguments.clone(),
    };

    let name = if buffer.name.is_empty() {
        recovery::extract_name(&buffer.arguments).unwrap_or_default()
    } else {
        buffer.name.clone()
    };

    ToolCall {
        id: buffer.id.clone(),
        kind: "function".to_string(),
        name,
        arguments,
    }
}

fn synthesize_id() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("temp_{}", now.as_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallFragment {
        ToolCallFragment {
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: args.map(str::to_string),
        }
    }

    #[test]
    fn s1_single_call_happy_path() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_secs(5));
        r.feed(fragment(Some("c1"), Some("bash"), Some(r#"{"command":"ls"}"#)));
        let calls = r.harvest();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "bash");
        assert_eq!(calls[0].arguments, r#"{"command":"ls"}"#);
        assert!(r.is_empty());
    }

    #[test]
    fn s2_fragmented_id_less_continuation() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_secs(5));
        r.feed(fragment(Some("t1"), Some("read"), None));
        r.feed(fragment(None, None, Some(r#"{"pa"#)));
        r.feed(fragment(None, None, Some(r#"th":"#)));
        r.feed(fragment(None, None, Some(r#""/etc/hosts"}"#)));
        let calls = r.harvest();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read");
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["path"], "/etc/hosts");
    }

    #[test]
    fn s3_qwen_xml_single_frame() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_secs(5));
        r.feed(fragment(
            None,
            Some("list"),
            Some("<tool_call><function=list><parameter=path>/</parameter></function></tool_call>"),
        ));
        let calls = r.harvest();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list");
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["path"], "/");
    }

    #[test]
    fn anthropic_xml_invoke_dialect() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_secs(5));
        r.feed(fragment(
            None,
            Some("bash"),
            Some(r#"<invoke name="bash"><parameter name="command">ls -la</parameter></invoke>"#),
        ));
        let calls = r.harvest();
        assert_eq!(calls.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["command"], "ls -la");
    }

    #[test]
    fn incomplete_call_is_not_harvested_until_closed() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_secs(5));
        r.feed(fragment(Some("c1"), Some("bash"), Some(r#"{"command":"l"#)));
        assert!(r.harvest().is_empty());
        r.feed(fragment(Some("c1"), None, Some(r#"s"}"#)));
        assert_eq!(r.harvest().len(), 1);
    }

    #[test]
    fn unresolvable_empty_buffer_ages_out_after_empty_buffer_fail() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_millis(0));
        r.feed(fragment(Some("c1"), None, None));
        assert!(r.harvest().is_empty());
        assert!(r.is_empty());
    }

    #[test]
    fn stale_buffer_is_gced() {
        let mut r = Reassembler::new(Duration::from_millis(0), Duration::from_secs(5));
        r.feed(fragment(Some("c1"), Some("bash"), Some(r#"{"command":"l"#)));
        assert!(r.harvest().is_empty());
        assert!(r.is_empty());
    }

    #[test]
    fn end_of_stream_recovery_extracts_partial_xml() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_secs(5));
        r.feed(fragment(
            None,
            Some("bash"),
            Some(r#"<invoke name="bash"><parameter name="command">ls"#),
        ));
        let calls = r.finish();
        assert_eq!(calls.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["command"], "ls");
    }

    #[test]
    fn buffer_table_empty_after_full_lifecycle() {
        let mut r = Reassembler::new(Duration::from_secs(30), Duration::from_secs(5));
        r.feed(fragment(Some("c1"), Some("bash"), Some(r#"{"command":"ls"}"#)));
        r.harvest();
        r.finish();
        assert!(r.is_empty());
    }
}
