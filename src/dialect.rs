//! Tool-call dialect detection and per-dialect completeness predicates.
//!
//! Detection runs once per buffer, against the first substantive fragment, and is
//! cached on the buffer (see `ToolCallBuffer::dialect`). The probes are priority
//! ordered: XML markers are checked before falling back to a JSON guess, since none of
//! the XML dialects can be mistaken for a `{`-prefixed JSON object.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAiJson,
    AnthropicXml,
    QwenGlmXml,
    Unknown,
}

/// Priority-ordered string probes. Returns `Unknown` when nothing matches yet — the
/// caller should retry detection on the next fragment rather than caching `Unknown`
/// permanently (an empty/short first fragment is common).
pub fn detect(sample: &str) -> Dialect {
    let s = sample.trim_start();
    if s.is_empty() {
        return Dialect::Unknown;
    }
    if s.starts_with("<invoke") || s.contains("<tool_use") {
        return Dialect::AnthropicXml;
    }
    if s.starts_with("<tool_call")
        || s.starts_with("<toolcall")
        || s.contains("<function=")
        || s.contains("<arg_key>")
        || s.contains("<argkey>")
    {
        return Dialect::QwenGlmXml;
    }
    if s.starts_with('{') || s.starts_with('"') {
        return Dialect::OpenAiJson;
    }
    Dialect::Unknown
}

pub fn is_valid(dialect: Dialect, body: &str) -> bool {
    match dialect {
        Dialect::OpenAiJson => is_valid_json(body),
        Dialect::AnthropicXml | Dialect::QwenGlmXml => angle_brackets_balanced(body),
        Dialect::Unknown => is_valid_json(body) || angle_brackets_balanced(body),
    }
}

pub fn is_complete(dialect: Dialect, body: &str) -> bool {
    match dialect {
        // Both `isValidJson` and `isCompleteJson` must agree; disagreement is treated
        // as not-complete (spec §9 Open Question).
        Dialect::OpenAiJson => is_valid_json(body) && is_complete_json(body),
        Dialect::AnthropicXml => has_closing_tag(body, &["</invoke>", "</tool_use>"]),
        Dialect::QwenGlmXml => has_closing_tag(body, &["</tool_call>", "</toolcall>", "</function>"]),
        Dialect::Unknown => {
            (is_valid_json(body) && is_complete_json(body))
                || has_closing_tag(body, &["</tool_call>", "</toolcall>", "</invoke>", "</tool_use>"])
        }
    }
}

fn is_valid_json(body: &str) -> bool {
    serde_json::from_str::<Value>(body.trim()).is_ok()
}

/// Brace-balanced, ignoring braces inside quoted strings, starting with `{` and ending
/// with `}`.
fn is_complete_json(body: &str) -> bool {
    let t = body.trim();
    if t.len() < 2 || !t.starts_with('{') || !t.ends_with('}') {
        return false;
    }
    let mut depth: i32 = 0;
    let mut in_str = false;
    let mut escape = false;
    for c in t.chars() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_str => escape = true,
            '"' => in_str = !in_str,
            '{' if !in_str => depth += 1,
            '}' if !in_str => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn angle_brackets_balanced(body: &str) -> bool {
    let opens = body.matches('<').count();
    let closes = body.matches('>').count();
    opens > 0 && opens == closes
}

fn has_closing_tag(body: &str, tags: &[&str]) -> bool {
    tags.iter().any(|tag| body.contains(tag)) || (angle_brackets_balanced(body) && body.trim_end().ends_with('>'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_openai_json() {
        assert_eq!(detect(r#"{"command":"ls"}"#), Dialect::OpenAiJson);
        assert_eq!(detect(""), Dialect::Unknown);
    }

    #[test]
    fn detects_anthropic_xml() {
        assert_eq!(
            detect(r#"<invoke name="bash"><parameter name="command">ls</parameter></invoke>"#),
            Dialect::AnthropicXml
        );
    }

    #[test]
    fn detects_qwen_glm_xml() {
        assert_eq!(
            detect("<tool_call><function=list><parameter=path>/</parameter></function></tool_call>"),
            Dialect::QwenGlmXml
        );
        assert_eq!(
            detect("<tool_call>read<arg_key>path</arg_key><arg_value>/etc/hosts</arg_value></tool_call>"),
            Dialect::QwenGlmXml
        );
    }

    #[test]
    fn json_completeness_requires_balance_and_validity() {
        assert!(is_complete(Dialect::OpenAiJson, r#"{"a":1}"#));
        assert!(!is_complete(Dialect::OpenAiJson, r#"{"a":1"#));
        assert!(!is_complete(Dialect::OpenAiJson, ""));
    }

    #[test]
    fn xml_completeness_requires_closing_tag() {
        assert!(is_complete(
            Dialect::QwenGlmXml,
            "<tool_call><function=list></function></tool_call>"
        ));
        assert!(!is_complete(Dialect::QwenGlmXml, "<tool_call><function=list>"));
    }
}
