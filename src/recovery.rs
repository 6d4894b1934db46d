//! Heuristic extraction shared by the SSE fallback path (C1) and the reassembler's
//! end-of-stream error recovery (C2).
//!
//! No regex crate is used here; providers that need this path emit hand-rolled XML-ish
//! fragments, and a handful of `find`/`split` passes is both faster and easier to
//! reason about than compiling a pattern for each tag shape.

/// Looks for `<function=NAME>` or `name="NAME"`, in that priority order.
pub fn extract_name(text: &str) -> Option<String> {
    if let Some(rest) = text.split("<function=").nth(1) {
        if let Some(end) = rest.find('>') {
            let name = &rest[..end];
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    if let Some(rest) = text.split("name=\"").nth(1) {
        if let Some(end) = rest.find('"') {
            let name = &rest[..end];
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Collects key/value pairs from any of the three supported shapes:
/// `<parameter=K>V</parameter>`, `<arg_key>K</arg_key><arg_value>V</arg_value>`,
/// `<argkey>K</argkey><argvalue>V</argvalue>`.
pub fn extract_kv_pairs(text: &str) -> Vec<(String, String)> {
    let mut pairs = extract_parameter_eq_tags(text);
    pairs.extend(extract_parameter_attr_tags(text));
    pairs.extend(extract_paired_tags(text, "arg_key", "arg_value"));
    pairs.extend(extract_paired_tags(text, "argkey", "argvalue"));
    pairs
}

/// Anthropic-style `<parameter name="K">V</parameter>` (attribute form).
fn extract_parameter_attr_tags(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("<parameter name=\"") {
        rest = &rest[start + "<parameter name=\"".len()..];
        let Some(name_end) = rest.find('"') else { break };
        let key = rest[..name_end].to_string();
        rest = &rest[name_end + 1..];
        let Some(tag_end) = rest.find('>') else { break };
        rest = &rest[tag_end + 1..];
        let Some(value_end) = rest.find("</parameter>") else { break };
        let value = rest[..value_end].to_string();
        rest = &rest[value_end + "</parameter>".len()..];
        out.push((key, value));
    }
    out
}

/// Qwen/GLM-style `<parameter=K>V</parameter>` (inline-equals form).
fn extract_parameter_eq_tags(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("<parameter=") {
        rest = &rest[start + "<parameter=".len()..];
        let Some(name_end) = rest.find('>') else { break };
        let key = rest[..name_end].to_string();
        rest = &rest[name_end + 1..];
        let Some(value_end) = rest.find("</parameter>") else { break };
        let value = rest[..value_end].to_string();
        rest = &rest[value_end + "</parameter>".len()..];
        out.push((key, value));
    }
    out
}

fn extract_paired_tags(text: &str, key_tag: &str, value_tag: &str) -> Vec<(String, String)> {
    let open_key = format!("<{key_tag}>");
    let close_key = format!("</{key_tag}>");
    let open_value = format!("<{value_tag}>");
    let close_value = format!("</{value_tag}>");

    let mut out = Vec::new();
    let mut rest = text;
    loop {
        let Some(k_start) = rest.find(&open_key) else { break };
        let after_k = &rest[k_start + open_key.len()..];
        let Some(k_end) = after_k.find(&close_key) else { break };
        let key = after_k[..k_end].to_string();
        let after_key_close = &after_k[k_end + close_key.len()..];

        let Some(v_start) = after_key_close.find(&open_value) else { break };
        let after_v = &after_key_close[v_start + open_value.len()..];
        let Some(v_end) = after_v.find(&close_value) else { break };
        let value = after_v[..v_end].to_string();

        out.push((key, value));
        rest = &after_v[v_end + close_value.len()..];
    }
    out
}

/// Encodes recovered key/value pairs as a flat JSON object string, the same
/// representation XML-dialect harvests use for `ToolCall::arguments`.
pub fn kv_pairs_to_json(pairs: &[(String, String)]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = pairs
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    serde_json::Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_function_name() {
        assert_eq!(extract_name("<function=list>"), Some("list".to_string()));
    }

    #[test]
    fn extracts_quoted_name() {
        assert_eq!(extract_name(r#"<invoke name="bash">"#), Some("bash".to_string()));
    }

    #[test]
    fn extracts_parameter_tags() {
        let pairs = extract_kv_pairs("<parameter=path>/</parameter><parameter=recursive>true</parameter>");
        assert_eq!(
            pairs,
            vec![
                ("path".to_string(), "/".to_string()),
                ("recursive".to_string(), "true".to_string())
            ]
        );
    }

    #[test]
    fn extracts_parameter_attr_tags() {
        let pairs = extract_kv_pairs(r#"<parameter name="command">ls -la</parameter>"#);
        assert_eq!(pairs, vec![("command".to_string(), "ls -la".to_string())]);
    }

    #[test]
    fn extracts_arg_key_value_tags() {
        let pairs = extract_kv_pairs("<arg_key>path</arg_key><arg_value>/etc/hosts</arg_value>");
        assert_eq!(pairs, vec![("path".to_string(), "/etc/hosts".to_string())]);
    }

    #[test]
    fn extracts_argkey_argvalue_tags() {
        let pairs = extract_kv_pairs("<argkey>path</argkey><argvalue>/tmp</argvalue>");
        assert_eq!(pairs, vec![("path".to_string(), "/tmp".to_string())]);
    }

    #[test]
    fn kv_pairs_encode_as_json_object() {
        let json = kv_pairs_to_json(&[("path".to_string(), "/".to_string())]);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["path"], "/");
    }
}
