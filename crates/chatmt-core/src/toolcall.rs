//! The Tool-Call Parser: scans accumulated assistant text for manually
//! authored `<tool_call name="..." id="...">...</tool_call>` markup, the
//! fallback path for providers/models that don't emit native tool calls.

use regex::Regex;
use serde_json::Value;

fn tool_call_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)<tool_call\s+name="([\w.\-]+)"(?:\s+id="([\w\-]+)")?\s*>(.*?)</tool_call>"#)
            .expect("valid regex")
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub id: String,
    pub arguments: Value,
}

/// Splits `text` into the leading prose (everything before the first
/// match) and the tool calls found in it, in order. Anything after the
/// final match is discarded — the model's turn ends at its last call.
pub fn extract_tool_calls(text: &str) -> (String, Vec<ParsedToolCall>) {
    let pattern = tool_call_pattern();
    let mut calls = Vec::new();
    let mut prose_end = text.len();
    let mut first_match = true;

    for (i, caps) in pattern.captures_iter(text).enumerate() {
        let whole = caps.get(0).unwrap();
        if first_match {
            prose_end = whole.start();
            first_match = false;
        }
        let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let id = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| format!("call_{}_{}", i, uuid::Uuid::new_v4()));
        let body = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");
        let arguments = effective_arguments(body);
        calls.push(ParsedToolCall { name, id, arguments });
    }

    let prose = text[..prose_end].to_string();
    (prose, calls)
}

/// A call body is usually a bare JSON object of arguments, but may also be
/// wrapped under an `arguments` or `input` key (models sometimes mimic the
/// native tool-call envelope inside the markup). Falls back to treating
/// non-JSON bodies as a single positional string argument under `"input"`.
fn effective_arguments(body: &str) -> Value {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return Value::Object(
            [("input".to_string(), Value::String(body.to_string()))]
                .into_iter()
                .collect(),
        );
    };
    match parsed {
        Value::Object(ref map) => {
            if let Some(args) = map.get("arguments") {
                args.clone()
            } else if let Some(input) = map.get("input") {
                input.clone()
            } else {
                parsed
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_single_call_with_explicit_id() {
        let text = r#"let me check<tool_call name="add" id="c1">{"a":1,"b":2}</tool_call>"#;
        let (prose, calls) = extract_tool_calls(text);
        assert_eq!(prose, "let me check");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "add");
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].arguments, json!({"a":1,"b":2}));
    }

    #[test]
    fn synthesizes_id_when_absent() {
        let text = r#"<tool_call name="echo">{"text":"hi"}</tool_call>"#;
        let (_, calls) = extract_tool_calls(text);
        assert!(calls[0].id.starts_with("call_0_"));
    }

    #[test]
    fn extracts_multiple_sequential_calls_and_drops_trailing_text() {
        let text = r#"<tool_call name="add" id="a">{"a":1,"b":1}</tool_call><tool_call name="echo" id="b">{"text":"x"}</tool_call>trailing junk"#;
        let (prose, calls) = extract_tool_calls(text);
        assert_eq!(prose, "");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "echo");
    }

    #[test]
    fn wraps_non_json_body_as_input_argument() {
        let text = r#"<tool_call name="echo" id="c1">just some text</tool_call>"#;
        let (_, calls) = extract_tool_calls(text);
        assert_eq!(calls[0].arguments, json!({"input": "just some text"}));
    }

    #[test]
    fn unwraps_arguments_key_when_model_mimics_native_envelope() {
        let text = r#"<tool_call name="add" id="c1">{"arguments":{"a":1,"b":2}}</tool_call>"#;
        let (_, calls) = extract_tool_calls(text);
        assert_eq!(calls[0].arguments, json!({"a":1,"b":2}));
    }

    #[test]
    fn no_match_returns_full_text_as_prose() {
        let text = "just a normal reply, no tools here";
        let (prose, calls) = extract_tool_calls(text);
        assert_eq!(prose, text);
        assert!(calls.is_empty());
    }
}
