//! The OpenAI-compatible adapter: line-delimited SSE framing. Also serves
//! locally-hosted OpenAI-compatible runtimes — same wire format, just a
//! different `ProviderConfig` (distinct base URL, optional API key).

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};

use super::{AccumulatedToolCall, FinishReason, GenerationArgs, NormalizedEvent, ProviderAdapter, ProviderConfig};
use crate::context::NeutralEntry;
use crate::error::CoreResult;
use crate::tools::ToolDefinition;

pub struct OpenAiAdapter {
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts one neutral entry into an OpenAI-shaped chat message object.
/// Pure function so it can be unit-tested without a network call.
pub fn build_openai_message(entry: &NeutralEntry) -> Option<Value> {
    match entry.role.as_str() {
        "system" => Some(json!({ "role": "system", "content": entry.body.clone().unwrap_or_default() })),
        "tool" => {
            let content = entry.body.clone().unwrap_or_else(|| "[Tool Execution Result Missing]".to_string());
            let Some(tool_call_id) = &entry.tool_call_id else {
                return None;
            };
            Some(json!({ "role": "tool", "content": content, "tool_call_id": tool_call_id }))
        }
        "assistant" => {
            let mut obj = serde_json::Map::new();
            obj.insert("role".into(), json!("assistant"));
            obj.insert("content".into(), content_value(entry));
            if let Some(tool_calls) = &entry.tool_calls {
                if !tool_calls.is_empty() {
                    obj.insert(
                        "tool_calls".into(),
                        json!(tool_calls
                            .iter()
                            .map(|c| json!({
                                "id": c.id,
                                "type": c.kind,
                                "function": { "name": c.function.name, "arguments": c.function.arguments },
                            }))
                            .collect::<Vec<_>>()),
                    );
                }
            }
            Some(Value::Object(obj))
        }
        "user" => Some(json!({ "role": "user", "content": content_value(entry) })),
        _ => None,
    }
}

fn content_value(entry: &NeutralEntry) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    if let Some(body) = &entry.body {
        if !body.is_empty() {
            parts.push(json!({ "type": "text", "text": body }));
        }
    }

    let mut file_text = String::new();
    for attachment in &entry.attachments {
        match attachment.kind.as_str() {
            "image" => {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{}", attachment.content) }
                }));
            }
            _ => {
                file_text.push_str(&format!(
                    "\n\n--- Attached File: {} ---\n{}\n--- End File ---",
                    attachment.name.as_deref().unwrap_or("file"),
                    attachment.content
                ));
            }
        }
    }
    if !file_text.is_empty() {
        if let Some(last_text) = parts.iter_mut().rev().find(|p| p.get("type").and_then(Value::as_str) == Some("text")) {
            if let Some(Value::String(text)) = last_text.get_mut("text") {
                text.push_str(&file_text);
            }
        } else {
            parts.push(json!({ "type": "text", "text": file_text.trim_start() }));
        }
    }

    match parts.len() {
        0 => Value::String(String::new()),
        1 if parts[0].get("type").and_then(Value::as_str) == Some("text") => {
            parts[0].get("text").cloned().unwrap_or(Value::String(String::new()))
        }
        _ => Value::Array(parts),
    }
}

pub fn build_openai_request_body(
    model: &str,
    history: &[NeutralEntry],
    tools: &[ToolDefinition],
    gen_args: &GenerationArgs,
) -> Value {
    let messages: Vec<Value> = history.iter().filter_map(build_openai_message).collect();
    let mut body = serde_json::Map::new();
    body.insert("model".into(), json!(model));
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(true));
    if !tools.is_empty() {
        body.insert(
            "tools".into(),
            json!(tools.iter().map(ToolDefinition::to_openai_function_schema).collect::<Vec<_>>()),
        );
    }
    for (k, v) in gen_args {
        body.insert(k.clone(), v.clone());
    }
    Value::Object(body)
}

/// Parses one already-unwrapped `data: ...` payload and folds any
/// in-progress native tool calls into `tool_states`, keyed by stream
/// `index` (not `id`, which may appear only in the first fragment).
pub fn parse_openai_data_line(
    data: &str,
    tool_states: &mut HashMap<usize, AccumulatedToolCall>,
    tool_order: &mut Vec<usize>,
) -> CoreResult<(Vec<NormalizedEvent>, bool)> {
    if data == "[DONE]" {
        let calls = drain_tool_states(tool_states, tool_order);
        let mut events = Vec::new();
        if !calls.is_empty() {
            events.push(NormalizedEvent::Finish { reason: FinishReason::ToolCalls, tool_calls: calls });
        }
        events.push(NormalizedEvent::Done);
        return Ok((events, true));
    }

    let parsed: Value = serde_json::from_str(data)?;
    let mut events = Vec::new();

    let choice = parsed.get("choices").and_then(|c| c.get(0));
    let Some(choice) = choice else { return Ok((events, false)) };
    let delta = choice.get("delta");

    if let Some(content) = delta.and_then(|d| d.get("content")).and_then(Value::as_str) {
        if !content.is_empty() {
            events.push(NormalizedEvent::ContentDelta(content.to_string()));
        }
    }
    let reasoning = delta
        .and_then(|d| d.get("reasoning"))
        .or_else(|| delta.and_then(|d| d.get("reasoning_content")))
        .and_then(Value::as_str);
    if let Some(reasoning) = reasoning {
        if !reasoning.is_empty() {
            events.push(NormalizedEvent::ThinkingDelta(reasoning.to_string()));
        }
    }

    if let Some(tool_calls) = delta.and_then(|d| d.get("tool_calls")).and_then(Value::as_array) {
        for tc in tool_calls {
            let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let id = tc.get("id").and_then(Value::as_str).map(str::to_string);
            let name = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let arguments_fragment = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let entry = tool_states.entry(index).or_insert_with(|| {
                tool_order.push(index);
                AccumulatedToolCall::default()
            });
            if let Some(id) = &id {
                entry.id = id.clone();
            }
            if let Some(name) = &name {
                entry.name = name.clone();
            }
            if let Some(frag) = &arguments_fragment {
                entry.arguments.push_str(frag);
            }

            events.push(NormalizedEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_fragment,
            });
        }
    }

    if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
        let reason = match finish_reason {
            "tool_calls" => FinishReason::ToolCalls,
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        };
        let calls = if reason == FinishReason::ToolCalls {
            drain_tool_states(tool_states, tool_order)
        } else {
            Vec::new()
        };
        events.push(NormalizedEvent::Finish { reason, tool_calls: calls });
    }

    Ok((events, false))
}

fn drain_tool_states(
    tool_states: &mut HashMap<usize, AccumulatedToolCall>,
    tool_order: &mut Vec<usize>,
) -> Vec<AccumulatedToolCall> {
    let calls = tool_order
        .drain(..)
        .filter_map(|idx| tool_states.remove(&idx))
        .collect();
    calls
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn stream_chat(
        &self,
        config: &ProviderConfig,
        history: &[NeutralEntry],
        tools: &[ToolDefinition],
        gen_args: &GenerationArgs,
    ) -> CoreResult<BoxStream<'static, NormalizedEvent>> {
        let body = build_openai_request_body(&config.model_identifier, history, tools, gen_args);
        let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

        let mut req = self.client.post(&url).json(&body).header("Accept", "text/event-stream");
        if let Some(key) = &config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Ok(Box::pin(futures::stream::once(async move {
                NormalizedEvent::Error(format!("provider returned {status}: {text}"))
            })));
        }

        let byte_stream = response.bytes_stream();

        struct State {
            byte_stream: BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
            buffer: String,
            pending: std::collections::VecDeque<NormalizedEvent>,
            tool_states: HashMap<usize, AccumulatedToolCall>,
            tool_order: Vec<usize>,
            saw_terminator: bool,
            finished: bool,
        }

        let state = State {
            byte_stream: Box::pin(byte_stream),
            buffer: String::new(),
            pending: std::collections::VecDeque::new(),
            tool_states: HashMap::new(),
            tool_order: Vec::new(),
            saw_terminator: false,
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = state.buffer.find('\n') {
                            let line = state.buffer[..pos].trim_end_matches('\r').to_string();
                            state.buffer.drain(..=pos);
                            let trimmed = line.trim();
                            if trimmed.is_empty() || !trimmed.starts_with("data:") {
                                continue;
                            }
                            let data = trimmed["data:".len()..].trim();
                            if data.is_empty() {
                                continue;
                            }
                            match parse_openai_data_line(data, &mut state.tool_states, &mut state.tool_order) {
                                Ok((events, terminated)) => {
                                    state.pending.extend(events);
                                    if terminated {
                                        state.saw_terminator = true;
                                        state.finished = true;
                                    }
                                }
                                Err(e) => {
                                    state.pending.push_back(NormalizedEvent::Error(e.to_string()));
                                    state.finished = true;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.pending.push_back(NormalizedEvent::Error(e.to_string()));
                        state.finished = true;
                    }
                    None => {
                        // Stream closed without a `data: [DONE]` terminator.
                        // Treated as a clean finish rather than an error.
                        if !state.saw_terminator {
                            tracing::warn!("openai stream closed without a [DONE] terminator");
                            let calls = drain_tool_states(&mut state.tool_states, &mut state.tool_order);
                            state.pending.push_back(NormalizedEvent::Finish {
                                reason: if calls.is_empty() { FinishReason::Stop } else { FinishReason::ToolCalls },
                                tool_calls: calls,
                            });
                            state.pending.push_back(NormalizedEvent::Done);
                        }
                        state.finished = true;
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NeutralEntry;

    #[test]
    fn text_only_user_message_becomes_plain_string_content() {
        let entry = NeutralEntry { role: "user".into(), body: Some("hi".into()), ..Default::default() };
        let msg = build_openai_message(&entry).unwrap();
        assert_eq!(msg["content"], json!("hi"));
    }

    #[test]
    fn image_attachment_produces_content_parts_array() {
        let entry = NeutralEntry {
            role: "user".into(),
            body: Some("look".into()),
            attachments: vec![crate::context::NeutralAttachment {
                kind: "image".into(),
                content: "AAAA".into(),
                name: None,
            }],
            ..Default::default()
        };
        let msg = build_openai_message(&entry).unwrap();
        let parts = msg["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["type"], json!("image_url"));
    }

    #[test]
    fn tool_entry_requires_tool_call_id_and_carries_content() {
        let entry = NeutralEntry {
            role: "tool".into(),
            body: Some("12".into()),
            tool_call_id: Some("call_1".into()),
            ..Default::default()
        };
        let msg = build_openai_message(&entry).unwrap();
        assert_eq!(msg["role"], json!("tool"));
        assert_eq!(msg["tool_call_id"], json!("call_1"));
    }

    #[test]
    fn assistant_entry_with_tool_calls_keeps_empty_content_present() {
        let entry = NeutralEntry {
            role: "assistant".into(),
            body: None,
            tool_calls: Some(vec![crate::model::ToolCallPayload {
                id: "call_1".into(),
                kind: "function".into(),
                function: crate::model::ToolCallFunction { name: "add".into(), arguments: "{\"a\":1,\"b\":2}".into() },
            }]),
            ..Default::default()
        };
        let msg = build_openai_message(&entry).unwrap();
        assert_eq!(msg["content"], json!(""));
        assert!(msg["tool_calls"].is_array());
    }

    #[test]
    fn tool_call_fragments_reassemble_by_index_not_id() {
        let mut states = HashMap::new();
        let mut order = Vec::new();
        let first = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"add","arguments":"{\"a\""}}]}}]}"#;
        let second = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1,\"b\":2}"}}]}}]}"#;
        let third = r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#;

        parse_openai_data_line(first, &mut states, &mut order).unwrap();
        parse_openai_data_line(second, &mut states, &mut order).unwrap();
        let (events, terminated) = parse_openai_data_line(third, &mut states, &mut order).unwrap();
        assert!(!terminated);

        let finish = events.iter().find_map(|e| match e {
            NormalizedEvent::Finish { tool_calls, .. } => Some(tool_calls),
            _ => None,
        }).unwrap();
        assert_eq!(finish.len(), 1);
        assert_eq!(finish[0].id, "call_abc");
        assert_eq!(finish[0].name, "add");
        assert_eq!(finish[0].arguments, "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn done_terminator_drains_any_pending_tool_state_and_emits_done() {
        let mut states = HashMap::new();
        let mut order = Vec::new();
        let (events, terminated) = parse_openai_data_line("[DONE]", &mut states, &mut order).unwrap();
        assert!(terminated);
        assert!(matches!(events.last(), Some(NormalizedEvent::Done)));
    }
}
