//! The Google adapter: Gemini's `streamGenerateContent` endpoint doesn't
//! speak SSE, it streams one big JSON array one element at a time as the
//! connection stays open. `GoogleStreamParser` decodes that array
//! incrementally by retrying a full-value parse against the growing
//! buffer via `serde_json::Deserializer::from_str` + `Value::deserialize`
//! + `byte_offset()`, treating an EOF error as "need more bytes".

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{AccumulatedToolCall, FinishReason, GenerationArgs, NormalizedEvent, ProviderAdapter, ProviderConfig};
use crate::context::NeutralEntry;
use crate::error::CoreResult;
use crate::tools::ToolDefinition;

pub struct GoogleAdapter {
    client: reqwest::Client,
}

impl GoogleAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for GoogleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn google_role(role: &str) -> Option<&'static str> {
    match role {
        "user" => Some("user"),
        "assistant" => Some("model"),
        "tool" => Some("function"),
        "system" => None,
        _ => None,
    }
}

fn build_part(entry: &NeutralEntry) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    if let Some(body) = &entry.body {
        if !body.is_empty() {
            parts.push(json!({ "text": body }));
        }
    }
    for attachment in &entry.attachments {
        if attachment.kind == "image" {
            parts.push(json!({
                "inlineData": { "mimeType": "image/jpeg", "data": attachment.content }
            }));
        } else {
            parts.push(json!({ "text": format!("\n\n--- Attached File: {} ---\n{}", attachment.name.as_deref().unwrap_or("file"), attachment.content) }));
        }
    }
    if let Some(tool_calls) = &entry.tool_calls {
        for call in tool_calls {
            let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Object(Default::default()));
            parts.push(json!({ "functionCall": { "name": call.function.name, "args": args } }));
        }
    }
    if entry.role == "tool" {
        let response: Value = entry
            .body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or_else(|| json!({ "result": entry.body.clone().unwrap_or_default() }));
        parts.push(json!({ "functionResponse": { "name": entry.tool_call_id.clone().unwrap_or_default(), "response": response } }));
    }
    json!(parts)
}

pub fn build_google_request_body(
    history: &[NeutralEntry],
    tools: &[ToolDefinition],
    gen_args: &GenerationArgs,
) -> Value {
    let mut contents = Vec::new();
    let mut system_instruction = None;

    for entry in history {
        if entry.role == "system" {
            system_instruction = entry.body.clone();
            continue;
        }
        let Some(role) = google_role(&entry.role) else { continue };
        contents.push(json!({ "role": role, "parts": build_part(entry) }));
    }

    let mut body = serde_json::Map::new();
    body.insert("contents".into(), json!(contents));
    if let Some(sys) = system_instruction {
        body.insert("systemInstruction".into(), json!({ "parts": [{ "text": sys }] }));
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                let schema = t.to_openai_function_schema();
                json!({
                    "name": schema["function"]["name"],
                    "description": schema["function"]["description"],
                    "parameters": schema["function"]["parameters"],
                })
            })
            .collect();
        body.insert("tools".into(), json!([{ "functionDeclarations": declarations }]));
    }
    if !gen_args.is_empty() {
        body.insert("generationConfig".into(), Value::Object(gen_args.clone()));
    }
    Value::Object(body)
}

/// Incremental decoder for the `[value, value, ...]` stream Gemini sends
/// back. Fed raw bytes as they arrive; emits one `Value` per complete
/// array element as soon as enough bytes have accumulated to decode it.
#[derive(Default)]
struct GoogleStreamParser {
    buffer: String,
    opened: bool,
}

impl GoogleStreamParser {
    fn feed(&mut self, chunk: &str) -> CoreResult<Vec<Value>> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let trimmed_start = self.buffer.trim_start();
            let consumed = self.buffer.len() - trimmed_start.len();
            if consumed > 0 {
                self.buffer.drain(..consumed);
            }
            if self.buffer.is_empty() {
                break;
            }

            if !self.opened {
                if self.buffer.starts_with('[') {
                    self.buffer.drain(..1);
                    self.opened = true;
                    continue;
                } else {
                    // Not enough bytes yet to know, or a malformed stream;
                    // wait for more data rather than erroring out early.
                    break;
                }
            }

            let first = self.buffer.chars().next().unwrap();
            if first == ',' {
                self.buffer.drain(..1);
                continue;
            }
            if first == ']' {
                self.buffer.drain(..1);
                break;
            }

            let mut de = serde_json::Deserializer::from_str(&self.buffer);
            match Value::deserialize(&mut de) {
                Ok(value) => {
                    let offset = de.byte_offset();
                    self.buffer.drain(..offset);
                    out.push(value);
                }
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(out)
    }
}

fn translate_candidate_chunk(value: &Value) -> Vec<NormalizedEvent> {
    let mut events = Vec::new();
    let Some(candidate) = value.get("candidates").and_then(|c| c.get(0)) else {
        return events;
    };

    if let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(Value::as_array) {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
                if is_thought {
                    events.push(NormalizedEvent::ThinkingDelta(text.to_string()));
                } else {
                    events.push(NormalizedEvent::ContentDelta(text.to_string()));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let args = call.get("args").cloned().unwrap_or(json!({}));
                events.push(NormalizedEvent::ToolCallDelta {
                    index: 0,
                    id: Some(uuid::Uuid::new_v4().to_string()),
                    name: Some(name),
                    arguments_fragment: Some(args.to_string()),
                });
            }
        }
    }

    if let Some(finish_reason) = candidate.get("finishReason").and_then(Value::as_str) {
        let reason = match finish_reason {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        };
        events.push(NormalizedEvent::Finish { reason, tool_calls: Vec::new() });
    }

    events
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    async fn stream_chat(
        &self,
        config: &ProviderConfig,
        history: &[NeutralEntry],
        tools: &[ToolDefinition],
        gen_args: &GenerationArgs,
    ) -> CoreResult<BoxStream<'static, NormalizedEvent>> {
        let body = build_google_request_body(history, tools, gen_args);
        let url = format!(
            "{}/models/{}:streamGenerateContent?key={}",
            config.base_url.trim_end_matches('/'),
            config.model_identifier,
            config.api_key.clone().unwrap_or_default(),
        );

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Ok(Box::pin(futures::stream::once(async move {
                NormalizedEvent::Error(format!("provider returned {status}: {text}"))
            })));
        }

        struct State {
            byte_stream: BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
            parser: GoogleStreamParser,
            pending: std::collections::VecDeque<NormalizedEvent>,
            any_tool_calls: Vec<AccumulatedToolCall>,
            finished: bool,
            emitted_finish: bool,
        }

        let state = State {
            byte_stream: Box::pin(response.bytes_stream()),
            parser: GoogleStreamParser::default(),
            pending: std::collections::VecDeque::new(),
            any_tool_calls: Vec::new(),
            finished: false,
            emitted_finish: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    if let NormalizedEvent::ToolCallDelta { id: Some(id), name: Some(name), arguments_fragment: Some(args), .. } = &event {
                        state.any_tool_calls.push(AccumulatedToolCall { id: id.clone(), name: name.clone(), arguments: args.clone() });
                    }
                    return Some((event, state));
                }
                if state.finished {
                    if !state.emitted_finish {
                        state.emitted_finish = true;
                        return Some((NormalizedEvent::Done, state));
                    }
                    return None;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        let text = String::from_utf8_lossy(&chunk).to_string();
                        match state.parser.feed(&text) {
                            Ok(values) => {
                                for v in &values {
                                    state.pending.extend(translate_candidate_chunk(v));
                                }
                            }
                            Err(e) => {
                                state.pending.push_back(NormalizedEvent::Error(e.to_string()));
                                state.finished = true;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.pending.push_back(NormalizedEvent::Error(e.to_string()));
                        state.finished = true;
                    }
                    None => {
                        // The array's closing `]` never arrived. Treated as a
                        // clean finish rather than an error.
                        tracing::warn!("google stream closed without a closing ']'");
                        let reason = if state.any_tool_calls.is_empty() { FinishReason::Stop } else { FinishReason::ToolCalls };
                        state.pending.push_back(NormalizedEvent::Finish { reason, tool_calls: std::mem::take(&mut state.any_tool_calls) });
                        state.finished = true;
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
