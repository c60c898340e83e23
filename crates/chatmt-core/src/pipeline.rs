//! The Generation Pipeline: the LLM↔tool orchestration loop. Streams
//! normalized provider events to the client as unified SSE events while
//! persisting segments to the Message Store as it goes.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AccumulatedToolCall, FinishReason, GenerationArgs, GoogleAdapter, NormalizedEvent, OpenAiAdapter, ProviderAdapter, ProviderConfig};
use crate::context::{self, ContextOptions, NeutralEntry};
use crate::error::{CoreError, CoreResult};
use crate::model::{CharacterId, ChatId, EmbeddedModelBinding, MessageId, ToolCallFunction, ToolCallPayload};
use crate::models::{ModelCatalog, ProviderKind};
use crate::registry::GenerationRegistry;
use crate::store::{CreateMessageArgs, MessageStore};
use crate::toolcall::extract_tool_calls;
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenEvent {
    Chunk { data: String },
    ThinkingStart,
    ThinkingChunk { data: String },
    ThinkingEnd,
    ToolCall { name: String, id: String, arguments: Value },
    ToolStart { name: String, args: Value },
    ToolResult { name: String, id: String, result: String, #[serde(skip_serializing_if = "Option::is_none")] error: Option<String> },
    ToolEnd { name: String, result: String, #[serde(skip_serializing_if = "Option::is_none")] error: Option<String> },
    Error { message: String },
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub parent_message_id: MessageId,
    pub model_name: String,
    pub generation_args: GenerationArgs,
    pub tools_enabled: bool,
    pub enabled_tool_names: Option<Vec<String>>,
    pub character_id: Option<CharacterId>,
    pub cot_start_tag: Option<String>,
    pub cot_end_tag: Option<String>,
    pub preserve_thinking: bool,
    pub max_tool_calls: i64,
    pub resolve_local_runtime_model: bool,
}

pub struct AdapterSet {
    pub openai: Arc<dyn ProviderAdapter>,
    pub google: Arc<dyn ProviderAdapter>,
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self { openai: Arc::new(OpenAiAdapter::new()), google: Arc::new(GoogleAdapter::new()) }
    }
}

impl AdapterSet {
    fn get(&self, provider: ProviderKind) -> &dyn ProviderAdapter {
        match provider {
            ProviderKind::OpenAi | ProviderKind::Local => self.openai.as_ref(),
            ProviderKind::Google => self.google.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn MessageStore>,
    pub registry: GenerationRegistry,
    pub tools: Arc<ToolRegistry>,
    pub catalog: Arc<ModelCatalog>,
    pub adapters: Arc<AdapterSet>,
}

/// Holdback-aware scanner that toggles a thinking region on and off as an
/// inline `<think>...</think>` pair streams in piecemeal, without ever
/// emitting a chunk that straddles a partially-received tag.
struct DelimScanner {
    start_tag: String,
    end_tag: String,
    pending: String,
}

enum DelimOutput {
    Content(String),
    ThinkingOpen,
    ThinkingChunk(String),
    ThinkingClose,
}

impl DelimScanner {
    fn new(start_tag: String, end_tag: String) -> Self {
        Self { start_tag, end_tag, pending: String::new() }
    }

    fn longest_suffix_prefix_overlap(buf: &str, tag: &str) -> usize {
        let max = tag.len().saturating_sub(1).min(buf.len());
        for len in (1..=max).rev() {
            if buf.ends_with(&tag[..len]) {
                return len;
            }
        }
        0
    }

    fn feed(&mut self, fragment: &str, thinking_open: &mut bool) -> Vec<DelimOutput> {
        self.pending.push_str(fragment);
        let mut out = Vec::new();

        loop {
            let tag = if *thinking_open { &self.end_tag } else { &self.start_tag };
            if let Some(idx) = self.pending.find(tag.as_str()) {
                let before: String = self.pending.drain(..idx).collect();
                self.pending.drain(..tag.len());
                if !before.is_empty() {
                    out.push(if *thinking_open { DelimOutput::ThinkingChunk(before) } else { DelimOutput::Content(before) });
                }
                if *thinking_open {
                    *thinking_open = false;
                    out.push(DelimOutput::ThinkingClose);
                } else {
                    *thinking_open = true;
                    out.push(DelimOutput::ThinkingOpen);
                }
                continue;
            }

            let holdback = Self::longest_suffix_prefix_overlap(&self.pending, tag);
            let flush_len = self.pending.len() - holdback;
            if flush_len > 0 {
                let flushed: String = self.pending.drain(..flush_len).collect();
                out.push(if *thinking_open { DelimOutput::ThinkingChunk(flushed) } else { DelimOutput::Content(flushed) });
            }
            break;
        }

        out
    }

    fn flush_remaining(&mut self, thinking_open: bool) -> Option<DelimOutput> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(if thinking_open { DelimOutput::ThinkingChunk(rest) } else { DelimOutput::Content(rest) })
    }
}

#[derive(PartialEq)]
enum ThinkingSource {
    Native,
    Delimiter,
}

impl Pipeline {
    /// Validates the request and registers the chat's cancellation token
    /// synchronously (so `conflict`/`not_found`/`bad_request` errors can
    /// still be returned as a plain HTTP response before any SSE stream
    /// opens), then spawns the main loop and returns the event receiver.
    pub async fn start(&self, chat_id: ChatId, request: GenerateRequest) -> CoreResult<mpsc::Receiver<GenEvent>> {
        let character = match &request.character_id {
            Some(id) => Some(
                self.store
                    .get_character(id)
                    .await?
                    .ok_or_else(|| CoreError::not_found(format!("character {id} not found")))?,
            ),
            None => None,
        };

        let binding: Option<EmbeddedModelBinding> = character.as_ref().map(|c| c.model.clone());
        let model_entry = self.catalog.resolve(&request.model_name, binding.as_ref(), request.resolve_local_runtime_model)?;

        let all_messages = self.store.list_messages(&chat_id).await?;
        let context_opts = ContextOptions {
            system_prompt: character.as_ref().and_then(|c| if c.sysprompt.trim().is_empty() { None } else { Some(c.sysprompt.clone()) }),
            cot_start_tag: request.cot_start_tag.clone(),
            cot_end_tag: request.cot_end_tag.clone(),
            preserve_thinking: request.preserve_thinking,
        };
        let history = context::build_context(&all_messages, &request.parent_message_id, &context_opts)?;

        let token = self.registry.start(chat_id.clone()).await?;

        let (tx, rx) = mpsc::channel(64);
        let pipeline = self.clone();
        tracing::info!(%chat_id, model = %request.model_name, "starting generation");
        tokio::spawn(async move {
            pipeline.run(chat_id.clone(), request, model_entry, history, token, tx).await;
            pipeline.registry.finish(&chat_id).await;
            tracing::debug!(%chat_id, "generation task finished");
        });

        Ok(rx)
    }

    async fn run(
        &self,
        chat_id: ChatId,
        request: GenerateRequest,
        model_entry: crate::models::ModelEntry,
        mut history: Vec<NeutralEntry>,
        token: CancellationToken,
        tx: mpsc::Sender<GenEvent>,
    ) {
        let start_tag = request.cot_start_tag.clone().unwrap_or_else(|| "<think>".to_string());
        let end_tag = request.cot_end_tag.clone().unwrap_or_else(|| "</think>".to_string());
        let unbounded = request.max_tool_calls < 0;
        let mut tool_call_counter: i64 = 0;
        let mut current_parent = request.parent_message_id.clone();

        let tool_defs = if request.tools_enabled {
            self.tools.definitions_enabled(request.enabled_tool_names.as_deref())
        } else {
            Vec::new()
        };

        let config = ProviderConfig {
            base_url: model_entry.base_url.clone(),
            api_key: model_entry.api_key.clone(),
            model_identifier: model_entry.model_identifier.clone(),
        };
        let adapter = self.adapters.get(model_entry.provider);

        'outer: loop {
            if token.is_cancelled() {
                tracing::debug!(%chat_id, "generation cancelled before next LLM call");
                self.teardown_aborted(&chat_id, &current_parent, &request, String::new(), None, &tx).await;
                return;
            }

            let mut stream = match adapter.stream_chat(&config, &history, &tool_defs, &request.generation_args).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(%chat_id, error = %e.message, "provider request failed");
                    let _ = tx.send(GenEvent::Error { message: e.message }).await;
                    return;
                }
            };

            let mut content_acc = String::new();
            let mut thinking_acc = String::new();
            let mut thinking_open = false;
            let mut thinking_source: Option<ThinkingSource> = None;
            let mut scanner = DelimScanner::new(start_tag.clone(), end_tag.clone());
            let mut finish_tool_calls: Option<Vec<AccumulatedToolCall>> = None;
            let mut manual_calls = Vec::new();
            let mut stream_error: Option<String> = None;
            let mut aborted = false;

            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => { aborted = true; None }
                    ev = futures::StreamExt::next(&mut stream) => ev,
                };
                let Some(event) = next else { break };
                if aborted {
                    break;
                }

                match event {
                    NormalizedEvent::ContentDelta(text) => {
                        if thinking_open && thinking_source == Some(ThinkingSource::Native) {
                            thinking_open = false;
                            thinking_source = None;
                            let _ = tx.send(GenEvent::ThinkingEnd).await;
                        }
                        for out in scanner.feed(&text, &mut thinking_open) {
                            match out {
                                DelimOutput::Content(s) => {
                                    content_acc.push_str(&s);
                                    let _ = tx.send(GenEvent::Chunk { data: s }).await;
                                }
                                DelimOutput::ThinkingOpen => {
                                    thinking_source = Some(ThinkingSource::Delimiter);
                                    let _ = tx.send(GenEvent::ThinkingStart).await;
                                }
                                DelimOutput::ThinkingChunk(s) => {
                                    thinking_acc.push_str(&s);
                                    let _ = tx.send(GenEvent::ThinkingChunk { data: s }).await;
                                }
                                DelimOutput::ThinkingClose => {
                                    thinking_source = None;
                                    let _ = tx.send(GenEvent::ThinkingEnd).await;
                                }
                            }
                        }

                        let (prose, calls) = extract_tool_calls(&content_acc);
                        if !calls.is_empty() {
                            content_acc = prose;
                            manual_calls = calls;
                            break;
                        }
                    }
                    NormalizedEvent::ThinkingDelta(text) => {
                        if !thinking_open {
                            thinking_open = true;
                            thinking_source = Some(ThinkingSource::Native);
                            let _ = tx.send(GenEvent::ThinkingStart).await;
                        }
                        thinking_acc.push_str(&text);
                        let _ = tx.send(GenEvent::ThinkingChunk { data: text }).await;
                    }
                    NormalizedEvent::ToolCallDelta { .. } => {}
                    NormalizedEvent::Finish { reason, tool_calls } => {
                        if reason == FinishReason::ToolCalls && !tool_calls.is_empty() {
                            finish_tool_calls = Some(tool_calls);
                        }
                        break;
                    }
                    NormalizedEvent::Error(message) => {
                        stream_error = Some(message);
                        break;
                    }
                    NormalizedEvent::Done => break,
                }
            }

            if let Some(out) = scanner.flush_remaining(thinking_open) {
                match out {
                    DelimOutput::Content(s) => {
                        content_acc.push_str(&s);
                        let _ = tx.send(GenEvent::Chunk { data: s }).await;
                    }
                    DelimOutput::ThinkingChunk(s) => {
                        thinking_acc.push_str(&s);
                        let _ = tx.send(GenEvent::ThinkingChunk { data: s }).await;
                    }
                    _ => {}
                }
            }
            if thinking_open {
                let _ = tx.send(GenEvent::ThinkingEnd).await;
            }

            if aborted {
                self.teardown_aborted(&chat_id, &current_parent, &request, content_acc, non_empty(&thinking_acc), &tx).await;
                return;
            }

            if let Some(message) = stream_error {
                if !content_acc.is_empty() || !thinking_acc.is_empty() {
                    let _ = self
                        .persist_assistant(&chat_id, &current_parent, &content_acc, non_empty(&thinking_acc), None, &request)
                        .await;
                }
                let _ = tx.send(GenEvent::Error { message }).await;
                return;
            }

            let native_calls: Vec<ToolCallPayload> = finish_tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| ToolCallPayload { id: c.id, kind: "function".into(), function: ToolCallFunction { name: c.name, arguments: c.arguments } })
                .collect();
            let manual_payloads: Vec<ToolCallPayload> = manual_calls
                .iter()
                .map(|c| ToolCallPayload {
                    id: c.id.clone(),
                    kind: "function".into(),
                    function: ToolCallFunction { name: c.name.clone(), arguments: serde_json::to_string(&c.arguments).unwrap_or_default() },
                })
                .collect();
            let is_native = !native_calls.is_empty();
            let all_calls: Vec<ToolCallPayload> = if is_native { native_calls } else { manual_payloads };

            if all_calls.is_empty() {
                if !content_acc.is_empty() || !thinking_acc.is_empty() {
                    let _ = self
                        .persist_assistant(&chat_id, &current_parent, &content_acc, non_empty(&thinking_acc), None, &request)
                        .await;
                }
                let _ = tx.send(GenEvent::Done).await;
                return;
            }

            let can_dispatch = unbounded || tool_call_counter < request.max_tool_calls;

            if is_native {
                for call in &all_calls {
                    let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                    let _ = tx.send(GenEvent::ToolCall { name: call.function.name.clone(), id: call.id.clone(), arguments: args }).await;
                }
            }

            let assistant_id = match self
                .persist_assistant(&chat_id, &current_parent, &content_acc, non_empty(&thinking_acc), Some(all_calls.clone()), &request)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    let _ = tx.send(GenEvent::Error { message: e.message }).await;
                    return;
                }
            };

            let reconstructed_body = if request.preserve_thinking && !thinking_acc.is_empty() {
                format!("{start_tag}{thinking_acc}{end_tag}\n{content_acc}")
            } else {
                content_acc.clone()
            };
            history.push(NeutralEntry {
                role: "assistant".into(),
                body: if reconstructed_body.is_empty() { None } else { Some(reconstructed_body) },
                attachments: Vec::new(),
                tool_calls: Some(all_calls.clone()),
                tool_call_id: None,
            });

            if !can_dispatch {
                let _ = tx.send(GenEvent::Done).await;
                return;
            }

            current_parent = assistant_id;
            for call in &all_calls {
                let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                let _ = tx.send(GenEvent::ToolStart { name: call.function.name.clone(), args: args.clone() }).await;

                let outcome = self.tools.execute(&call.function.name, args, request.enabled_tool_names.as_deref()).await;
                let (result_text, error) = match outcome {
                    Ok(o) if !o.is_error => (o.output, None),
                    Ok(o) => (o.output.clone(), Some(o.output)),
                    Err(e) => (e.message.clone(), Some(e.message)),
                };

                let tool_msg_id = match self
                    .store
                    .create_message(
                        &chat_id,
                        CreateMessageArgs {
                            role: Some(crate::model::Role::Tool),
                            body: result_text.clone(),
                            parent_message_id: Some(current_parent.clone()),
                            tool_call_id: Some(call.id.clone()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        let _ = tx.send(GenEvent::Error { message: e.message }).await;
                        return;
                    }
                };
                let _ = tx
                    .send(GenEvent::ToolResult { name: call.function.name.clone(), id: call.id.clone(), result: result_text.clone(), error: error.clone() })
                    .await;
                let _ = tx.send(GenEvent::ToolEnd { name: call.function.name.clone(), result: result_text.clone(), error }).await;

                history.push(NeutralEntry {
                    role: "tool".into(),
                    body: Some(crate::tools::sanitize_tool_result(&result_text)),
                    attachments: Vec::new(),
                    tool_calls: None,
                    tool_call_id: Some(call.id.clone()),
                });

                current_parent = tool_msg_id;
            }

            tool_call_counter += all_calls.len() as i64;
            if !unbounded && tool_call_counter >= request.max_tool_calls {
                tracing::debug!(%chat_id, tool_call_counter, "max_tool_calls budget reached");
                break 'outer;
            }
        }
    }

    async fn persist_assistant(
        &self,
        chat_id: &ChatId,
        parent: &MessageId,
        body: &str,
        thinking: Option<String>,
        tool_calls: Option<Vec<ToolCallPayload>>,
        request: &GenerateRequest,
    ) -> CoreResult<MessageId> {
        let id = self
            .store
            .create_message(
                chat_id,
                CreateMessageArgs {
                    role: Some(crate::model::Role::Assistant),
                    body: body.to_string(),
                    parent_message_id: Some(parent.clone()),
                    model_name: Some(request.model_name.clone()),
                    tool_calls,
                    thinking_content: thinking,
                    ..Default::default()
                },
            )
            .await?;
        Ok(id)
    }

    async fn teardown_aborted(
        &self,
        chat_id: &ChatId,
        parent: &MessageId,
        request: &GenerateRequest,
        content_acc: String,
        thinking: Option<String>,
        tx: &mpsc::Sender<GenEvent>,
    ) {
        if !content_acc.is_empty() || thinking.is_some() {
            let _ = self.persist_assistant(chat_id, parent, &content_acc, thinking, None, request).await;
        }
        let _ = tx;
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    use crate::model::Role;
    use crate::models::ModelEntry;
    use crate::store::SqliteStore;
    use crate::tools::{register_builtin_tools, ToolDefinition};

    /// A scripted `ProviderAdapter`: each `stream_chat` call pops the next
    /// canned event sequence off the front of the queue. A script's events
    /// are chained with a stream that never resolves, so a turn that
    /// doesn't end in `Finish`/`Error`/`Done` hangs open rather than
    /// closing early, the way a real open connection would.
    struct FakeStreamingProvider {
        scripts: StdMutex<VecDeque<Vec<NormalizedEvent>>>,
    }

    impl FakeStreamingProvider {
        fn new(scripts: Vec<Vec<NormalizedEvent>>) -> Self {
            Self { scripts: StdMutex::new(scripts.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeStreamingProvider {
        async fn stream_chat(
            &self,
            _config: &ProviderConfig,
            _history: &[NeutralEntry],
            _tools: &[ToolDefinition],
            _gen_args: &GenerationArgs,
        ) -> CoreResult<BoxStream<'static, NormalizedEvent>> {
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(events) => Ok(Box::pin(futures::stream::iter(events).chain(futures::stream::pending()))),
                None => Err(CoreError::internal("fake provider script exhausted: unexpected extra stream_chat call")),
            }
        }
    }

    fn test_catalog() -> ModelCatalog {
        let mut models = HashMap::new();
        models.insert(
            "fake-model".to_string(),
            ModelEntry {
                provider: ProviderKind::OpenAi,
                base_url: "http://fake.invalid".into(),
                api_key: None,
                model_identifier: "fake-model".into(),
                supports_images: false,
            },
        );
        ModelCatalog { models, local_runtime: None }
    }

    fn test_pipeline(adapter: Arc<dyn ProviderAdapter>, store: Arc<dyn MessageStore>, tools: ToolRegistry) -> Pipeline {
        Pipeline {
            store,
            registry: GenerationRegistry::new(),
            tools: Arc::new(tools),
            catalog: Arc::new(test_catalog()),
            adapters: Arc::new(AdapterSet { openai: adapter, google: Arc::new(GoogleAdapter::new()) }),
        }
    }

    fn request(parent: MessageId, max_tool_calls: i64) -> GenerateRequest {
        GenerateRequest {
            parent_message_id: parent,
            model_name: "fake-model".into(),
            tools_enabled: true,
            max_tool_calls,
            ..Default::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<GenEvent>) -> Vec<GenEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn content_only_turn_persists_assistant_message_and_emits_done() {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let chat = store.create_chat(None).await.unwrap();
        let user_id = store
            .create_message(&chat.chat_id, CreateMessageArgs { body: "hi".into(), ..Default::default() })
            .await
            .unwrap();

        let provider = FakeStreamingProvider::new(vec![vec![
            NormalizedEvent::ContentDelta("hello".into()),
            NormalizedEvent::Finish { reason: FinishReason::Stop, tool_calls: Vec::new() },
        ]]);
        let pipeline = test_pipeline(Arc::new(provider), store.clone(), ToolRegistry::new());

        let rx = pipeline.start(chat.chat_id.clone(), request(user_id, -1)).await.unwrap();
        let events = drain(rx).await;

        assert!(events.iter().any(|e| matches!(e, GenEvent::Chunk { data } if data == "hello")));
        assert!(matches!(events.last(), Some(GenEvent::Done)));

        let messages = store.list_messages(&chat.chat_id).await.unwrap();
        let assistant = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
        assert_eq!(assistant.body, "hello");
    }

    #[tokio::test]
    async fn native_tool_call_dispatches_tool_and_continues_generation() {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let chat = store.create_chat(None).await.unwrap();
        let user_id = store
            .create_message(&chat.chat_id, CreateMessageArgs { body: "add 2 and 3".into(), ..Default::default() })
            .await
            .unwrap();

        let provider = FakeStreamingProvider::new(vec![
            vec![NormalizedEvent::Finish {
                reason: FinishReason::ToolCalls,
                tool_calls: vec![AccumulatedToolCall { id: "call_1".into(), name: "add".into(), arguments: r#"{"a":2,"b":3}"#.into() }],
            }],
            vec![
                NormalizedEvent::ContentDelta("the answer is 5".into()),
                NormalizedEvent::Finish { reason: FinishReason::Stop, tool_calls: Vec::new() },
            ],
        ]);

        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools);
        let pipeline = test_pipeline(Arc::new(provider), store.clone(), tools);

        let rx = pipeline.start(chat.chat_id.clone(), request(user_id, -1)).await.unwrap();
        let events = drain(rx).await;

        assert!(events.iter().any(|e| matches!(e, GenEvent::ToolCall { name, .. } if name == "add")));
        assert!(events.iter().any(|e| matches!(e, GenEvent::ToolResult { result, .. } if result == "5")));
        assert!(matches!(events.last(), Some(GenEvent::Done)));

        let messages = store.list_messages(&chat.chat_id).await.unwrap();
        assert!(messages.iter().any(|m| m.role == Role::Tool && m.body == "5"));
        assert!(messages.iter().any(|m| m.role == Role::Assistant && m.body == "the answer is 5"));
    }

    #[tokio::test]
    async fn manual_tool_call_markup_is_parsed_and_dispatched() {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let chat = store.create_chat(None).await.unwrap();
        let user_id = store
            .create_message(&chat.chat_id, CreateMessageArgs { body: "echo hi".into(), ..Default::default() })
            .await
            .unwrap();

        let provider = FakeStreamingProvider::new(vec![
            vec![
                NormalizedEvent::ContentDelta(r#"sure<tool_call name="echo" id="c1">{"text":"hi"}</tool_call>"#.into()),
                NormalizedEvent::Finish { reason: FinishReason::Stop, tool_calls: Vec::new() },
            ],
            vec![
                NormalizedEvent::ContentDelta("done".into()),
                NormalizedEvent::Finish { reason: FinishReason::Stop, tool_calls: Vec::new() },
            ],
        ]);

        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools);
        let pipeline = test_pipeline(Arc::new(provider), store.clone(), tools);

        let rx = pipeline.start(chat.chat_id.clone(), request(user_id, -1)).await.unwrap();
        let events = drain(rx).await;

        assert!(events.iter().any(|e| matches!(e, GenEvent::ToolStart { name, .. } if name == "echo")));
        assert!(events.iter().any(|e| matches!(e, GenEvent::ToolResult { result, .. } if result == "hi")));

        let messages = store.list_messages(&chat.chat_id).await.unwrap();
        let assistant = messages.iter().find(|m| m.role == Role::Assistant && m.tool_calls.is_some()).unwrap();
        assert_eq!(assistant.body, "sure");
    }

    #[tokio::test]
    async fn cancellation_mid_stream_persists_partial_content_and_skips_done() {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let chat = store.create_chat(None).await.unwrap();
        let user_id = store
            .create_message(&chat.chat_id, CreateMessageArgs { body: "hi".into(), ..Default::default() })
            .await
            .unwrap();

        // No `Finish`/`Done`: the fake chains `pending()` after this one
        // delta, so the stream stays open exactly like a real connection
        // that hasn't finished yet, until the cancellation below interrupts it.
        let provider = FakeStreamingProvider::new(vec![vec![NormalizedEvent::ContentDelta("partial".into())]]);
        let pipeline = test_pipeline(Arc::new(provider), store.clone(), ToolRegistry::new());

        let chat_id = chat.chat_id.clone();
        let mut rx = pipeline.start(chat_id.clone(), request(user_id, -1)).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, GenEvent::Chunk { data } if data == "partial"));

        pipeline.registry.signal_abort(&chat_id).await;

        let events = drain(rx).await;
        assert!(!events.iter().any(|e| matches!(e, GenEvent::Done)));

        let messages = store.list_messages(&chat_id).await.unwrap();
        let assistant = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
        assert_eq!(assistant.body, "partial");
    }

    #[tokio::test]
    async fn max_tool_calls_budget_stops_loop_without_further_llm_call() {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let chat = store.create_chat(None).await.unwrap();
        let user_id = store
            .create_message(&chat.chat_id, CreateMessageArgs { body: "add repeatedly".into(), ..Default::default() })
            .await
            .unwrap();

        // Only one script is provided; if the budget check let the loop make
        // a second LLM call, the fake provider would return an error instead
        // of hanging, so a regression fails the test rather than the suite.
        let provider = FakeStreamingProvider::new(vec![vec![NormalizedEvent::Finish {
            reason: FinishReason::ToolCalls,
            tool_calls: vec![AccumulatedToolCall { id: "call_1".into(), name: "add".into(), arguments: r#"{"a":1,"b":1}"#.into() }],
        }]]);

        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools);
        let pipeline = test_pipeline(Arc::new(provider), store.clone(), tools);

        let rx = pipeline.start(chat.chat_id.clone(), request(user_id, 1)).await.unwrap();
        let events = drain(rx).await;

        assert!(events.iter().any(|e| matches!(e, GenEvent::ToolResult { .. })));
        assert!(matches!(events.last(), Some(GenEvent::Done)));

        let messages = store.list_messages(&chat.chat_id).await.unwrap();
        assert_eq!(messages.iter().filter(|m| m.role == Role::Assistant).count(), 1);
    }

    #[test]
    fn delim_scanner_opens_and_closes_default_think_tag_across_fragments() {
        let mut thinking_open = false;
        let mut scanner = DelimScanner::new("<think>".into(), "</think>".into());
        let mut out = scanner.feed("hello <thi", &mut thinking_open);
        out.extend(scanner.feed("nk>pondering</th", &mut thinking_open));
        out.extend(scanner.feed("ink>world", &mut thinking_open));

        let mut content = String::new();
        let mut thinking = String::new();
        for o in out {
            match o {
                DelimOutput::Content(s) => content.push_str(&s),
                DelimOutput::ThinkingChunk(s) => thinking.push_str(&s),
                _ => {}
            }
        }
        assert_eq!(content, "hello world");
        assert_eq!(thinking, "pondering");
    }

    #[test]
    fn gen_event_serializes_with_snake_case_type_tag() {
        let json = serde_json::to_string(&GenEvent::ThinkingStart).unwrap();
        assert_eq!(json, r#"{"type":"thinking_start"}"#);
        let json = serde_json::to_string(&GenEvent::Chunk { data: "hi".into() }).unwrap();
        assert_eq!(json, r#"{"type":"chunk","data":"hi"}"#);
    }
}
