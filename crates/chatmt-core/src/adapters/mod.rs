//! The Provider Adapter Layer: translates a neutral message sequence into a
//! provider-specific request and normalizes the streaming response into a
//! single event vocabulary the Generation Pipeline understands.

mod google;
mod openai;

pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::context::NeutralEntry;
use crate::error::CoreResult;
use crate::tools::ToolDefinition;

#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other => "other",
        }
    }
}

/// One fully- or partially-reassembled native tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    ContentDelta(String),
    ThinkingDelta(String),
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: Option<String>,
    },
    /// Emitted once the provider signals the turn is over. `tool_calls` is
    /// populated (and non-empty) exactly when `reason == ToolCalls`.
    Finish {
        reason: FinishReason,
        tool_calls: Vec<AccumulatedToolCall>,
    },
    Error(String),
    Done,
}

/// Static connection details for one provider instance. Resolved by the
/// service's configuration layer, never read from the process environment
/// inside an adapter.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_identifier: String,
}

/// One LLM call's worth of generation parameters (temperature, max_tokens,
/// ...), passed through to the provider body largely verbatim.
pub type GenerationArgs = serde_json::Map<String, Value>;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Opens a streaming request against the provider and returns a stream
    /// of normalized events. The stream ends after a `Done` or `Error`
    /// event (or is simply exhausted if the provider connection dropped
    /// without a terminator — see the Generation Pipeline's handling of
    /// that case).
    async fn stream_chat(
        &self,
        config: &ProviderConfig,
        history: &[NeutralEntry],
        tools: &[ToolDefinition],
        gen_args: &GenerationArgs,
    ) -> CoreResult<BoxStream<'static, NormalizedEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_as_str_matches_wire_vocabulary() {
        assert_eq!(FinishReason::ToolCalls.as_str(), "tool_calls");
        assert_eq!(FinishReason::ContentFilter.as_str(), "content_filter");
    }
}
