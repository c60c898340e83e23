//! The Tool Registry & Executor.
//!
//! A `ToolDefinition` describes a flat, JSON-schema-ish parameter set;
//! `to_openai_function_schema` projects it into the OpenAI `tools[]` wire
//! shape, where every parameter is required unless marked `optional`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub param_type: String,
    pub description: String,
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<(String, ParamSpec)>,
}

impl ToolDefinition {
    /// Projects this definition into the OpenAI `tools[].function` schema
    /// shape: every parameter is listed under `properties`, and any
    /// parameter not marked `optional` is added to `required`.
    pub fn to_openai_function_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.parameters {
            properties.insert(
                name.clone(),
                json!({ "type": spec.param_type, "description": spec.description }),
            );
            if !spec.optional {
                required.push(Value::String(name.clone()));
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

/// Result of running one tool call: `output` is what gets stored as the
/// tool message body, `is_error` marks it as a tool-side failure (still
/// fed back to the model, never raised as a `CoreError`).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { output: output.into(), is_error: false }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self { output: output.into(), is_error: true }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ToolOutcome> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Handler,
}

/// Holds every known tool's definition and handler. Handlers registered via
/// `register_blocking` run on the blocking pool so a slow synchronous tool
/// (e.g. shelling out) never stalls the async executor.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<RegisteredTool>>,
}

/// Matches `[IMAGE:base64:<payload>]`-style inline image markers inside a
/// tool result and swaps them for a short textual placeholder before the
/// result is persisted or handed back to a provider that cannot ingest it
/// out of band.
fn image_marker_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[IMAGE:base64:[A-Za-z0-9+/=]+\]").expect("valid regex"))
}

pub fn sanitize_tool_result(raw: &str) -> String {
    image_marker_pattern().replace_all(raw, "[image]").to_string()
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, definition: ToolDefinition, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutcome> + Send + 'static,
    {
        let name = definition.name.clone();
        let handler: Handler = Arc::new(move |args| Box::pin(handler(args)));
        self.tools.insert(name, Arc::new(RegisteredTool { definition, handler }));
    }

    /// Registers a synchronous handler, dispatched onto `spawn_blocking` so
    /// it never blocks the executor running the generation pipeline.
    pub fn register_blocking<F>(&mut self, definition: ToolDefinition, handler: F)
    where
        F: Fn(Value) -> ToolOutcome + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(definition, move |args| {
            let handler = handler.clone();
            async move {
                match tokio::task::spawn_blocking(move || handler(args)).await {
                    Ok(outcome) => outcome,
                    Err(e) => ToolOutcome::error(format!("tool panicked: {e}")),
                }
            }
        });
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|t| &t.definition)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    /// Runs `subset` (or everything registered, if `subset` is `None`)
    /// filtered down to the enabled-tool-names allowlist.
    pub fn definitions_enabled(&self, enabled_tool_names: Option<&[String]>) -> Vec<ToolDefinition> {
        match enabled_tool_names {
            None => self.definitions(),
            Some(names) => self
                .tools
                .values()
                .filter(|t| names.iter().any(|n| n == &t.definition.name))
                .map(|t| t.definition.clone())
                .collect(),
        }
    }

    /// Executes `name` with `arguments`. Returns `CoreError::tool_error` if
    /// the tool is unknown or not in `enabled_tool_names` (when given);
    /// a known, enabled tool's own runtime failure is reported as an `Ok`
    /// `ToolOutcome { is_error: true, .. }` instead, since that failure
    /// still needs to flow back into the model's context, not abort the
    /// pipeline.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Value,
        enabled_tool_names: Option<&[String]>,
    ) -> CoreResult<ToolOutcome> {
        if let Some(names) = enabled_tool_names {
            if !names.iter().any(|n| n == name) {
                return Err(CoreError::tool_error(format!("tool '{name}' is not enabled for this chat")));
            }
        }
        let Some(tool) = self.tools.get(name) else {
            return Err(CoreError::tool_error(format!("unknown tool '{name}'")));
        };
        let outcome = (tool.handler)(arguments).await;
        Ok(ToolOutcome { output: sanitize_tool_result(&outcome.output), is_error: outcome.is_error })
    }
}

/// Registers the two example tools named in the generation pipeline's
/// ambient toolset: `add`, a trivial two-number sum, and `echo`, which
/// returns its input verbatim. Both exist to exercise the tool-call
/// round trip end to end, not as production functionality.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register_blocking(
        ToolDefinition {
            name: "add".into(),
            description: "Add two numbers together".into(),
            parameters: vec![
                ("a".into(), ParamSpec { param_type: "number".into(), description: "first addend".into(), optional: false }),
                ("b".into(), ParamSpec { param_type: "number".into(), description: "second addend".into(), optional: false }),
            ],
        },
        |args| {
            let a = args.get("a").and_then(Value::as_f64);
            let b = args.get("b").and_then(Value::as_f64);
            match (a, b) {
                (Some(a), Some(b)) => ToolOutcome::ok((a + b).to_string()),
                _ => ToolOutcome::error("both 'a' and 'b' must be numbers"),
            }
        },
    );

    registry.register_blocking(
        ToolDefinition {
            name: "echo".into(),
            description: "Echo the given text back unchanged".into(),
            parameters: vec![(
                "text".into(),
                ParamSpec { param_type: "string".into(), description: "text to echo".into(), optional: false },
            )],
        },
        |args| match args.get("text").and_then(Value::as_str) {
            Some(text) => ToolOutcome::ok(text.to_string()),
            None => ToolOutcome::error("'text' must be a string"),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_def() -> ToolDefinition {
        ToolDefinition {
            name: "add".into(),
            description: "adds".into(),
            parameters: vec![
                ("a".into(), ParamSpec { param_type: "number".into(), description: "x".into(), optional: false }),
                ("note".into(), ParamSpec { param_type: "string".into(), description: "y".into(), optional: true }),
            ],
        }
    }

    #[test]
    fn openai_schema_marks_only_non_optional_params_required() {
        let schema = sample_def().to_openai_function_schema();
        let required = schema["function"]["parameters"]["required"].as_array().unwrap();
        assert_eq!(required, &vec![json!("a")]);
    }

    #[test]
    fn sanitize_tool_result_replaces_image_markers() {
        let raw = "here: [IMAGE:base64:QUJD] done";
        assert_eq!(sanitize_tool_result(raw), "here: [image] done");
    }

    #[tokio::test]
    async fn builtin_add_tool_sums_arguments() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);
        let outcome = registry.execute("add", json!({"a": 2, "b": 3}), None).await.unwrap();
        assert_eq!(outcome.output, "5");
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", json!({}), None).await.unwrap_err();
        assert_eq!(err.kind, CoreError::tool_error("x").kind);
    }

    #[tokio::test]
    async fn disabled_tool_is_rejected_even_if_registered() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);
        let enabled = vec!["echo".to_string()];
        let err = registry.execute("add", json!({"a":1,"b":1}), Some(&enabled)).await.unwrap_err();
        assert_eq!(err.kind, CoreError::tool_error("x").kind);
    }
}
