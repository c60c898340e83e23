use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatmt_core::adapters::GenerationArgs;
use chatmt_core::error::{CoreError, ErrorKind};
use chatmt_core::model::{CharacterId, Character, ChatId, EmbeddedModelBinding, MessageId};
use chatmt_core::models::ModelCatalog;
use chatmt_core::pipeline::{AdapterSet, GenEvent, GenerateRequest, Pipeline};
use chatmt_core::registry::GenerationRegistry;
use chatmt_core::store::{CreateMessageArgs, EditMessageArgs, MessageStore, SqliteStore};
use chatmt_core::tools::{self, ToolRegistry};
use clap::Parser;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Path to the sqlite database file (created if missing)
    #[arg(long, default_value = "chatmt.sqlite3")]
    database: PathBuf,
    /// Path to a TOML file describing the static model catalog
    #[arg(long)]
    models: Option<PathBuf>,
}

#[derive(Clone)]
struct ServerState {
    store: Arc<dyn MessageStore>,
    pipeline: Pipeline,
    tools: Arc<ToolRegistry>,
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::ToolError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal => {
                error!(error = %self.0.message, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR { "internal error".to_string() } else { self.0.message };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatmt_service=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    info!(addr = %args.addr, database = %args.database.display(), "starting chatmt-service");

    let database_url = format!("sqlite://{}", args.database.display());
    let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::connect(&database_url).await.context("failed to open sqlite store")?);

    let catalog = match &args.models {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<ModelCatalog>(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => {
            warn!("no --models file given; only character-embedded and local-runtime models will resolve");
            ModelCatalog::default()
        }
    };

    let mut tool_registry = ToolRegistry::new();
    tools::register_builtin_tools(&mut tool_registry);
    let tool_registry = Arc::new(tool_registry);

    let pipeline = Pipeline {
        store: store.clone(),
        registry: GenerationRegistry::new(),
        tools: tool_registry.clone(),
        catalog: Arc::new(catalog),
        adapters: Arc::new(AdapterSet::default()),
    };

    let state = ServerState { store, pipeline, tools: tool_registry };

    let app = Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/tools", get(handle_list_tools))
        .route("/chats", post(handle_create_chat).get(handle_list_chats))
        .route("/chats/:chat_id", get(handle_get_chat).delete(handle_delete_chat))
        .route("/c/:chat_id/generate", post(handle_generate))
        .route("/c/:chat_id/abort_generation", post(handle_abort))
        .route("/c/:chat_id/add_message", post(handle_add_message))
        .route("/c/:chat_id/delete_message/:message_id", post(handle_delete_message))
        .route("/c/:chat_id/edit_message/:message_id", post(handle_edit_message))
        .route("/c/:chat_id/set_active_branch/:parent_id", post(handle_set_active_branch))
        .route("/characters", post(handle_create_character).get(handle_list_characters))
        .route("/characters/:character_id", get(handle_get_character).delete(handle_delete_character))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn handle_list_tools(State(state): State<ServerState>) -> impl IntoResponse {
    let defs: Vec<Value> = state.tools.definitions().iter().map(|d| d.to_openai_function_schema()).collect();
    Json(json!({ "tools": defs }))
}

#[derive(Deserialize, Default)]
struct CreateChatRequest {
    #[serde(default)]
    character_id: Option<CharacterId>,
}

async fn handle_create_chat(State(state): State<ServerState>, Json(req): Json<CreateChatRequest>) -> ApiResult<impl IntoResponse> {
    let chat = state.store.create_chat(req.character_id).await?;
    Ok(Json(chat))
}

async fn handle_list_chats(State(state): State<ServerState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_chats().await?))
}

async fn handle_get_chat(State(state): State<ServerState>, Path(chat_id): Path<ChatId>) -> ApiResult<impl IntoResponse> {
    let chat = state.store.get_chat(&chat_id).await?.ok_or_else(|| CoreError::not_found(format!("chat {chat_id} not found")))?;
    let messages = state.store.list_messages(&chat_id).await?;
    Ok(Json(json!({
        "chat_id": chat.chat_id,
        "timestamp_created": chat.timestamp_created,
        "timestamp_updated": chat.timestamp_updated,
        "character_id": chat.character_id,
        "messages": messages,
    })))
}

async fn handle_delete_chat(State(state): State<ServerState>, Path(chat_id): Path<ChatId>) -> ApiResult<impl IntoResponse> {
    state.store.delete_chat(&chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CreateCharacterRequest {
    character_name: String,
    #[serde(default)]
    sysprompt: String,
    #[serde(default)]
    model: EmbeddedModelBinding,
    #[serde(default)]
    cot_start_tag: Option<String>,
    #[serde(default)]
    cot_end_tag: Option<String>,
    #[serde(default)]
    settings: Value,
}

async fn handle_create_character(State(state): State<ServerState>, Json(req): Json<CreateCharacterRequest>) -> ApiResult<impl IntoResponse> {
    let character = Character {
        character_id: CharacterId::new(),
        character_name: req.character_name,
        sysprompt: req.sysprompt,
        model: req.model,
        cot_start_tag: req.cot_start_tag,
        cot_end_tag: req.cot_end_tag,
        settings: req.settings,
    };
    Ok(Json(state.store.create_character(character).await?))
}

async fn handle_list_characters(State(state): State<ServerState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_characters().await?))
}

async fn handle_get_character(State(state): State<ServerState>, Path(character_id): Path<CharacterId>) -> ApiResult<impl IntoResponse> {
    let character = state
        .store
        .get_character(&character_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("character {character_id} not found")))?;
    Ok(Json(character))
}

async fn handle_delete_character(State(state): State<ServerState>, Path(character_id): Path<CharacterId>) -> ApiResult<impl IntoResponse> {
    state.store.delete_character(&character_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct GenerateHttpRequest {
    parent_message_id: MessageId,
    model_name: String,
    #[serde(default)]
    generation_args: Option<GenerationArgs>,
    #[serde(default)]
    tools_enabled: bool,
    #[serde(default)]
    enabled_tool_names: Option<Vec<String>>,
    #[serde(default)]
    character_id: Option<CharacterId>,
    #[serde(default)]
    cot_start_tag: Option<String>,
    #[serde(default)]
    cot_end_tag: Option<String>,
    #[serde(default)]
    preserve_thinking: bool,
    #[serde(default = "default_max_tool_calls")]
    max_tool_calls: i64,
    #[serde(default)]
    resolve_local_runtime_model: bool,
}

fn default_max_tool_calls() -> i64 {
    -1
}

async fn handle_generate(State(state): State<ServerState>, Path(chat_id): Path<ChatId>, Json(req): Json<GenerateHttpRequest>) -> ApiResult<Response> {
    let request = GenerateRequest {
        parent_message_id: req.parent_message_id,
        model_name: req.model_name,
        generation_args: req.generation_args.unwrap_or_default(),
        tools_enabled: req.tools_enabled,
        enabled_tool_names: req.enabled_tool_names,
        character_id: req.character_id,
        cot_start_tag: req.cot_start_tag,
        cot_end_tag: req.cot_end_tag,
        preserve_thinking: req.preserve_thinking,
        max_tool_calls: req.max_tool_calls,
        resolve_local_runtime_model: req.resolve_local_runtime_model,
    };

    let rx = state.pipeline.start(chat_id, request).await?;
    let event_stream = ReceiverStream::new(rx).map(|ev: GenEvent| Ok::<_, Infallible>(Event::default().data(serde_json::to_string(&ev).unwrap())));

    Ok(Sse::new(event_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive")).into_response())
}

async fn handle_abort(State(state): State<ServerState>, Path(chat_id): Path<ChatId>) -> impl IntoResponse {
    state.pipeline.registry.signal_abort(&chat_id).await;
    Json(json!({ "status": "ok", "message": "abort requested" }))
}

#[derive(Deserialize)]
struct AddMessageHttpRequest {
    #[serde(default)]
    role: Option<chatmt_core::model::Role>,
    body: String,
    #[serde(default)]
    parent_message_id: Option<MessageId>,
    #[serde(default)]
    model_name: Option<String>,
}

async fn handle_add_message(
    State(state): State<ServerState>,
    Path(chat_id): Path<ChatId>,
    Json(req): Json<AddMessageHttpRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state
        .store
        .create_message(
            &chat_id,
            CreateMessageArgs { role: req.role, body: req.body, parent_message_id: req.parent_message_id, model_name: req.model_name, ..Default::default() },
        )
        .await?;
    Ok(Json(json!({ "message_id": id })))
}

async fn handle_delete_message(State(state): State<ServerState>, Path((chat_id, message_id)): Path<(ChatId, MessageId)>) -> ApiResult<impl IntoResponse> {
    state.store.delete_message(&chat_id, &message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct EditMessageHttpRequest {
    body: String,
    #[serde(default)]
    model_name: Option<String>,
}

async fn handle_edit_message(
    State(state): State<ServerState>,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
    Json(req): Json<EditMessageHttpRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .store
        .edit_message(&chat_id, &message_id, EditMessageArgs { body: req.body, model_name: req.model_name, ..Default::default() })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SetActiveBranchRequest {
    child_index: i64,
}

async fn handle_set_active_branch(
    State(state): State<ServerState>,
    Path((_chat_id, parent_id)): Path<(ChatId, MessageId)>,
    Json(req): Json<SetActiveBranchRequest>,
) -> ApiResult<impl IntoResponse> {
    state.store.set_active_branch(&parent_id, req.child_index).await?;
    Ok(StatusCode::NO_CONTENT)
}
