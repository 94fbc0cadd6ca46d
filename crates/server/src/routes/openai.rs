//! OpenAI-compatible API routes:
//!   GET    /v1/models
//!   GET    /v1/models/{model}
//!   DELETE /v1/models/{model}
//!   POST   /v1/chat/completions

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use llama_runtime::{
    ChatMessage, ChatTemplate, GenerateEvent, GenerateRequest, SamplingParams, apply_template,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};

use crate::error::ApiError;
use crate::services::model_manager::{ResidentInfo, UnloadTarget};
use crate::services::registry::{ModelDescriptor, model_key};
use crate::services::session::{GenerationSession, SessionError, TokenStream};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(list_models))
        .route(
            "/v1/models/{model}",
            get(retrieve_model).delete(delete_model),
        )
        .route("/v1/chat/completions", post(chat_completions))
}

//  Shared types

#[derive(Serialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

//  /v1/models

#[derive(Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
    loaded: bool,
    busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

impl ModelObject {
    fn new(id: String, resident: Option<&ResidentInfo>, size: Option<u64>) -> Self {
        Self {
            id,
            object: "model",
            created: 0,
            owned_by: "local",
            loaded: resident.is_some(),
            busy: resident.is_some_and(|r| r.busy),
            size,
        }
    }

    fn from_descriptor(d: &ModelDescriptor, resident: Option<&ResidentInfo>) -> Self {
        Self::new(d.name.clone(), resident, Some(d.file_size))
    }
}

#[derive(Serialize)]
struct ModelsListResponse {
    object: &'static str,
    data: Vec<ModelObject>,
}

fn resident_by_key(state: &AppState) -> HashMap<String, ResidentInfo> {
    state
        .model_manager()
        .list_resident()
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect()
}

/// GET /v1/models: discovered models plus any still-resident ones a reload dropped.
async fn list_models(State(state): State<AppState>) -> Json<ModelsListResponse> {
    let mut resident = resident_by_key(&state);

    let mut data: Vec<ModelObject> = state
        .registry()
        .descriptors()
        .iter()
        .map(|d| ModelObject::from_descriptor(d, resident.remove(&d.key).as_ref()))
        .collect();

    let mut orphans: Vec<ResidentInfo> = resident.into_values().collect();
    orphans.sort_by(|a, b| a.id.cmp(&b.id));
    data.extend(
        orphans
            .into_iter()
            .map(|r| ModelObject::new(r.name.clone(), Some(&r), None)),
    );

    Json(ModelsListResponse {
        object: "list",
        data,
    })
}

/// GET /v1/models/{model}
async fn retrieve_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<ModelObject>, ApiError> {
    let mut resident = resident_by_key(&state);
    let key = model_key(&model_id);
    let info = resident.remove(&key);

    if let Some(d) = state.registry().resolve(&key) {
        return Ok(Json(ModelObject::from_descriptor(&d, info.as_ref())));
    }
    match info {
        Some(r) => Ok(Json(ModelObject::new(r.name.clone(), Some(&r), None))),
        None => Err(ApiError::NotFound(format!(
            "The model '{model_id}' does not exist"
        ))),
    }
}

#[derive(Serialize)]
struct DeleteResponse {
    id: String,
    object: &'static str,
    deleted: bool,
}

/// DELETE /v1/models/{model}: unload. Unloading a model that is not loaded succeeds with
/// `deleted: false`.
async fn delete_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let summary = state
        .model_manager()
        .explicit_unload(UnloadTarget::Model(model_id.clone()))
        .await?;
    Ok(Json(DeleteResponse {
        id: model_id,
        object: "model",
        deleted: !summary.unloaded.is_empty(),
    }))
}

//  /v1/chat/completions

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<ChatMessageReq>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    max_completion_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    top_k: Option<i32>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    stop: Option<StopSequence>,
    #[serde(default)]
    frequency_penalty: Option<f32>,
    #[serde(default)]
    presence_penalty: Option<f32>,
    #[serde(default)]
    seed: Option<u32>,
}

/// OpenAI `stop` can be a string or an array of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

impl StopSequence {
    fn into_vec(self) -> Vec<String> {
        match self {
            StopSequence::Single(s) => vec![s],
            StopSequence::Multiple(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessageReq {
    role: String,
    #[serde(default)]
    content: Option<ChatContent>,
}

/// Content can be a string or array of content parts (text/image_url).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ChatContent {
    fn as_text(&self) -> String {
        match self {
            ChatContent::Text(s) => s.clone(),
            ChatContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.r#type == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

// Chat completion response

#[derive(Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChatChoice>,
    usage: Usage,
}

#[derive(Serialize)]
struct ChatChoice {
    index: u32,
    message: ChatMessageResp,
    finish_reason: Option<&'static str>,
}

#[derive(Serialize)]
struct ChatMessageResp {
    role: &'static str,
    content: Option<String>,
}

// Streaming chunk

#[derive(Serialize)]
struct ChatCompletionChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChatChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

#[derive(Serialize)]
struct ChatChunkChoice {
    index: u32,
    delta: ChatDelta,
    finish_reason: Option<&'static str>,
}

#[derive(Serialize, Default)]
struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

/// Identity shared by every chunk of one streamed completion.
struct ChunkMeta {
    id: String,
    created: i64,
    model: String,
}

impl ChunkMeta {
    fn chunk(
        &self,
        delta: ChatDelta,
        finish_reason: Option<&'static str>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

/// POST /v1/chat/completions: chat completion (stream + non-stream).
async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }
    let stream = req.stream.unwrap_or(false);

    // Loads on demand; the lease is released when the session ends.
    let lease = state.model_manager().acquire(req.model.as_deref()).await?;
    let model_name = lease.name().to_string();

    let messages: Vec<ChatMessage> = req
        .messages
        .iter()
        .map(|m| {
            ChatMessage::new(
                m.role.clone(),
                m.content.as_ref().map(ChatContent::as_text).unwrap_or_default(),
            )
        })
        .collect();
    let prompt = apply_template(ChatTemplate::detect(&model_name), &messages, true);

    let defaults = SamplingParams::default();
    let gen_req = GenerateRequest {
        prompt,
        max_tokens: req.max_completion_tokens.or(req.max_tokens).unwrap_or(2048),
        stop_words: req.stop.map(StopSequence::into_vec).unwrap_or_default(),
        sampling: SamplingParams {
            temperature: req.temperature.unwrap_or(defaults.temperature),
            top_p: req.top_p.unwrap_or(defaults.top_p),
            top_k: req.top_k.unwrap_or(defaults.top_k),
            seed: req.seed,
            frequency_penalty: req.frequency_penalty.unwrap_or(defaults.frequency_penalty),
            presence_penalty: req.presence_penalty.unwrap_or(defaults.presence_penalty),
        },
    };

    let meta = ChunkMeta {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        created: chrono::Utc::now().timestamp(),
        model: model_name,
    };
    let tokens = GenerationSession::start(lease, gen_req);

    if stream {
        Ok(chat_stream(tokens, meta).into_response())
    } else {
        Ok(chat_non_stream(tokens, meta).await?.into_response())
    }
}

fn chat_stream(
    tokens: TokenStream,
    meta: ChunkMeta,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut sent_role = false;

    let events = tokens
        .map(move |event| {
            let payload = match event {
                GenerateEvent::Token(piece) => {
                    let role = (!sent_role).then_some("assistant");
                    sent_role = true;
                    let delta = ChatDelta {
                        role,
                        content: Some(piece),
                    };
                    serde_json::to_string(&meta.chunk(delta, None, None))
                }
                GenerateEvent::Done {
                    finish_reason,
                    prompt_tokens,
                    completion_tokens,
                } => {
                    let usage = Usage {
                        prompt_tokens,
                        completion_tokens,
                        total_tokens: prompt_tokens + completion_tokens,
                    };
                    let chunk = meta.chunk(
                        ChatDelta::default(),
                        Some(finish_reason.as_openai()),
                        Some(usage),
                    );
                    serde_json::to_string(&chunk)
                }
                GenerateEvent::Error(e) => {
                    let err = ApiError::from(SessionError::Generation(e));
                    serde_json::to_string(&err.body())
                }
            };
            Event::default().data(payload.unwrap_or_default())
        })
        .chain(tokio_stream::once(Event::default().data("[DONE]")))
        .map(Ok::<_, Infallible>);

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn chat_non_stream(
    tokens: TokenStream,
    meta: ChunkMeta,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    let completion = tokens.into_completion().await?;

    Ok(Json(ChatCompletionResponse {
        id: meta.id,
        object: "chat.completion",
        created: meta.created,
        model: meta.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessageResp {
                role: "assistant",
                content: Some(completion.text),
            },
            finish_reason: Some(completion.finish_reason.as_openai()),
        }],
        usage: Usage {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            total_tokens: completion.prompt_tokens + completion.completion_tokens,
        },
    }))
}
