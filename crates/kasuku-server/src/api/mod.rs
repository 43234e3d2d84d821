//! HTTP API endpoints
//!
//! Model listing and status are plain JSON; model loading and chat stream
//! their progress as SSE events so clients can render them incrementally.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use kasuku_core::engine::DEFAULT_MAX_FRAGMENTS;
use kasuku_core::{
    catalog, device, sanitize::sanitize, ClassifiedError, ContextEstimate, GenerationOutcome,
    LifecycleState, Message, ModelDescriptor,
};

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/status", get(status))
        .route("/v1/models/:id/load", post(load_model))
        .route("/v1/chat", post(chat))
        .route("/v1/chat/cancel", post(cancel))
        .route("/v1/transcript/clear", post(clear_transcript))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    /// Device memory in GB; probed locally when absent.
    memory_gb: Option<f64>,
    #[serde(default)]
    mobile: bool,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<&'static ModelDescriptor>,
}

async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Json<ModelsResponse> {
    let memory_gb = query
        .memory_gb
        .or(state.lifecycle.config().detected_memory_gb)
        .or_else(device::detect_memory_gb);

    let models = match memory_gb {
        Some(memory_gb) => catalog::filter_for_device(memory_gb, query.mobile),
        // No memory figure at all: list everything rather than guess.
        None => catalog::registry().iter().collect(),
    };
    Json(ModelsResponse { models })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    lifecycle: LifecycleState,
    context: ContextEstimate,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        lifecycle: state.lifecycle.state().await,
        context: state.pipeline.context(),
    })
}

enum LoadUpdate {
    Progress { percent: u8, status: String },
    Ready { model_id: &'static str },
    Failed(ClassifiedError),
}

async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let descriptor = catalog::by_id(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown model: {id}")))?;

    info!(model = descriptor.id, "Load requested");

    let (tx, rx) = mpsc::unbounded_channel();
    let lifecycle = state.lifecycle.clone();
    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let result = lifecycle
            .load_model(descriptor, move |percent, status| {
                let _ = progress_tx.send(LoadUpdate::Progress {
                    percent,
                    status: status.to_string(),
                });
            })
            .await;
        let last = match result {
            Ok(()) => LoadUpdate::Ready {
                model_id: descriptor.id,
            },
            Err(err) => LoadUpdate::Failed(err),
        };
        let _ = tx.send(last);
    });

    let stream = UnboundedReceiverStream::new(rx).map(|update| match update {
        LoadUpdate::Progress { percent, status } => Event::default()
            .event("progress")
            .json_data(json!({ "percent": percent, "status": status })),
        LoadUpdate::Ready { model_id } => Event::default()
            .event("ready")
            .json_data(json!({ "model_id": model_id })),
        LoadUpdate::Failed(err) => Event::default().event("error").json_data(&err),
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    system: Option<String>,
}

enum ChatUpdate {
    Fragment(String),
    Complete {
        text: String,
        context: ContextEstimate,
    },
    Cancelled {
        fragments_delivered: usize,
    },
    Failed(ClassifiedError),
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    if !state.lifecycle.is_ready().await {
        return Err(ClassifiedError::not_ready().into());
    }
    let content = sanitize(&request.message);
    if content.is_empty() {
        return Err(ApiError::bad_request("message is empty"));
    }

    // The user turn is committed before generation starts; a cancelled or
    // failed response leaves it in place.
    let snapshot = {
        let mut transcript = state.transcript.lock().await;
        transcript.push(Message::user(content));
        transcript.clone()
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipeline = state.pipeline.clone();
    let shared = state.transcript.clone();
    tokio::spawn(async move {
        let fragment_tx = tx.clone();
        let result = pipeline
            .generate(
                &snapshot,
                request.system.as_deref(),
                move |fragment| {
                    let _ = fragment_tx.send(ChatUpdate::Fragment(fragment.to_string()));
                },
                DEFAULT_MAX_FRAGMENTS,
            )
            .await;
        let last = match result {
            Ok(GenerationOutcome::Complete(text)) => {
                shared.lock().await.push(Message::assistant(text.clone()));
                ChatUpdate::Complete {
                    text,
                    context: pipeline.context(),
                }
            }
            Ok(GenerationOutcome::Cancelled {
                fragments_delivered,
            }) => ChatUpdate::Cancelled {
                fragments_delivered,
            },
            Err(err) => ChatUpdate::Failed(err),
        };
        let _ = tx.send(last);
    });

    let stream = async_stream::stream! {
        while let Some(update) = rx.recv().await {
            yield match update {
                ChatUpdate::Fragment(text) => Event::default()
                    .event("fragment")
                    .json_data(json!({ "text": text })),
                ChatUpdate::Complete { text, context } => Event::default()
                    .event("done")
                    .json_data(json!({ "text": text, "context": context })),
                ChatUpdate::Cancelled { fragments_delivered } => Event::default()
                    .event("cancelled")
                    .json_data(json!({ "fragments_delivered": fragments_delivered })),
                ChatUpdate::Failed(err) => Event::default().event("error").json_data(&err),
            };
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn cancel(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.pipeline.cancel();
    Json(json!({ "cancelled": true }))
}

async fn clear_transcript(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.transcript.lock().await.clear();
    state.pipeline.reset_context();
    info!("Transcript cleared");
    Json(json!({ "cleared": true }))
}
