//! HTTP API for the pipeline stages and chat.
//!
//! Every stage has its own JSON endpoint. Errors are returned as
//! `{ "error": … }` with the status from [`TubechatError::status_code`].

use crate::channel::{Channel, ResolveRequest};
use crate::chat::{ChatRequest, ChatService};
use crate::embedding::{IndexReport, IndexTarget};
use crate::error::{Result, TubechatError};
use crate::orchestrator::Orchestrator;
use crate::rag::AnswerEvent;
use crate::transcript::ExtractionReport;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Shared application state.
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    chat: ChatService,
    ingest_wait: Duration,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let chat = orchestrator.chat_service();
        let ingest_wait = Duration::from_secs(orchestrator.settings().limits.ingest_wait_secs);
        Self {
            orchestrator,
            chat,
            ingest_wait,
        }
    }

    /// Override how long `/resolve-channel` waits for ingestion.
    pub fn with_ingest_wait(mut self, wait: Duration) -> Self {
        self.ingest_wait = wait;
        self
    }
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/resolve-channel", post(resolve_channel))
        .route("/extract-transcripts", post(extract_transcripts))
        .route("/process-embeddings", post(process_embeddings))
        .route("/chat", post(chat))
        .route("/channels/{channel_id}/status", get(channel_status))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(orchestrator: Arc<Orchestrator>, host: &str, port: u16) -> Result<()> {
    let app = router(Arc::new(AppState::new(orchestrator)));
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// === Request/Response Types ===

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct ResolveResponse {
    success: bool,
    channel: Channel,
    new_videos_count: usize,
    up_to_date: bool,
    queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    handoff_error: Option<String>,
}

#[derive(Serialize)]
struct TimeoutResponse {
    error: String,
    channel_id: String,
}

#[derive(Deserialize)]
struct ExtractRequest {
    #[serde(alias = "channel_id", rename = "channelId")]
    channel_id: String,
}

#[derive(Serialize)]
struct ExtractResponse {
    success: bool,
    #[serde(flatten)]
    report: ExtractionReport,
}

#[derive(Deserialize)]
struct ProcessEmbeddingsRequest {
    #[serde(default, alias = "channelId")]
    channel_id: Option<String>,
    #[serde(default, alias = "transcriptIds")]
    transcript_ids: Option<Vec<String>>,
    /// Index every pending transcript of `channel_id`, ignoring `transcript_ids`.
    /// A bare `channel_id` without transcript ids implies it.
    #[serde(default, alias = "processAll")]
    process_all: bool,
}

impl ProcessEmbeddingsRequest {
    fn target(self) -> Result<IndexTarget> {
        let channel_id = self
            .channel_id
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        if self.process_all {
            return channel_id.map(IndexTarget::Channel).ok_or_else(|| {
                TubechatError::InvalidInput("process_all requires channel_id".to_string())
            });
        }

        match self.transcript_ids {
            Some(ids) if !ids.is_empty() => Ok(IndexTarget::Transcripts(ids)),
            _ => channel_id.map(IndexTarget::Channel).ok_or_else(|| {
                TubechatError::InvalidInput("channel_id or transcript_ids is required".to_string())
            }),
        }
    }
}

#[derive(Serialize)]
struct ProcessEmbeddingsResponse {
    success: bool,
    results: IndexReport,
}

// === Handlers ===

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn resolve_channel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResolveRequest>,
) -> Response {
    let (profile, mut handle) = match state.orchestrator.start_ingest(req).await {
        Ok(started) => started,
        Err(e) => return error_response("resolve", &e),
    };

    match tokio::time::timeout(state.ingest_wait, &mut handle).await {
        Ok(Ok(Ok(report))) => Json(ResolveResponse {
            success: true,
            channel: report.channel,
            new_videos_count: report.resolve.new_videos_count,
            up_to_date: report.resolve.up_to_date,
            queued: report.resolve.queued,
            handoff_error: report.resolve.handoff_error,
        })
        .into_response(),
        Ok(Ok(Err(e))) => error_response("resolve", &e),
        Ok(Err(join_error)) => {
            error!(service = "http", stage = "resolve", channel_id = %profile.channel_id, error = %join_error, "Ingestion task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Internal server error".to_string(),
                }),
            )
                .into_response()
        }
        Err(_) => {
            warn!(
                service = "http",
                stage = "resolve",
                channel_id = %profile.channel_id,
                "Ingestion still running after {:?}; returning timeout",
                state.ingest_wait
            );
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(TimeoutResponse {
                    error: "Ingestion is still running; poll the channel status".to_string(),
                    channel_id: profile.channel_id,
                }),
            )
                .into_response()
        }
    }
}

async fn extract_transcripts(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExtractRequest>,
) -> Response {
    match state.orchestrator.extract(req.channel_id.trim()).await {
        Ok(report) => Json(ExtractResponse {
            success: true,
            report,
        })
        .into_response(),
        Err(e) => error_response("extract", &e),
    }
}

async fn process_embeddings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessEmbeddingsRequest>,
) -> Response {
    let target = match req.target() {
        Ok(target) => target,
        Err(e) => return error_response("embed", &e),
    };
    match state.orchestrator.index(&target).await {
        Ok(results) => Json(ProcessEmbeddingsResponse {
            success: true,
            results,
        })
        .into_response(),
        Err(e) => error_response("embed", &e),
    }
}

async fn chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Response {
    if !req.stream {
        return match state.chat.respond(&req).await {
            Ok(answer) => Json(answer).into_response(),
            Err(e) => error_response("chat", &e),
        };
    }

    let events = match state.chat.respond_stream(&req).await {
        Ok(events) => events,
        Err(e) => return error_response("chat", &e),
    };

    let sse_events = events
        .map(|event| Ok::<_, Infallible>(sse_event(event)))
        .chain(stream::once(async {
            Ok(Event::default().event("done").data("[DONE]"))
        }));

    Sse::new(sse_events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn channel_status(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Response {
    match state.orchestrator.status(&channel_id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response("status", &e),
    }
}

fn sse_event(event: AnswerEvent) -> Event {
    match event {
        AnswerEvent::Delta(text) => Event::default().event("delta").data(text),
        AnswerEvent::Final(answer) => match Event::default().event("final").json_data(&answer) {
            Ok(event) => event,
            Err(e) => {
                error!(service = "http", stage = "chat", error = %e, "Failed to encode final answer");
                Event::default()
                    .event("error")
                    .data("Internal server error")
            }
        },
    }
}

fn error_response(stage: &str, err: &TubechatError) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        error!(service = "http", stage, status = status.as_u16(), error = %err, "Request failed");
    } else {
        warn!(service = "http", stage, status = status.as_u16(), error = %err, "Request rejected");
    }

    let mut response = (
        status,
        Json(ErrorResponse {
            error: err.public_message(),
        }),
    )
        .into_response();

    if let TubechatError::RateLimited { retry_after_secs } = err {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}
