//! HTTP API for the study frontend.
//!
//! Thin axum handlers over [`StudyService`]. Text-producing endpoints
//! stream the generated fragments as the response body (`text/plain`), so
//! a client that disconnects drops the body stream and the generation is
//! abandoned at the next fragment. Cached and fallback replies are sent the
//! same way as a single fragment.
//!
//! # Endpoints
//!
//! | Method | Path                              | Body                             |
//! |--------|-----------------------------------|----------------------------------|
//! | GET    | `/health`                         |                                  |
//! | GET    | `/projects`                       |                                  |
//! | POST   | `/projects`                       | `{name}`                         |
//! | POST   | `/projects/{name}/upload`         | multipart, field `file`          |
//! | POST   | `/projects/{name}/documents`      | `{path}`                         |
//! | POST   | `/projects/{name}/load`           |                                  |
//! | POST   | `/chat`                           | `{query}`                        |
//! | POST   | `/chat/contextual`                | `{selected_text, question}`      |
//! | GET    | `/projects/{name}/topics`         |                                  |
//! | POST   | `/projects/{name}/summary`        |                                  |
//! | POST   | `/projects/{name}/notes`          | `{topic}`                        |
//! | POST   | `/projects/{name}/flashcards`     | `{count?, topic?}`               |
//! | POST   | `/projects/{name}/quiz`           | `{count?, fmt?, topic?}`         |
//! | GET    | `/projects/{name}/results`        |                                  |
//! | POST   | `/projects/{name}/results`        | quiz result                      |
//! | GET    | `/projects/{name}/mastery`        |                                  |
//! | GET    | `/projects/{name}/images`         |                                  |
//! | POST   | `/projects/{name}/images`         | `{query, image_base64}`          |
//! | GET    | `/projects/{name}/cache`          |                                  |
//!
//! Errors use the body `{"error": {"code": "...", "message": "..."}}`.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::error::StudyError;
use crate::generation::TextStream;
use crate::models::QuizResult;
use crate::prompts::QuizFormat;
use crate::quiz::QuizReply;
use crate::study::StudyService;

const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    service: Arc<StudyService>,
}

/// Build the router over a started service.
pub fn router(service: Arc<StudyService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/projects", get(handle_list_projects).post(handle_create_project))
        .route(
            "/projects/{name}/upload",
            post(handle_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/projects/{name}/documents", post(handle_register_document))
        .route("/projects/{name}/load", post(handle_load_project))
        .route("/chat", post(handle_chat))
        .route("/chat/contextual", post(handle_contextual_chat))
        .route("/projects/{name}/topics", get(handle_topics))
        .route("/projects/{name}/summary", post(handle_summary))
        .route("/projects/{name}/notes", post(handle_notes))
        .route("/projects/{name}/flashcards", post(handle_flashcards))
        .route("/projects/{name}/quiz", post(handle_quiz))
        .route(
            "/projects/{name}/results",
            get(handle_results).post(handle_submit_result),
        )
        .route("/projects/{name}/mastery", get(handle_mastery))
        .route(
            "/projects/{name}/images",
            get(handle_images).post(handle_save_image),
        )
        .route("/projects/{name}/cache", get(handle_cache))
        .layer(cors)
        .with_state(AppState { service })
}

/// Serve on the configured bind address until Ctrl-C, then shut the
/// service down.
pub async fn run_server(service: Arc<StudyService>) -> anyhow::Result<()> {
    let bind_addr = service.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "letslearn server listening");
    println!("letslearn server listening on http://{}", bind_addr);

    axum::serve(listener, router(Arc::clone(&service)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    service.shutdown();
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StudyError> for AppError {
    fn from(err: StudyError) -> Self {
        let status = match &err {
            StudyError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            StudyError::ProjectExists(_) => StatusCode::CONFLICT,
            StudyError::ResourceBusy => StatusCode::SERVICE_UNAVAILABLE,
            StudyError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StudyError::Unparseable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StudyError::Other(e) => {
                error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn text_response(stream: TextStream) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream.into_stream()),
    )
        .into_response()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    generation_backend: String,
    generation_busy: bool,
    active_project: Option<String>,
    chunks: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let service = &state.service;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        generation_backend: service.gate().backend_name().to_string(),
        generation_busy: service.gate().is_busy(),
        active_project: service.active_project(),
        chunks: service.index().count(),
    })
}

// ============ Projects ============

async fn handle_list_projects(State(state): State<AppState>) -> Result<Response, AppError> {
    let projects = state.service.list_projects()?;
    Ok(Json(serde_json::json!({ "projects": projects })).into_response())
}

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
}

async fn handle_create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Response, AppError> {
    let name = state.service.create_project(&req.name)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": format!("Project '{}' created.", name),
            "project": name,
        })),
    )
        .into_response())
}

async fn handle_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("file field has no file name"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
        let report = state.service.upload_document(&name, &filename, &bytes).await?;
        return Ok(Json(report).into_response());
    }
    Err(bad_request("multipart body has no 'file' field"))
}

#[derive(Deserialize)]
struct RegisterDocumentRequest {
    path: PathBuf,
}

async fn handle_register_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RegisterDocumentRequest>,
) -> Result<Response, AppError> {
    let report = state.service.register_document(&name, &req.path).await?;
    Ok(Json(report).into_response())
}

async fn handle_load_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let report = state.service.load_project(&name).await?;
    Ok(Json(report).into_response())
}

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequest {
    query: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    Ok(text_response(state.service.ask(&req.query).await?))
}

#[derive(Deserialize)]
struct ContextualChatRequest {
    selected_text: String,
    question: String,
}

async fn handle_contextual_chat(
    State(state): State<AppState>,
    Json(req): Json<ContextualChatRequest>,
) -> Result<Response, AppError> {
    let stream = state
        .service
        .ask_about_selection(&req.selected_text, &req.question)
        .await?;
    Ok(text_response(stream))
}

// ============ Generated study material ============

async fn handle_topics(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    Ok(text_response(state.service.topics(&name).await?))
}

async fn handle_summary(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    Ok(text_response(state.service.summary(&name).await?))
}

#[derive(Deserialize)]
struct NotesRequest {
    topic: String,
}

async fn handle_notes(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<NotesRequest>,
) -> Result<Response, AppError> {
    Ok(text_response(state.service.notes(&name, &req.topic).await?))
}

fn default_count() -> usize {
    5
}

fn default_topic() -> String {
    "all".to_string()
}

fn default_fmt() -> String {
    "json".to_string()
}

#[derive(Deserialize)]
struct FlashcardRequest {
    #[serde(default = "default_count")]
    count: usize,
    #[serde(default = "default_topic")]
    topic: String,
}

async fn handle_flashcards(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<FlashcardRequest>,
) -> Result<Response, AppError> {
    let stream = state
        .service
        .flashcards(&name, &req.topic, req.count)
        .await?;
    Ok(text_response(stream))
}

#[derive(Deserialize)]
struct QuizRequest {
    #[serde(default = "default_count")]
    count: usize,
    #[serde(default = "default_fmt")]
    fmt: String,
    #[serde(default = "default_topic")]
    topic: String,
}

async fn handle_quiz(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<QuizRequest>,
) -> Result<Response, AppError> {
    let format = QuizFormat::parse(&req.fmt)
        .ok_or_else(|| bad_request(format!("unknown quiz format '{}'", req.fmt)))?;
    match state
        .service
        .quiz(&name, &req.topic, req.count, format)
        .await?
    {
        QuizReply::Questions(questions) => Ok(Json(questions).into_response()),
        QuizReply::Text(stream) => Ok(text_response(stream)),
    }
}

// ============ Results and mastery ============

async fn handle_submit_result(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(result): Json<QuizResult>,
) -> Result<Response, AppError> {
    let mastery = state.service.submit_result(&name, result)?;
    Ok(Json(serde_json::json!({ "mastery": mastery })).into_response())
}

async fn handle_results(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let results = state.service.results(&name)?;
    Ok(Json(serde_json::json!({ "results": results })).into_response())
}

async fn handle_mastery(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let mastery = state.service.mastery(&name)?;
    Ok(Json(serde_json::json!({ "mastery": mastery })).into_response())
}

// ============ Images and cache ============

async fn handle_images(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let images = state.service.images(&name)?;
    Ok(Json(serde_json::json!({ "images": images })).into_response())
}

#[derive(Deserialize)]
struct SaveImageRequest {
    query: String,
    image_base64: String,
}

async fn handle_save_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SaveImageRequest>,
) -> Result<Response, AppError> {
    let record = state
        .service
        .save_image(&name, &req.query, &req.image_base64)?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn handle_cache(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    Ok(Json(state.service.cached_keys(&name)?).into_response())
}
