use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, OriginalUri, Path, State, multipart::MultipartRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::{error, info, warn};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::client::{self, ClientError};
use crate::config::{Collaborator, ProcessingMode, RelayConfig, RetrievalMode};
use crate::correlation::CorrelationId;
use crate::downloader::{file_response, first_existing};
use crate::envelope::{ENVELOPE_VERSION, Envelope};
use crate::error::RelayError;
use crate::processor::Processor;
use crate::store::{JobState, RelayStore, SavedUpload};
use crate::template::{self, TemplateError};
use crate::upload::{UploadError, UploadedFile};

const NOT_PROCESSED: &str = "Processed file not found. Please try uploading again.";
const TEMPLATE_MISSING: &str = "Template file not found";

pub struct AppState {
    pub config: RelayConfig,
    pub store: RelayStore,
    processor: Option<Processor>,
    http: reqwest::Client,
}

impl AppState {
    /// Build the shared state and create the upload directory
    pub fn new(config: RelayConfig) -> std::io::Result<Self> {
        let store = RelayStore::new(
            config.upload_dir.clone(),
            config.retrieval,
            config.output_name.clone(),
        );
        store.ensure_root()?;

        let processor = match &config.collaborator {
            Collaborator::Command(command) => Some(Processor::new(
                command.clone(),
                config.workers,
                config.process_timeout,
                config.template_candidates.clone(),
            )),
            Collaborator::Http { .. } => None,
        };

        Ok(AppState {
            config,
            store,
            processor,
            http: reqwest::Client::new(),
        })
    }
}

/// The relay endpoints, without state or layers
pub fn relay_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/upload", post(upload))
        .route("/download/:id", get(download))
        .route("/clear-template", post(clear_template))
        .route("/health", get(health))
        .route("/template", get(download_template))
}

/// Full application: relay routes at the root and under `/api/<tool>`
pub fn build_router(state: Arc<AppState>) -> Router {
    let nested = format!("/api/{}", state.config.tool.slug);
    let mut router = Router::new()
        .merge(relay_routes())
        .nest(&nested, relay_routes())
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes));

    if let Some(origin) = &state.config.allowed_origin {
        match cors_layer(origin) {
            Some(cors) => router = router.layer(cors),
            None => warn!("Ignoring invalid allowed origin {:?}", origin),
        }
    }

    router.with_state(state)
}

fn cors_layer(origin: &str) -> Option<CorsLayer> {
    let origin = HeaderValue::from_str(origin).ok()?;
    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE])
            .expose_headers([header::CONTENT_DISPOSITION]),
    )
}

pub async fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.listen_addr()?;
    let state = Arc::new(AppState::new(config)?);
    log_startup(&state);

    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn log_startup(state: &AppState) {
    let config = &state.config;
    info!("Serving {} ({})", config.tool.name, config.tool.slug);
    info!("Upload folder: {}", config.upload_dir.display());
    info!(
        "Retrieval: {}, processing: {}",
        config.retrieval.as_str(),
        config.processing.as_str()
    );
    match &config.collaborator {
        Collaborator::Command(command) => {
            info!("Processor: {} {}", command.program, command.args.join(" "));
            if !program_available(&command.program) {
                warn!("{} was not found; uploads will fail until it is installed", command.program);
            }
        }
        Collaborator::Http { url, field_name } => {
            info!("Forwarding uploads to {} (field {:?})", url, field_name)
        }
    }
    match first_existing(&config.template_candidates) {
        Some(path) => info!("Fallback template: {}", path.display()),
        None if config.template_candidates.is_empty() => {}
        None => warn!("No fallback template found in {:?}", config.template_candidates),
    }
    if config.retrieval == RetrievalMode::Shared {
        warn!("Shared retrieval: every download returns the same output file");
    }
}

/// Whether `program` is a path that exists or a name found on `PATH`
fn program_available(program: &str) -> bool {
    let path = std::path::Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Pull the single file out of the form
///
/// Accepts the field `file` or the tool's own field name; other fields are
/// skipped.
async fn read_upload(multipart: &mut Multipart, field_name: &str) -> Result<UploadedFile, RelayError> {
    while let Some(field) = multipart.next_field().await? {
        let matches = matches!(field.name(), Some(name) if name == "file" || name == field_name);
        if !matches {
            continue;
        }
        let Some(original_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;

        let mut file = UploadedFile::new(original_name, bytes.to_vec());
        if let Some(content_type) = content_type {
            file = file.with_content_type(content_type);
        }
        return Ok(file);
    }
    Err(UploadError::Missing.into())
}

/// `/download/<id>` next to wherever `/upload` was mounted
fn download_url_for(upload_path: &str, id: &CorrelationId) -> String {
    let base = upload_path.strip_suffix("upload").unwrap_or(upload_path);
    format!("{}/download/{}", base.trim_end_matches('/'), id)
}

async fn upload(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, RelayError> {
    let mut multipart = multipart?;
    let file = read_upload(&mut multipart, state.config.tool.field_name).await?;
    file.validate(&state.config.allowed_extensions)?;
    info!("Received {} ({} bytes)", file.original_name, file.bytes.len());

    if let Collaborator::Http { url, field_name } = &state.config.collaborator {
        return relay_to_backend(&state, url, field_name, &file).await;
    }

    let saved = state.store.save_upload(&file).await?;
    let download_url = download_url_for(uri.path(), &saved.id);

    match state.config.processing {
        ProcessingMode::Blocking => {
            process(&state, &saved).await?;
            Ok(Json(Envelope::completed(&saved.id, &saved.original_name, download_url)).into_response())
        }
        ProcessingMode::Deferred => {
            state.store.set_state(&saved.id, JobState::Pending);
            let envelope = Envelope::pending(&saved.id, Some(&saved.original_name), download_url);
            let job_state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = process(&job_state, &saved).await {
                    warn!("Deferred job {} failed: {}", saved.id, e);
                }
            });
            Ok((StatusCode::ACCEPTED, Json(envelope)).into_response())
        }
    }
}

/// Run the processor for one saved upload and record the result
async fn process(state: &AppState, saved: &SavedUpload) -> Result<(), RelayError> {
    let processor = state
        .processor
        .as_ref()
        .ok_or_else(|| RelayError::Internal("No processor configured".to_string()))?;

    state.store.set_state(&saved.id, JobState::Running);
    match processor.run(&saved.path, &saved.work_dir).await {
        Ok(output) => {
            info!("Processed {} in {:?}", saved.id, output.elapsed);
            state.store.set_state(&saved.id, JobState::Completed);
            Ok(())
        }
        Err(e) => {
            if let Err(io) = state.store.discard_output(&saved.id).await {
                warn!("Could not discard output of {}: {}", saved.id, io);
            }
            state.store.set_state(&saved.id, JobState::Failed(e.to_string()));
            Err(RelayError::Processing(e.to_string()))
        }
    }
}

/// Forward the upload to the backend and hand its answer back unchanged
async fn relay_to_backend(
    state: &AppState,
    url: &str,
    field_name: &str,
    file: &UploadedFile,
) -> Result<Response, RelayError> {
    let response = client::forward(&state.http, url, field_name, file)
        .await
        .map_err(|e| match e {
            ClientError::Transport { .. } => RelayError::Unreachable(e.to_string()),
            other => RelayError::Internal(other.to_string()),
        })?;

    let status = response.status();
    if status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Processing(format!("{} answered {}: {}", url, status, body.trim())));
    }

    let mut builder = Response::builder().status(status);
    for name in [header::CONTENT_TYPE, header::CONTENT_DISPOSITION] {
        if let Some(value) = response.headers().get(&name) {
            builder = builder.header(name, value.clone());
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| RelayError::Unreachable(format!("{} broke off its answer: {}", url, e)))?;
    info!("Relayed {} bytes from {} ({})", body.len(), url, status);

    builder
        .body(Body::from(body))
        .map_err(|e| RelayError::Internal(e.to_string()))
}

async fn download(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Path(raw_id): Path<String>,
) -> Result<Response, RelayError> {
    let id = CorrelationId::parse(&raw_id)?;
    let job = state.store.state(&id);

    match &job {
        Some(JobState::Pending | JobState::Running) => {
            let envelope = Envelope::pending(&id, None, uri.path().to_string());
            return Ok((StatusCode::ACCEPTED, Json(envelope)).into_response());
        }
        Some(JobState::Failed(detail)) => {
            error!("Download of failed job {}: {}", id, detail);
            let envelope = Envelope::failed(&id, "Failed to process file with backend");
            return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response());
        }
        Some(JobState::Completed) | None => {}
    }

    let upload = state.store.find_upload(&id).await?;
    match state.store.mode() {
        RetrievalMode::Isolated => {
            if upload.is_none() && job.is_none() {
                return Err(RelayError::NotFound("File not found".to_string()));
            }
        }
        RetrievalMode::Shared => match &upload {
            Some(path) => info!("Download {} matches upload {}", id, path.display()),
            None => info!("Download {} matches no upload", id),
        },
    }

    let name = &state.config.output_name;
    let output = state.store.output_path(&id);
    if output.is_file() {
        info!("Serving {} for {}", output.display(), id);
        return Ok(file_response(&output, name).await?);
    }
    if let Some(template) = first_existing(&state.config.template_candidates) {
        warn!("No output for {}; serving template {}", id, template.display());
        return Ok(file_response(template, name).await?);
    }
    Err(RelayError::NotFound(NOT_PROCESSED.to_string()))
}

async fn download_template(State(state): State<Arc<AppState>>) -> Result<Response, RelayError> {
    let tool = state.config.tool;
    let name = tool
        .template_download
        .map(|(_, name)| name)
        .or(tool.template_file)
        .unwrap_or(state.config.output_name.as_str());

    match first_existing(&state.config.template_candidates) {
        Some(path) => Ok(file_response(path, name).await?),
        None => Err(RelayError::NotFound(TEMPLATE_MISSING.to_string())),
    }
}

async fn clear_template(State(state): State<Arc<AppState>>) -> Result<Json<Envelope>, RelayError> {
    if let Some(path) = state.config.working_template.clone() {
        let headers = state.config.template_headers.clone();
        let result = tokio::task::spawn_blocking(move || template::reset_to_headers(&path, &headers))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        match result {
            Ok(()) => {}
            Err(TemplateError::Missing(path)) => {
                warn!("Working template {} does not exist", path.display());
                return Err(RelayError::NotFound(TEMPLATE_MISSING.to_string()));
            }
            Err(e) => {
                error!("Could not clear template: {}", e);
                return Err(RelayError::Internal("Failed to clear template".to_string()));
            }
        }
    }

    state.store.clear().await?;
    Ok(Json(Envelope::ok("Template cleared successfully")))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    let template: Option<PathBuf> = config
        .working_template
        .clone()
        .or_else(|| first_existing(&config.template_candidates).cloned())
        .or_else(|| config.template_candidates.first().cloned());
    let meta = match &template {
        Some(path) => tokio::fs::metadata(path).await.ok().filter(|m| m.is_file()),
        None => None,
    };

    let processor_configured = match &config.collaborator {
        Collaborator::Command(command) => program_available(&command.program),
        Collaborator::Http { .. } => true,
    };

    Json(json!({
        "status": "healthy",
        "version": ENVELOPE_VERSION,
        "tool": config.tool.slug,
        "template": {
            "exists": meta.is_some(),
            "path": template.map(|p| p.display().to_string()),
            "size": meta.map(|m| m.len()),
        },
        "uploadFolderExists": state.store.root().is_dir(),
        "processorConfigured": processor_configured,
        "retrieval": config.retrieval.as_str(),
        "processing": config.processing.as_str(),
        "workers": state.processor.as_ref().map(|p| p.workers()),
        "availableWorkers": state.processor.as_ref().map(|p| p.available_workers()),
        "jobs": state.store.job_counts(),
    }))
}
