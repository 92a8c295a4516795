use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::info;
use url::Url;

mod artifacts;

use crate::config::AppConfig;
use crate::jobs::{JobError, JobId, JobStore, SweeperHandle};
use crate::operations;
use crate::preview::{preview_path_segments, PreviewRenderer};
use crate::tools::{ToolError, Tools};

const FORWARDED_PROTO: &str = "x-forwarded-proto";
const FALLBACK_HOST: &str = "localhost";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    store: JobStore,
    tools: Tools,
    renderer: PreviewRenderer,
}

impl AppState {
    pub fn new(config: AppConfig, work_dir: PathBuf, tools: Tools) -> Self {
        let store = JobStore::new(
            work_dir,
            config.jobs.retention(),
            config.jobs.sweep_interval(),
        );
        let renderer = PreviewRenderer::new(tools.clone(), config.preview.dpi);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                tools,
                renderer,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn tools(&self) -> &Tools {
        &self.inner.tools
    }

    pub fn renderer(&self) -> &PreviewRenderer {
        &self.inner.renderer
    }

    /// Starts the retention sweeper. Swept jobs also leave the preview lock map.
    pub fn start_sweeper(&self) -> SweeperHandle {
        let renderer = self.inner.renderer.clone();
        self.inner
            .store
            .start_sweeper(move |report| renderer.forget_jobs(&report.removed))
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub download_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewPage {
    pub page_number: u32,
    pub image_url: String,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub pages: Vec<PreviewPage>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .nest("/pdf", operations::router())
        .nest("/api/pdf", operations::router())
        .route("/downloads/{*path}", get(artifacts::download))
        .route("/previews/{*path}", get(artifacts::preview))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Per-request data handlers need besides the form: the externally visible
/// base URL and the query string.
#[derive(Debug, Clone)]
pub struct RequestContext {
    base_url: String,
    query: HashMap<String, String>,
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let base_url = match state.config().server.public_base_url() {
            Some(configured) => configured.to_string(),
            None => infer_base_url(parts),
        };

        let mut query = HashMap::new();
        if let Some(raw) = parts.uri.query() {
            for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
            }
        }

        Ok(Self { base_url, query })
    }
}

fn infer_base_url(parts: &Parts) -> String {
    let https = parts
        .headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"));
    let scheme = if https { "https" } else { "http" };

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_else(|| FALLBACK_HOST.to_string());

    format!("{scheme}://{host}")
}

impl RequestContext {
    #[cfg(test)]
    pub(crate) fn for_base(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            query: HashMap::new(),
        }
    }

    /// Trimmed query parameter; blank counts as absent.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn download_url(&self, job: JobId, file_name: &str) -> Result<String, AppError> {
        self.url_for(&["downloads", &job.to_string(), file_name])
    }

    pub fn preview_url(&self, job: JobId, page: u32) -> Result<String, AppError> {
        let [job, dir, file] = preview_path_segments(job, page);
        self.url_for(&["previews", &job, &dir, &file])
    }

    /// Appends percent-encoded segments to the base URL.
    fn url_for(&self, segments: &[&str]) -> Result<String, AppError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AppError::Internal(format!("invalid base URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| AppError::Internal(format!("base URL cannot carry a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.into())
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    MethodNotAllowed(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::MethodNotAllowed(msg) => (StatusCode::METHOD_NOT_ALLOWED, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ToolError> for AppError {
    fn from(err: ToolError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Builds the state used by the binary: system tools and the configured work root.
pub fn app_state_with_config(config: AppConfig, data_dir: PathBuf) -> AppState {
    let work_dir = config.work_dir(&data_dir);
    let tools = Tools::system(config.tools.search_dirs.clone());
    info!(work_dir = %work_dir.display(), "job work directory");
    AppState::new(config, work_dir, tools)
}
