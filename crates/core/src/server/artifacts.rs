//! Download and preview serving.

use std::path::{Component, Path as StdPath, PathBuf};

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use super::{AppError, AppState};
use crate::jobs::JobId;
use crate::preview::{parse_page_file_name, PREVIEW_DIR};
use crate::upload::sanitize_filename;

/// A request path split into its job and the job-relative file.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ArtifactPath {
    pub job: JobId,
    pub relative: PathBuf,
}

impl ArtifactPath {
    /// Rejects traversal with 403 before anything else; a path that cannot
    /// name a job artifact is a 404.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut segments = Vec::new();
        for component in StdPath::new(raw).components() {
            match component {
                Component::Normal(segment) => segments.push(segment),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(forbidden());
                }
            }
        }

        let mut segments = segments.into_iter();
        let job = segments
            .next()
            .and_then(|segment| segment.to_str())
            .and_then(JobId::parse)
            .ok_or_else(not_found)?;
        let relative: PathBuf = segments.collect();
        if relative.as_os_str().is_empty() {
            return Err(not_found());
        }
        Ok(Self { job, relative })
    }

    /// True for files below the job's `previews/` directory, the only ones
    /// served inline.
    pub fn in_preview_dir(&self) -> bool {
        let mut components = self.relative.components();
        matches!(components.next(), Some(Component::Normal(dir)) if dir == PREVIEW_DIR)
            && components.next().is_some()
    }

    /// Page number when the path is exactly `previews/page-<n>.png`.
    pub fn preview_page(&self) -> Option<u32> {
        let mut components = self.relative.components();
        match (components.next(), components.next(), components.next()) {
            (Some(Component::Normal(dir)), Some(Component::Normal(file)), None)
                if dir == PREVIEW_DIR =>
            {
                file.to_str().and_then(parse_page_file_name)
            }
            _ => None,
        }
    }

    fn file_name(&self) -> String {
        let name = self
            .relative
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        sanitize_filename(&name).replace('"', "_")
    }
}

fn forbidden() -> AppError {
    AppError::Forbidden("forbidden".to_string())
}

fn not_found() -> AppError {
    AppError::NotFound("file not found".to_string())
}

pub(super) async fn download(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let artifact = ArtifactPath::parse(&path)?;
    let lease = state.store().lease(artifact.job).ok_or_else(not_found)?;
    let file = lease.join(&artifact.relative);
    if !file.is_file() {
        return Err(not_found());
    }

    let mut response = serve(file, request).await;
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name());
    let value = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
    Ok(response)
}

pub(super) async fn preview(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let artifact = ArtifactPath::parse(&path)?;
    if !artifact.in_preview_dir() {
        return Err(not_found());
    }
    let lease = state.store().lease(artifact.job).ok_or_else(not_found)?;
    let mut file = lease.join(&artifact.relative);

    if !file.is_file() {
        let page = artifact.preview_page().ok_or_else(not_found)?;
        debug!(job = %artifact.job, page, "rendering preview on demand");
        file = state
            .renderer()
            .ensure_page(&lease, page)
            .await
            .map_err(|error| {
                warn!(job = %artifact.job, page, error = %error, "preview render failed");
                AppError::Internal("failed to render preview".to_string())
            })?;
        if !file.is_file() {
            return Err(not_found());
        }
    }

    Ok(serve(file, request).await)
}

async fn serve(file: PathBuf, request: Request) -> Response {
    match ServeFile::new(file).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}
