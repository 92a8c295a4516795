//! Document operation handlers.
//!
//! Every operation is a `POST` taking a multipart form. Handlers validate the
//! form first, then allocate a job, write the uploads into it, run the external
//! tools and answer with a download URL for the produced artifact.

use std::fmt;
use std::path::{Path, PathBuf};

use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::routing::{post, MethodRouter};
use axum::{Json, Router};
use tracing::{info, warn};

use crate::archive::zip_directory_nonempty;
use crate::jobs::JobLease;
use crate::server::{AppError, AppState, DownloadResponse, RequestContext};
use crate::tools::{expect_output, Invocation, ToolOutput, Tools};
use crate::upload::{materialize, sanitize_filename, FilePart};

mod convert;
mod export;
mod inspect;
mod pages;
mod preview;
mod security;
mod stamp;

pub const DEFAULT_BODY_LIMIT: usize = 64 << 20;
pub const OFFICE_BODY_LIMIT: usize = 128 << 20;
pub const COMPARE_BODY_LIMIT: usize = 100 << 20;
pub const IMAGE_BATCH_BODY_LIMIT: usize = 256 << 20;

pub(crate) const INPUT_PDF: &str = "input.pdf";
pub(crate) const OUTPUT_PDF: &str = "output.pdf";
pub(crate) const PAGES_DIR: &str = "pages";

pub(crate) type OpResult = Result<Json<DownloadResponse>, AppError>;

/// Operation routes, mounted under both `/pdf` and `/api/pdf`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/merge", op(pages::merge, DEFAULT_BODY_LIMIT))
        .route("/split", op(pages::split, DEFAULT_BODY_LIMIT))
        .route("/remove-pages", op(pages::remove_pages, DEFAULT_BODY_LIMIT))
        .route("/extract-pages", op(pages::extract_pages, DEFAULT_BODY_LIMIT))
        .route("/organize", op(pages::organize, DEFAULT_BODY_LIMIT))
        .route("/rotate", op(pages::rotate, DEFAULT_BODY_LIMIT))
        .route("/crop", op(pages::crop, DEFAULT_BODY_LIMIT))
        .route("/scan-to-pdf", op(convert::scan_to_pdf, IMAGE_BATCH_BODY_LIMIT))
        .route("/image-to-pdf", op(convert::image_to_pdf, IMAGE_BATCH_BODY_LIMIT))
        .route("/compress", op(convert::compress, DEFAULT_BODY_LIMIT))
        .route("/repair", op(convert::repair, DEFAULT_BODY_LIMIT))
        .route("/ocr", op(convert::ocr, DEFAULT_BODY_LIMIT))
        .route("/convert-to-pdfa", op(convert::convert_to_pdfa, DEFAULT_BODY_LIMIT))
        .route("/word-to-pdf", op(convert::word_to_pdf, OFFICE_BODY_LIMIT))
        .route("/excel-to-pdf", op(convert::excel_to_pdf, DEFAULT_BODY_LIMIT))
        .route("/powerpoint-to-pdf", op(convert::powerpoint_to_pdf, OFFICE_BODY_LIMIT))
        .route("/html-to-pdf", op(convert::html_to_pdf, DEFAULT_BODY_LIMIT))
        .route("/page-numbers", op(stamp::page_numbers, DEFAULT_BODY_LIMIT))
        .route("/watermark", op(stamp::watermark, DEFAULT_BODY_LIMIT))
        .route("/add-header-footer", op(stamp::header_footer, DEFAULT_BODY_LIMIT))
        .route("/protect", op(security::protect, DEFAULT_BODY_LIMIT))
        .route("/unlock", op(security::unlock, DEFAULT_BODY_LIMIT))
        .route("/redact", op(security::redact, DEFAULT_BODY_LIMIT))
        .route("/flatten", op(security::flatten, DEFAULT_BODY_LIMIT))
        .route("/digital-signature", op(security::digital_signature, DEFAULT_BODY_LIMIT))
        .route("/pdf-to-word", op(export::pdf_to_word, DEFAULT_BODY_LIMIT))
        .route("/pdf-to-excel", op(export::pdf_to_excel, DEFAULT_BODY_LIMIT))
        .route("/pdf-to-powerpoint", op(export::pdf_to_powerpoint, DEFAULT_BODY_LIMIT))
        .route("/pdf-to-jpg", op(export::pdf_to_jpg, DEFAULT_BODY_LIMIT))
        .route("/pdf-to-html", op(export::pdf_to_html, DEFAULT_BODY_LIMIT))
        .route("/extract-text", op(export::extract_text, DEFAULT_BODY_LIMIT))
        .route("/extract-images", op(export::extract_images, DEFAULT_BODY_LIMIT))
        .route("/compare", op(inspect::compare, COMPARE_BODY_LIMIT))
        .route("/validate-pdfa", op(inspect::validate_pdfa, DEFAULT_BODY_LIMIT))
        .route("/preview", op(preview::preview, DEFAULT_BODY_LIMIT))
}

fn op<H, T>(handler: H, body_limit: usize) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    post(handler)
        .fallback(method_not_allowed)
        .layer(DefaultBodyLimit::max(body_limit))
}

async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed("method not allowed".to_string())
}

/// An operation in progress: its log tag and the job it writes into.
pub(crate) struct Operation {
    name: &'static str,
    tools: Tools,
    job: JobLease,
}

impl Operation {
    pub async fn start(name: &'static str, state: &AppState) -> Result<Self, AppError> {
        let job = state
            .store()
            .allocate()
            .await
            .map_err(|error| internal(name, None, "failed to create job", error))?;
        info!(operation = name, job = %job.id(), "operation started");
        Ok(Self {
            name,
            tools: state.tools().clone(),
            job,
        })
    }

    /// Starts the operation and writes `part` as `dest_name`.
    pub async fn with_input(
        name: &'static str,
        state: &AppState,
        part: &FilePart,
        dest_name: &str,
    ) -> Result<Self, AppError> {
        let operation = Self::start(name, state).await?;
        operation.save(part, dest_name).await?;
        Ok(operation)
    }

    pub fn job(&self) -> &JobLease {
        &self.job
    }

    pub fn dir(&self) -> &Path {
        self.job.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.job.join(name)
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    pub async fn save(&self, part: &FilePart, dest_name: &str) -> Result<(), AppError> {
        materialize(self.dir(), part, dest_name)
            .await
            .map(|_| ())
            .map_err(self.fail("failed to save file"))
    }

    pub async fn create_dir(&self, name: &str) -> Result<(), AppError> {
        tokio::fs::create_dir_all(self.path(name))
            .await
            .map_err(self.fail("failed to create working directory"))
    }

    pub async fn run(
        &self,
        invocation: Invocation,
        context: &'static str,
    ) -> Result<ToolOutput, AppError> {
        self.tools
            .run(self.dir(), invocation)
            .await
            .map_err(self.fail(context))
    }

    /// Zips `source_dir` into `archive_name`; an empty directory is an error.
    pub async fn zip(&self, source_dir: &str, archive_name: &str) -> Result<(), AppError> {
        zip_directory_nonempty(self.path(source_dir), self.path(archive_name))
            .await
            .map(|_| ())
            .map_err(|error| self.fail("failed to create archive")(format!("{error:#}")))
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), AppError> {
        if from == to {
            return Ok(());
        }
        tokio::fs::rename(self.path(from), self.path(to))
            .await
            .map_err(self.fail("failed to rename output"))
    }

    /// Sorted names of the regular files directly inside `dir_name`.
    pub async fn list(&self, dir_name: &str) -> Result<Vec<String>, AppError> {
        let mut entries = tokio::fs::read_dir(self.path(dir_name))
            .await
            .map_err(self.fail("failed to list outputs"))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(self.fail("failed to list outputs"))?
        {
            let is_file = entry
                .file_type()
                .await
                .map_err(self.fail("failed to list outputs"))?
                .is_file();
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<(), AppError> {
        tokio::fs::write(self.path(name), contents)
            .await
            .map_err(self.fail("failed to write output"))
    }

    /// Maps a failure to a 500 `"<context>: <error>"` and logs it with the operation tag.
    pub fn fail<E: fmt::Display>(&self, context: &'static str) -> impl FnOnce(E) -> AppError + '_ {
        move |error| internal(self.name, Some(&self.job), context, error)
    }

    /// Checks that `file_name` was produced and answers with its download URL.
    pub fn respond(&self, ctx: &RequestContext, file_name: &str) -> OpResult {
        expect_output(self.dir(), file_name).map_err(self.fail("output missing"))?;
        let download_url = ctx.download_url(self.job.id(), file_name)?;
        info!(operation = self.name, job = %self.job.id(), file = file_name, "operation finished");
        Ok(Json(DownloadResponse { download_url }))
    }
}

fn internal(
    operation: &'static str,
    job: Option<&JobLease>,
    context: &str,
    error: impl fmt::Display,
) -> AppError {
    match job {
        Some(job) => warn!(operation, job = %job.id(), error = %error, "{context}"),
        None => warn!(operation, error = %error, "{context}"),
    }
    AppError::Internal(format!("{context}: {error}"))
}

/// Client-chosen output name: sanitized, `output.pdf` when absent, `.pdf` enforced.
pub(crate) fn pdf_output_name(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return OUTPUT_PDF.to_string();
    };
    let name = sanitize_filename(raw);
    if name.to_ascii_lowercase().ends_with(".pdf") {
        name
    } else {
        format!("{name}.pdf")
    }
}

/// Ghostscript expands `%d` style patterns in output names.
pub(crate) fn gs_output_arg(file_name: &str) -> String {
    format!("-sOutputFile={}", file_name.replace('%', "%%"))
}

/// `ranges` applies only with `mode=ranges`.
pub(crate) fn selected_ranges<'a>(mode: Option<&str>, ranges: Option<&'a str>) -> Option<&'a str> {
    match mode {
        Some("ranges") => ranges,
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use serde_json::Value;

    use crate::server::testing::{download_target, multipart_request, response_json, send_request, Part};
    use crate::server::{app_router, AppState};
    use crate::jobs::JobId;

    pub const PDF: &[u8] = b"%PDF-1.7\n%fake\n";

    /// Posts a form and returns `(status, json)`.
    pub async fn post_form(state: &AppState, uri: &str, parts: &[Part<'_>]) -> (u16, Value) {
        let mut app = app_router(state.clone());
        let response = send_request(&mut app, multipart_request(uri, parts)).await;
        let status = response.status().as_u16();
        (status, response_json(response).await)
    }

    /// Job id, file name and on-disk path of a successful download response.
    pub fn produced(work_dir: &Path, json: &Value) -> (JobId, String, std::path::PathBuf) {
        let url = json["downloadUrl"].as_str().expect("downloadUrl in response");
        let (job, file) = download_target(url);
        let path = work_dir.join(job.to_string()).join(&file);
        (job, file, path)
    }
}
