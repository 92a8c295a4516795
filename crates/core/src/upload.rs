//! Multipart upload parsing and persistence into job directories.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request};
use tracing::debug;

use crate::jobs::JobError;
use crate::server::AppError;

const FALLBACK_FILENAME: &str = "file";

/// One uploaded file part, fully buffered.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub bytes: Bytes,
}

/// Text fields and file parts of a `multipart/form-data` request.
///
/// The body ceiling is enforced by the route's `DefaultBodyLimit`; an oversized
/// body surfaces as a field read error and is reported like any malformed form.
#[derive(Debug, Default)]
pub struct UploadForm {
    fields: HashMap<String, String>,
    files: Vec<FilePart>,
}

impl<S> FromRequest<S> for UploadForm
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|_| invalid_form())?;

        let mut form = UploadForm::default();
        while let Some(field) = multipart.next_field().await.map_err(|e| {
            debug!(error = %e, "failed to read multipart field");
            invalid_form()
        })? {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let bytes = field.bytes().await.map_err(|_| invalid_form())?;
                    form.files.push(FilePart {
                        field: name,
                        file_name,
                        bytes,
                    });
                }
                None => {
                    let value = field.text().await.map_err(|_| invalid_form())?;
                    // First value wins, like a plain form lookup.
                    form.fields.entry(name).or_insert(value);
                }
            }
        }

        Ok(form)
    }
}

fn invalid_form() -> AppError {
    AppError::BadRequest("invalid multipart form".to_string())
}

impl UploadForm {
    pub fn file(&self, field: &str) -> Option<&FilePart> {
        self.files.iter().find(|part| part.field == field)
    }

    /// The single file under `field`, or 400 `"<field> is required"`.
    pub fn require_file(&self, field: &str) -> Result<&FilePart, AppError> {
        self.file(field)
            .ok_or_else(|| AppError::BadRequest(format!("{field} is required")))
    }

    /// All files under `field` in upload order; empty means 400 `no files provided`.
    pub fn require_files(&self, field: &str) -> Result<Vec<&FilePart>, AppError> {
        let files: Vec<&FilePart> = self.files.iter().filter(|part| part.field == field).collect();
        if files.is_empty() {
            return Err(AppError::BadRequest("no files provided".to_string()));
        }
        Ok(files)
    }

    /// Trimmed text value; blank counts as absent.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn require_text(&self, field: &str) -> Result<&str, AppError> {
        self.text(field)
            .ok_or_else(|| AppError::BadRequest(format!("{field} is required")))
    }

    pub fn text_or<'a>(&'a self, field: &str, default: &'a str) -> &'a str {
        self.text(field).unwrap_or(default)
    }

    /// Unparsable numbers fall back to the default.
    pub fn int_or(&self, field: &str, default: i64) -> i64 {
        self.text(field)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    pub fn float_or(&self, field: &str, default: f64) -> f64 {
        self.text(field)
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(default)
    }
}

/// Writes an uploaded part into `dir` under `dest_name`.
pub async fn materialize(dir: &Path, part: &FilePart, dest_name: &str) -> Result<PathBuf, JobError> {
    let mut components = Path::new(dest_name).components();
    if !matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) {
        return Err(JobError::InvalidName(dest_name.to_string()));
    }

    let path = dir.join(dest_name);
    tokio::fs::write(&path, &part.bytes)
        .await
        .map_err(|source| JobError::io("write upload", &path, source))?;
    debug!(
        file = %path.display(),
        bytes = part.bytes.len(),
        original = %part.file_name,
        "materialized upload"
    );
    Ok(path)
}

/// Reduces a client-supplied name to a single safe path component.
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim();
    let last = trimmed
        .rsplit(['/', '\\'])
        .find(|segment| !segment.trim().is_empty())
        .unwrap_or("");
    let cleaned = last.replace(['/', '\\'], "_");
    let cleaned = cleaned.trim();
    match cleaned {
        "" | "." | ".." => FALLBACK_FILENAME.to_string(),
        other => other.to_string(),
    }
}

/// Sanitized name without its final extension.
pub fn base_name_without_ext(name: &str) -> String {
    let sanitized = sanitize_filename(name);
    match sanitized.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => sanitized,
    }
}

/// Lowercased extension including the dot, e.g. `.png`.
pub fn extension_of(name: &str) -> Option<String> {
    let sanitized = sanitize_filename(name);
    match sanitized.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            Some(format!(".{}", ext.to_ascii_lowercase()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str, bytes: &'static [u8]) -> FilePart {
        FilePart {
            field: "file".to_string(),
            file_name: name.to_string(),
            bytes: Bytes::from_static(bytes),
        }
    }

    #[test]
    fn sanitize_filename_keeps_last_segment() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("  C:\\Users\\me\\scan 1.pdf "), "scan 1.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir/"), "dir");
    }

    #[test]
    fn sanitize_filename_falls_back_for_empty_and_dot_names() {
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("   "), "file");
        assert_eq!(sanitize_filename(".."), "file");
        assert_eq!(sanitize_filename("/"), "file");
    }

    #[test]
    fn base_name_strips_only_final_extension() {
        assert_eq!(base_name_without_ext("annual.report.pdf"), "annual.report");
        assert_eq!(base_name_without_ext("README"), "README");
        assert_eq!(base_name_without_ext(".hidden"), ".hidden");
        assert_eq!(base_name_without_ext(""), "file");
    }

    #[test]
    fn extension_of_is_lowercased() {
        assert_eq!(extension_of("Slides.PPTX").as_deref(), Some(".pptx"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of(".bashrc"), None);
    }

    #[test]
    fn numeric_fields_fall_back_on_garbage() {
        let mut form = UploadForm::default();
        form.fields.insert("dpi".to_string(), "abc".to_string());
        form.fields.insert("opacity".to_string(), " 0.5 ".to_string());
        form.fields.insert("nan".to_string(), "NaN".to_string());

        assert_eq!(form.int_or("dpi", 150), 150);
        assert_eq!(form.int_or("missing", 7), 7);
        assert_eq!(form.float_or("opacity", 0.25), 0.5);
        assert_eq!(form.float_or("nan", 0.25), 0.25);
    }

    #[test]
    fn blank_text_is_missing() {
        let mut form = UploadForm::default();
        form.fields.insert("order".to_string(), "  ".to_string());
        assert!(form.text("order").is_none());
        assert!(matches!(
            form.require_text("order"),
            Err(AppError::BadRequest(msg)) if msg == "order is required"
        ));
    }

    #[test]
    fn require_files_keeps_upload_order() {
        let mut form = UploadForm::default();
        for name in ["b.pdf", "a.pdf"] {
            form.files.push(FilePart {
                field: "files".to_string(),
                ..part(name, b"%PDF")
            });
        }
        let names: Vec<&str> = form
            .require_files("files")
            .expect("files present")
            .iter()
            .map(|p| p.file_name.as_str())
            .collect();
        assert_eq!(names, ["b.pdf", "a.pdf"]);
        assert!(form.require_files("images").is_err());
    }

    #[tokio::test]
    async fn materialize_writes_bytes_and_rejects_nested_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let upload = part("in.pdf", b"%PDF-1.7");

        let written = materialize(temp.path(), &upload, "input.pdf")
            .await
            .expect("materialize");
        assert_eq!(std::fs::read(&written).expect("read back"), b"%PDF-1.7");

        for bad in ["../escape.pdf", "nested/input.pdf", "/abs.pdf", ""] {
            assert!(matches!(
                materialize(temp.path(), &upload, bad).await,
                Err(JobError::InvalidName(_))
            ));
        }
    }
}
