//! Conversions into PDF and whole-document rewrites.

use axum::extract::State;
use url::Url;

use super::{gs_output_arg, pdf_output_name, OpResult, Operation, INPUT_PDF, OUTPUT_PDF};
use crate::server::{AppError, AppState, RequestContext};
use crate::tools::Invocation;
use crate::upload::{base_name_without_ext, extension_of, FilePart, UploadForm};

const SCANS_RAW_PDF: &str = "scans_raw.pdf";
const HTML_INPUT: &str = "input.html";
const OFFICE_SOURCE_STEM: &str = "source";

/// Writes every part as `<prefix>_<index><ext>` and returns the names in order.
async fn save_images(op: &Operation, parts: &[&FilePart], prefix: &str) -> Result<Vec<String>, AppError> {
    let mut names = Vec::with_capacity(parts.len());
    for (index, part) in parts.iter().enumerate() {
        let ext = extension_of(&part.file_name).unwrap_or_default();
        let name = format!("{prefix}_{index}{ext}");
        op.save(part, &name).await?;
        names.push(name);
    }
    Ok(names)
}

pub(super) async fn scan_to_pdf(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let files = form.require_files("files")?;

    let op = Operation::start("scan-to-pdf", &state).await?;
    let images = save_images(&op, &files, "scan").await?;
    op.run(
        Invocation::new("convert").args(images).arg(SCANS_RAW_PDF),
        "failed to convert scans",
    )
    .await?;
    op.run(
        Invocation::new("ocrmypdf").args(["--skip-text", SCANS_RAW_PDF, OUTPUT_PDF]),
        "failed to OCR scans",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

pub(super) async fn image_to_pdf(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let files = form.require_files("files")?;
    let output = pdf_output_name(form.text("outputFilename"));

    let op = Operation::start("image-to-pdf", &state).await?;
    let images = save_images(&op, &files, "image").await?;
    op.run(
        Invocation::new("convert").args(images).arg(output.as_str()),
        "failed to convert images",
    )
    .await?;
    op.respond(&ctx, &output)
}

/// Ghostscript `PDFSETTINGS` preset for a compression level; unknown levels
/// get the strongest compression.
pub(crate) fn compression_preset(level: &str) -> &'static str {
    match level {
        "medium" => "/ebook",
        "high" => "/printer",
        _ => "/screen",
    }
}

pub(super) async fn compress(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let level = form.text_or("level", "medium").to_ascii_lowercase();
    let preset = compression_preset(&level);

    let op = Operation::with_input("compress", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("gs")
            .args(["-sDEVICE=pdfwrite", "-dCompatibilityLevel=1.4"])
            .arg(format!("-dPDFSETTINGS={preset}"))
            .args(["-dNOPAUSE", "-dQUIET", "-dBATCH"])
            .arg(gs_output_arg(OUTPUT_PDF))
            .arg(INPUT_PDF),
        "failed to compress PDF",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

pub(super) async fn repair(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;

    let op = Operation::with_input("repair", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("pdfcpu").args(["optimize", INPUT_PDF, OUTPUT_PDF]),
        "failed to repair PDF",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

/// Tesseract language lists look like `eng` or `eng+deu`.
pub(crate) fn is_valid_ocr_language(lang: &str) -> bool {
    lang.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '+')
}

pub(super) async fn ocr(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let lang = form.text("lang");
    if lang.is_some_and(|lang| !is_valid_ocr_language(lang)) {
        return Err(AppError::BadRequest("invalid lang".to_string()));
    }

    let op = Operation::with_input("ocr", &state, part, INPUT_PDF).await?;
    let mut invocation = Invocation::new("ocrmypdf").arg("--skip-text");
    if let Some(lang) = lang {
        invocation = invocation.args(["-l", lang]);
    }
    op.run(invocation.args([INPUT_PDF, OUTPUT_PDF]), "failed to OCR PDF")
        .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

pub(super) async fn convert_to_pdfa(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let output = format!("{}_pdfa.pdf", base_name_without_ext(&part.file_name));

    let op = Operation::with_input("convert-to-pdfa", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("gs")
            .args(["-dBATCH", "-dNOPAUSE", "-dQUIET", "-sDEVICE=pdfwrite"])
            .args(["-dPDFA=2", "-dPDFACompatibilityPolicy=1"])
            .arg(gs_output_arg(&output))
            .arg(INPUT_PDF),
        "failed to convert to PDF/A",
    )
    .await?;
    op.respond(&ctx, &output)
}

/// Runs LibreOffice on the upload saved as `source<ext>` and publishes the
/// result as `<base>.pdf`.
async fn office_to_pdf(
    name: &'static str,
    state: &AppState,
    ctx: &RequestContext,
    form: &UploadForm,
    default_ext: &str,
) -> OpResult {
    let part = form.require_file("file")?;
    let ext = extension_of(&part.file_name).unwrap_or_else(|| default_ext.to_string());
    let source = format!("{OFFICE_SOURCE_STEM}{ext}");
    let converted = format!("{OFFICE_SOURCE_STEM}.pdf");
    let output = format!("{}.pdf", base_name_without_ext(&part.file_name));

    let op = Operation::with_input(name, state, part, &source).await?;
    op.run(
        Invocation::new("libreoffice")
            .args(["--headless", "--nologo", "--convert-to", "pdf", "--outdir", "."])
            .arg(source.as_str()),
        "failed to convert document",
    )
    .await?;
    op.rename(&converted, &output).await?;
    op.respond(ctx, &output)
}

pub(super) async fn word_to_pdf(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    office_to_pdf("word-to-pdf", &state, &ctx, &form, ".docx").await
}

pub(super) async fn excel_to_pdf(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    office_to_pdf("excel-to-pdf", &state, &ctx, &form, ".xlsx").await
}

pub(super) async fn powerpoint_to_pdf(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    office_to_pdf("powerpoint-to-pdf", &state, &ctx, &form, ".pptx").await
}

/// Accepts only absolute `http`/`https` URLs.
pub(crate) fn parse_web_url(raw: &str) -> Result<Url, AppError> {
    Url::parse(raw)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .ok_or_else(|| AppError::BadRequest("url must be an http or https URL".to_string()))
}

enum HtmlSource<'a> {
    Url(Url),
    Upload(&'a FilePart),
}

pub(super) async fn html_to_pdf(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let source = match form.text("url") {
        Some(raw) => HtmlSource::Url(parse_web_url(raw)?),
        None => HtmlSource::Upload(
            form.file("file")
                .ok_or_else(|| AppError::BadRequest("file or url required".to_string()))?,
        ),
    };

    let op = Operation::start("html-to-pdf", &state).await?;
    let (source, output) = match source {
        HtmlSource::Url(url) => (url.to_string(), "webpage.pdf".to_string()),
        HtmlSource::Upload(part) => {
            op.save(part, HTML_INPUT).await?;
            let output = format!("{}.pdf", base_name_without_ext(&part.file_name));
            (HTML_INPUT.to_string(), output)
        }
    };

    op.run(
        Invocation::new("wkhtmltopdf")
            .args(["--enable-local-file-access", "--quiet"])
            .args([source, output.clone()]),
        "wkhtmltopdf failed",
    )
    .await?;
    op.respond(&ctx, &output)
}
