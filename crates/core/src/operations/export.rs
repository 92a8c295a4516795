//! Exports out of PDF: office formats, images, HTML and text.

use axum::extract::State;

use super::{OpResult, Operation, INPUT_PDF};
use crate::scripts::HelperScript;
use crate::server::{AppError, AppState, RequestContext};
use crate::tools::{page_count, resolve_output, Invocation};
use crate::upload::{base_name_without_ext, UploadForm};

const IMAGES_DIR: &str = "images";
const DEFAULT_JPEG_DPI: i64 = 150;
const MIN_JPEG_DPI: i64 = 72;
const MAX_JPEG_DPI: i64 = 600;
const HTML_STEM: &str = "document";

async fn export_with_script(
    name: &'static str,
    script: HelperScript,
    extension: &str,
    context: &'static str,
    state: &AppState,
    ctx: &RequestContext,
    form: &UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let output = format!("{}{extension}", base_name_without_ext(&part.file_name));

    let op = Operation::with_input(name, state, part, INPUT_PDF).await?;
    script
        .run(op.tools(), op.dir(), INPUT_PDF, &output)
        .await
        .map_err(op.fail(context))?;
    op.respond(ctx, &output)
}

pub(super) async fn pdf_to_word(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    export_with_script(
        "pdf-to-word",
        HelperScript::PdfToDocx,
        ".docx",
        "pdf2docx convert failed",
        &state,
        &ctx,
        &form,
    )
    .await
}

pub(super) async fn pdf_to_excel(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    export_with_script(
        "pdf-to-excel",
        HelperScript::PdfToXlsx,
        ".xlsx",
        "table extraction failed",
        &state,
        &ctx,
        &form,
    )
    .await
}

pub(super) async fn pdf_to_powerpoint(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    export_with_script(
        "pdf-to-powerpoint",
        HelperScript::PdfToPptx,
        ".pptx",
        "slide conversion failed",
        &state,
        &ctx,
        &form,
    )
    .await
}

/// One JPEG for a single-page document, otherwise a zip of all pages.
pub(super) async fn pdf_to_jpg(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let dpi = form
        .int_or("dpi", DEFAULT_JPEG_DPI)
        .clamp(MIN_JPEG_DPI, MAX_JPEG_DPI);
    let base = base_name_without_ext(&part.file_name);

    let op = Operation::with_input("pdf-to-jpg", &state, part, INPUT_PDF).await?;
    let pages = page_count(op.tools(), op.dir(), INPUT_PDF)
        .await
        .map_err(op.fail("failed to read page count"))?;
    op.create_dir(IMAGES_DIR).await?;
    op.run(
        Invocation::new("pdftoppm")
            .args(["-jpeg", "-r"])
            .arg(dpi.to_string())
            .args([INPUT_PDF.to_string(), format!("{IMAGES_DIR}/page")]),
        "pdftoppm failed",
    )
    .await?;

    if pages == 1 {
        let image = op
            .list(IMAGES_DIR)
            .await?
            .into_iter()
            .find(|name| name.ends_with(".jpg"))
            .ok_or_else(|| op.fail("pdftoppm failed")("no image produced"))?;
        let output = format!("{base}.jpg");
        op.rename(&format!("{IMAGES_DIR}/{image}"), &output).await?;
        return op.respond(&ctx, &output);
    }

    let archive = format!("{base}_images.zip");
    op.zip(IMAGES_DIR, &archive).await?;
    op.respond(&ctx, &archive)
}

/// Candidate names `pdftohtml` uses for a single-file export of `stem`.
pub(crate) fn html_candidates(stem: &str) -> Vec<String> {
    vec![
        format!("{stem}.html"),
        format!("{stem}-html.html"),
        format!("{stem}s.html"),
    ]
}

pub(super) async fn pdf_to_html(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let output = format!("{}.html", base_name_without_ext(&part.file_name));

    let op = Operation::with_input("pdf-to-html", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("pdftohtml")
            .args(["-s", "-noframes", "-enc", "UTF-8", INPUT_PDF, HTML_STEM]),
        "pdftohtml failed",
    )
    .await?;
    let produced = resolve_output(op.dir(), &html_candidates(HTML_STEM))
        .map_err(op.fail("HTML output not found"))?;
    op.rename(&produced, &output).await?;
    op.respond(&ctx, &output)
}

pub(super) async fn extract_text(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let output = format!("{}.txt", base_name_without_ext(&part.file_name));

    let op = Operation::with_input("extract-text", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("pdftotext").args(["-layout", INPUT_PDF, output.as_str()]),
        "pdftotext failed",
    )
    .await?;
    op.respond(&ctx, &output)
}

pub(super) async fn extract_images(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let archive = format!("{}_extracted_images.zip", base_name_without_ext(&part.file_name));

    let op = Operation::with_input("extract-images", &state, part, INPUT_PDF).await?;
    op.create_dir(IMAGES_DIR).await?;
    op.run(
        Invocation::new("pdfimages").args(["-all", INPUT_PDF, "images/image"]),
        "pdfimages failed",
    )
    .await?;
    if op.list(IMAGES_DIR).await?.is_empty() {
        return Err(AppError::BadRequest("no images found in PDF".to_string()));
    }
    op.zip(IMAGES_DIR, &archive).await?;
    op.respond(&ctx, &archive)
}
