//! Text stamped onto pages: page numbers, watermarks, headers and footers.

use axum::extract::State;

use super::{gs_output_arg, OpResult, Operation, INPUT_PDF, OUTPUT_PDF, PAGES_DIR};
use crate::server::{AppError, AppState, RequestContext};
use crate::tools::{page_count, parse_page_size, resolve_output, Invocation, LETTER_PAGE_SIZE};
use crate::upload::{base_name_without_ext, UploadForm};

const OVERLAY_PS: &str = "overlay.ps";
/// Highest first label; keeps `start_at + page` far from overflow.
const MAX_START_AT: i64 = 1_000_000_000;

/// Names pdfcpu has used for the n-th page written by `extract -mode page`.
pub(crate) fn extracted_page_candidates(page: u32) -> Vec<String> {
    vec![
        format!("{PAGES_DIR}/input_page_{page}.pdf"),
        format!("{PAGES_DIR}/page_{page}.pdf"),
        format!("{PAGES_DIR}/page-{page}.pdf"),
    ]
}

pub(crate) fn page_number_description(position: &str, font_size: i64, opacity: f64) -> String {
    format!("pos:{position}, points:{font_size}, scale:1 abs, rot:0, op:{opacity:.2}, fillc:.2 .2 .2")
}

pub(crate) fn watermark_description(position: &str, rotation: i64, font_size: i64, opacity: f64) -> String {
    format!("pos:{position}, rot:{rotation}, points:{font_size}, op:{opacity:.2}, c:.9 .9 .9")
}

/// Splits the document into single pages, stamps each page once and merges
/// the stamped pages back in order. Stamping one page file at a time avoids
/// pdfcpu stacking stamp resources on a shared document.
pub(super) async fn page_numbers(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let position = form.text_or("position", "bc");
    let font_size = form.int_or("fontSize", 10).clamp(6, 72);
    let opacity = form.float_or("opacity", 0.95).clamp(0.0, 1.0);
    let start_at = form.int_or("startAt", 1).clamp(1, MAX_START_AT);
    let description = page_number_description(position, font_size, opacity);

    let op = Operation::with_input("page-numbers", &state, part, INPUT_PDF).await?;
    let total = page_count(op.tools(), op.dir(), INPUT_PDF)
        .await
        .map_err(op.fail("failed to read page count"))?;

    op.create_dir(PAGES_DIR).await?;
    op.run(
        Invocation::new("pdfcpu").args(["extract", "-mode", "page", INPUT_PDF, PAGES_DIR]),
        "failed to prepare pages",
    )
    .await?;

    let mut stamped = Vec::with_capacity(total as usize);
    for page in 1..=total {
        let source = resolve_output(op.dir(), &extracted_page_candidates(page))
            .map_err(op.fail("failed to prepare pages"))?;
        let label = (start_at + i64::from(page) - 1).to_string();
        let target = format!("stamped-{page:04}.pdf");
        op.run(
            Invocation::new("pdfcpu")
                .args(["stamp", "add", "-mode", "text", "--"])
                .args([label.as_str(), description.as_str(), source.as_str(), target.as_str()]),
            "failed to add page numbers",
        )
        .await?;
        stamped.push(target);
    }

    op.run(
        Invocation::new("pdfcpu").args(["merge", OUTPUT_PDF]).args(stamped),
        "failed to write output",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

pub(super) async fn watermark(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let text = form.require_text("text")?;
    let position = form.text_or("position", "c");
    let rotation = form.int_or("rotation", 45);
    let font_size = form.int_or("fontSize", 48).clamp(8, 200);
    let opacity = form.float_or("opacity", 0.25).clamp(0.0, 1.0);
    let description = watermark_description(position, rotation, font_size, opacity);

    let op = Operation::with_input("watermark", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("pdfcpu")
            .args(["stamp", "add", "-mode", "text", "--"])
            .args([text, description.as_str(), INPUT_PDF, OUTPUT_PDF]),
        "failed to add watermark",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

/// Escapes text for a PostScript string literal.
pub(crate) fn escape_postscript(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' | '(' | ')' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            '\r' | '\n' | '\t' => escaped.push(' '),
            other => escaped.push(other),
        }
    }
    escaped
}

/// An `EndPage` procedure drawing centred gray text 25pt below the top edge
/// and 20pt above the bottom edge of every page.
pub(crate) fn header_footer_overlay(
    header: Option<&str>,
    footer: Option<&str>,
    (width, height): (f64, f64),
) -> String {
    let center = width / 2.0;
    let mut draw = String::from(
        "    /Helvetica findfont 12 scalefont setfont\n    0.5 0.5 0.5 setrgbcolor\n",
    );
    for (text, y) in [(header, height - 25.0), (footer, 20.0)] {
        if let Some(text) = text {
            draw.push_str(&format!(
                "    {center:.1} {y:.1} moveto ({}) dup stringwidth pop 2 div neg 0 rmoveto show\n",
                escape_postscript(text)
            ));
        }
    }

    format!(
        "%!PS-Adobe-3.0\n<< /EndPage {{\n  exch pop\n  0 eq {{\n{draw}    true\n  }} {{ false }} ifelse\n}} bind >> setpagedevice\n"
    )
}

pub(super) async fn header_footer(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let header = form.text("headerText").or_else(|| ctx.query("headerText"));
    let footer = form.text("footerText").or_else(|| ctx.query("footerText"));
    if header.is_none() && footer.is_none() {
        return Err(AppError::BadRequest(
            "at least one of headerText or footerText is required".to_string(),
        ));
    }
    let output = format!("{}_headerfooter.pdf", base_name_without_ext(&part.file_name));

    let op = Operation::with_input("add-header-footer", &state, part, INPUT_PDF).await?;
    let page_size = match op
        .tools()
        .run(op.dir(), Invocation::new("pdfinfo").arg(INPUT_PDF))
        .await
    {
        Ok(info) => parse_page_size(&info.stdout),
        Err(_) => LETTER_PAGE_SIZE,
    };

    op.write(OVERLAY_PS, header_footer_overlay(header, footer, page_size))
        .await?;
    op.run(
        Invocation::new("gs")
            .args(["-dBATCH", "-dNOPAUSE", "-dQUIET", "-sDEVICE=pdfwrite"])
            .arg("-dPDFSETTINGS=/prepress")
            .arg(gs_output_arg(&output))
            .args([OVERLAY_PS, INPUT_PDF]),
        "failed to add header/footer",
    )
    .await?;
    op.respond(&ctx, &output)
}
