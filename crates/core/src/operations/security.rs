//! Encryption, redaction and other rewrites that change what a reader can recover.

use axum::extract::State;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{OpResult, Operation, INPUT_PDF};
use crate::server::{AppError, AppState, RequestContext};
use crate::tools::{Invocation, ToolError};
use crate::upload::{base_name_without_ext, UploadForm};

/// Scratch directory for redaction. Uploads are saved as single files, so no
/// output name can land inside it.
const REDACT_WORK_DIR: &str = "redact";
const RASTER_PREFIX: &str = "redact/page";
const REDACTION_DPI: &str = "300";
const REDACTED_RAW_PDF: &str = "redact/rebuilt.pdf";

fn output_name(file_name: &str, suffix: &str) -> String {
    format!("{}_{suffix}.pdf", base_name_without_ext(file_name))
}

pub(super) async fn protect(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let password = form.require_text("password")?;
    let part = form.require_file("file")?;
    let output = output_name(&part.file_name, "protected");

    let op = Operation::with_input("protect", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("qpdf")
            .args(["--warning-exit-0", "--encrypt"])
            .secret_arg(password)
            .secret_arg(password)
            .args(["256", "--", INPUT_PDF, output.as_str()]),
        "qpdf encrypt failed",
    )
    .await?;
    op.respond(&ctx, &output)
}

pub(super) async fn unlock(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let password = form.text("password");
    let part = form.require_file("file")?;
    let output = output_name(&part.file_name, "unlocked");

    let op = Operation::with_input("unlock", &state, part, INPUT_PDF).await?;
    let mut invocation = Invocation::new("qpdf").arg("--warning-exit-0");
    if let Some(password) = password {
        invocation = invocation.secret_arg(format!("--password={password}"));
    }
    op.run(
        invocation.args(["--decrypt", INPUT_PDF, output.as_str()]),
        "qpdf decrypt failed",
    )
    .await?;
    op.respond(&ctx, &output)
}

/// A box on one page, in fractions of the page width and height.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub(crate) struct RedactionArea {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl RedactionArea {
    /// ImageMagick `-draw` primitive for an image of `width`x`height` pixels.
    pub fn draw_command(&self, width: u32, height: u32) -> String {
        let scale = |fraction: f64, pixels: u32| (fraction.clamp(0.0, 1.0) * f64::from(pixels)) as i64;
        format!(
            "rectangle {},{} {},{}",
            scale(self.x, width),
            scale(self.y, height),
            scale(self.x + self.width, width),
            scale(self.y + self.height, height),
        )
    }
}

pub(crate) fn parse_redactions(raw: Option<&str>) -> Result<Vec<RedactionArea>, AppError> {
    let raw = raw.ok_or_else(|| AppError::BadRequest("redactions JSON required".to_string()))?;
    let areas: Vec<RedactionArea> = serde_json::from_str(raw)
        .map_err(|error| AppError::BadRequest(format!("invalid redactions JSON: {error}")))?;
    if areas.is_empty() {
        return Err(AppError::BadRequest(
            "at least one redaction area required".to_string(),
        ));
    }
    Ok(areas)
}

/// Parses `identify -format "%w %h"` output.
pub(crate) fn parse_dimensions(output: &str) -> Option<(u32, u32)> {
    let mut tokens = output.split_whitespace();
    let width = tokens.next()?.parse().ok()?;
    let height = tokens.next()?.parse().ok()?;
    Some((width, height))
}

/// Page number of a `pdftoppm -png` output such as `page-7.png` or `page-07.png`.
fn raster_page_number(name: &str) -> Option<u32> {
    name.strip_prefix("page-")?
        .strip_suffix(".png")?
        .parse()
        .ok()
        .filter(|page| *page > 0)
}

/// Rendered page images in page order, as paths relative to the job directory.
async fn rendered_pages(op: &Operation) -> Result<Vec<(u32, String)>, AppError> {
    let mut pages: Vec<(u32, String)> = op
        .list(REDACT_WORK_DIR)
        .await?
        .into_iter()
        .filter_map(|name| {
            raster_page_number(&name).map(|page| (page, format!("{REDACT_WORK_DIR}/{name}")))
        })
        .collect();
    pages.sort();
    Ok(pages)
}

/// Rasterizes the document, paints the boxes black and rebuilds a PDF from
/// the images, so nothing under a box survives.
pub(super) async fn redact(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let areas = parse_redactions(form.text("redactions"))?;
    let part = form.require_file("file")?;
    let output = output_name(&part.file_name, "redacted");

    let op = Operation::with_input("redact", &state, part, INPUT_PDF).await?;
    op.create_dir(REDACT_WORK_DIR).await?;
    op.run(
        Invocation::new("pdftoppm").args(["-png", "-r", REDACTION_DPI, INPUT_PDF, RASTER_PREFIX]),
        "failed to rasterize PDF",
    )
    .await?;

    let pages = rendered_pages(&op).await?;
    if pages.is_empty() {
        return Err(op.fail("failed to rasterize PDF")("no pages rendered"));
    }

    let mut requested: Vec<u32> = areas.iter().map(|area| area.page).collect();
    requested.sort_unstable();
    requested.dedup();
    for page in requested {
        let Some((_, image)) = pages.iter().find(|(number, _)| *number == page) else {
            warn!(job = %op.job().id(), page, "redaction page not in document; skipping");
            continue;
        };

        let identify = op
            .run(
                Invocation::new("identify").args(["-format", "%w %h", image.as_str()]),
                "failed to read page dimensions",
            )
            .await?;
        let (width, height) = parse_dimensions(&identify.stdout).ok_or_else(|| {
            op.fail("failed to read page dimensions")(ToolError::Unparsable {
                program: "identify".to_string(),
                what: "image dimensions",
            })
        })?;

        let painted = format!("{image}.tmp.png");
        let mut invocation = Invocation::new("convert").args([image.as_str(), "-fill", "black"]);
        for area in areas.iter().filter(|area| area.page == page) {
            invocation = invocation.arg("-draw").arg(area.draw_command(width, height));
        }
        op.run(invocation.arg(painted.as_str()), "failed to draw redactions")
            .await?;
        op.rename(&painted, image).await?;
        debug!(job = %op.job().id(), page, "page redacted");
    }

    op.run(
        Invocation::new("convert")
            .args(pages.iter().map(|(_, image)| image.as_str()))
            .arg(REDACTED_RAW_PDF),
        "failed to rebuild PDF",
    )
    .await?;
    op.run(
        Invocation::new("qpdf")
            .args(["--warning-exit-0", "--linearize", "--compress-streams=y"])
            .args(["--object-streams=disable", REDACTED_RAW_PDF, output.as_str()]),
        "qpdf optimize failed",
    )
    .await?;

    if let Err(error) = tokio::fs::remove_dir_all(op.path(REDACT_WORK_DIR)).await {
        debug!(job = %op.job().id(), error = %error, "failed to remove redaction scratch files");
    }
    op.respond(&ctx, &output)
}

pub(super) async fn flatten(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let output = output_name(&part.file_name, "flattened");

    let op = Operation::with_input("flatten", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("qpdf")
            .args(["--warning-exit-0", "--flatten-annotations=all", "--flatten-rotation"])
            .args([INPUT_PDF, output.as_str()]),
        "qpdf flatten failed",
    )
    .await?;
    op.respond(&ctx, &output)
}

/// Linearizes the document; no cryptographic signature is applied.
pub(super) async fn digital_signature(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let output = output_name(&part.file_name, "signed");

    let op = Operation::with_input("digital-signature", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("qpdf").args(["--linearize", "--warning-exit-0", INPUT_PDF, output.as_str()]),
        "qpdf sign failed",
    )
    .await?;
    op.respond(&ctx, &output)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::{post_form, produced, PDF};
    use super::*;
    use crate::server::testing::test_state;
    use crate::tools::testing::{failed, ok, touch, FakeRunner};

    fn redacting_fake() -> Arc<FakeRunner> {
        FakeRunner::new(|dir, invocation| match invocation.program.as_str() {
            "pdftoppm" => {
                for name in ["page-01.png", "page-02.png", "page-10.png"] {
                    touch(dir, &format!("redact/{name}"));
                }
                ok("")
            }
            "identify" => ok("1000 2000"),
            _ => {
                touch(dir, invocation.args.last().unwrap());
                ok("")
            }
        })
    }

    fn bad_request(result: Result<Vec<RedactionArea>, AppError>) -> String {
        match result {
            Err(AppError::BadRequest(message)) => message,
            other => panic!("expected a bad request, got {other:?}"),
        }
    }

    #[test]
    fn redactions_are_validated_before_any_work() {
        assert_eq!(bad_request(parse_redactions(None)), "redactions JSON required");
        assert!(bad_request(parse_redactions(Some("{not json"))).starts_with("invalid redactions JSON: "));
        assert_eq!(
            bad_request(parse_redactions(Some("[]"))),
            "at least one redaction area required"
        );

        let areas = parse_redactions(Some(
            r#"[{"page":2,"x":0.25,"y":0.5,"width":0.5,"height":0.25}]"#,
        ))
        .unwrap();
        assert_eq!(areas[0].draw_command(1000, 2000), "rectangle 250,1000 750,1500");
    }

    #[test]
    fn draw_command_stays_inside_the_image() {
        let area = RedactionArea {
            page: 1,
            x: 0.75,
            y: -0.5,
            width: 0.5,
            height: 1.0,
        };
        assert_eq!(area.draw_command(400, 200), "rectangle 300,0 400,100");
    }

    #[test]
    fn dimensions_and_raster_names() {
        assert_eq!(parse_dimensions("2550 3300"), Some((2550, 3300)));
        assert_eq!(parse_dimensions("2550"), None);
        assert_eq!(raster_page_number("page-07.png"), Some(7));
        assert_eq!(raster_page_number("page-7.png.tmp.png"), None);
        assert_eq!(raster_page_number("input.pdf"), None);
    }

    #[tokio::test]
    async fn protect_requires_password_and_keeps_it_out_of_logs() {
        let temp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|dir, invocation| {
            touch(dir, invocation.args.last().unwrap());
            ok("")
        });
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(&state, "/pdf/protect", &[("file", Some("report.pdf"), PDF)]).await;
        assert_eq!(status, 400);
        assert_eq!(json["error"], "password is required");

        let (status, json) = post_form(
            &state,
            "/pdf/protect",
            &[("file", Some("report.pdf"), PDF), ("password", None, b"hunter2")],
        )
        .await;
        assert_eq!(status, 200, "{json}");
        assert_eq!(produced(temp.path(), &json).1, "report_protected.pdf");

        let call = &runner.calls()[0];
        assert_eq!(
            call.args,
            ["--warning-exit-0", "--encrypt", "hunter2", "hunter2", "256", "--", "input.pdf", "report_protected.pdf"]
        );
        assert!(!call.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn unlock_failure_reports_qpdf_error() {
        let temp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|_, _| failed(2, "invalid password"));
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/pdf/unlock",
            &[("file", Some("locked.pdf"), PDF), ("password", None, b"wrong")],
        )
        .await;
        assert_eq!(status, 500);
        let error = json["error"].as_str().unwrap();
        assert!(error.starts_with("qpdf decrypt failed: "), "{error}");
        assert!(error.contains("invalid password"), "{error}");
        assert_eq!(
            runner.calls()[0].args,
            ["--warning-exit-0", "--password=wrong", "--decrypt", "input.pdf", "locked_unlocked.pdf"]
        );
    }

    #[tokio::test]
    async fn redact_paints_requested_pages_and_rebuilds_in_page_order() {
        let temp = tempfile::tempdir().unwrap();
        let runner = redacting_fake();
        let state = test_state(temp.path(), runner.clone());

        let redactions = br#"[
            {"page":10,"x":0.25,"y":0.5,"width":0.5,"height":0.25},
            {"page":2,"x":0,"y":0,"width":1,"height":0.5},
            {"page":2,"x":0,"y":0.5,"width":0.5,"height":0.5},
            {"page":30,"x":0,"y":0,"width":1,"height":1}
        ]"#;
        let (status, json) = post_form(
            &state,
            "/pdf/redact",
            &[("file", Some("contract.pdf"), PDF), ("redactions", None, redactions)],
        )
        .await;
        assert_eq!(status, 200, "{json}");
        let (_, file, path) = produced(temp.path(), &json);
        assert_eq!(file, "contract_redacted.pdf");
        assert!(path.is_file());

        let calls = runner.calls();
        assert_eq!(
            runner.programs(),
            ["pdftoppm", "identify", "convert", "identify", "convert", "convert", "qpdf"]
        );
        assert_eq!(
            calls[2].args,
            [
                "redact/page-02.png", "-fill", "black",
                "-draw", "rectangle 0,0 1000,1000",
                "-draw", "rectangle 0,1000 500,2000",
                "redact/page-02.png.tmp.png",
            ]
        );
        assert_eq!(calls[0].args.last().unwrap(), "redact/page");
        assert_eq!(calls[3].args.last().unwrap(), "redact/page-10.png");
        assert_eq!(
            calls[5].args,
            ["redact/page-01.png", "redact/page-02.png", "redact/page-10.png", "redact/rebuilt.pdf"]
        );

        let job_dir = path.parent().unwrap();
        assert!(!job_dir.join("redact").exists());
    }

    #[tokio::test]
    async fn redact_output_never_collides_with_scratch_files() {
        let temp = tempfile::tempdir().unwrap();
        let runner = redacting_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/pdf/redact",
            &[
                ("file", Some("temp.pdf"), PDF),
                ("redactions", None, br#"[{"page":1,"x":0,"y":0,"width":1,"height":1}]"#),
            ],
        )
        .await;
        assert_eq!(status, 200, "{json}");
        let (_, file, path) = produced(temp.path(), &json);
        assert_eq!(file, "temp_redacted.pdf");
        assert!(path.is_file());

        let qpdf = runner.calls().last().unwrap().clone();
        assert_eq!(qpdf.program, "qpdf");
        let (input, output) = (&qpdf.args[qpdf.args.len() - 2], &qpdf.args[qpdf.args.len() - 1]);
        assert_ne!(input, output);
        assert_eq!(output, "temp_redacted.pdf");
    }

    #[tokio::test]
    async fn invalid_redactions_do_not_allocate_a_job() {
        let temp = tempfile::tempdir().unwrap();
        let runner = redacting_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/api/pdf/redact",
            &[("file", Some("a.pdf"), PDF), ("redactions", None, b"[]")],
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(json["error"], "at least one redaction area required");
        assert!(runner.calls().is_empty());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
