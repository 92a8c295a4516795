//! Page-level restructuring: merge, split, remove, extract, organize, rotate, crop.

use axum::extract::State;
use serde::Deserialize;

use super::{
    pdf_output_name, selected_ranges, OpResult, Operation, INPUT_PDF, OUTPUT_PDF, PAGES_DIR,
};
use crate::server::{AppError, AppState, RequestContext};
use crate::tools::Invocation;
use crate::upload::{base_name_without_ext, UploadForm};

const WORK_PDF: &str = "work.pdf";
const ROTATION_ANGLES: [i64; 3] = [90, 180, 270];

pub(super) async fn merge(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let files = form.require_files("files")?;
    let output = pdf_output_name(form.text("outputFilename"));

    let op = Operation::start("merge", &state).await?;
    let mut inputs = Vec::with_capacity(files.len());
    for (index, part) in files.iter().enumerate() {
        let name = format!("input_{index}.pdf");
        op.save(part, &name).await?;
        inputs.push(name);
    }

    op.run(
        Invocation::new("pdfcpu").args(["merge", output.as_str()]).args(inputs),
        "failed to merge PDFs",
    )
    .await?;
    op.respond(&ctx, &output)
}

pub(super) async fn split(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let ranges = selected_ranges(form.text("mode"), form.text("ranges"));
    let archive = format!("{}_split_pages.zip", base_name_without_ext(&part.file_name));

    let op = Operation::with_input("split", &state, part, INPUT_PDF).await?;
    op.create_dir(PAGES_DIR).await?;
    op.run(extract_pages_invocation(ranges), "failed to split PDF")
        .await?;
    op.zip(PAGES_DIR, &archive).await?;
    op.respond(&ctx, &archive)
}

fn extract_pages_invocation(ranges: Option<&str>) -> Invocation {
    let invocation = Invocation::new("pdfcpu").args(["extract", "-mode", "page"]);
    let invocation = match ranges {
        Some(ranges) => invocation.args(["-pages", ranges]),
        None => invocation,
    };
    invocation.args([INPUT_PDF, PAGES_DIR])
}

pub(super) async fn remove_pages(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let pages = form.require_text("pages")?;

    let op = Operation::with_input("remove-pages", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("pdfcpu").args(["pages", "remove", "-pages", pages, INPUT_PDF, OUTPUT_PDF]),
        "failed to remove pages",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

pub(super) async fn extract_pages(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    const ARCHIVE: &str = "extracted_pages.zip";

    let part = form.require_file("file")?;
    let ranges = selected_ranges(form.text("mode"), form.text("ranges"));

    let op = Operation::with_input("extract-pages", &state, part, INPUT_PDF).await?;
    if let Some(ranges) = ranges {
        op.run(
            Invocation::new("pdfcpu").args(["collect", "-pages", ranges, INPUT_PDF, OUTPUT_PDF]),
            "failed to extract pages",
        )
        .await?;
        return op.respond(&ctx, OUTPUT_PDF);
    }

    op.create_dir(PAGES_DIR).await?;
    op.run(extract_pages_invocation(None), "failed to extract pages")
        .await?;
    op.zip(PAGES_DIR, ARCHIVE).await?;
    op.respond(&ctx, ARCHIVE)
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PageRotation {
    pub page_number: i64,
    pub degrees: i64,
}

/// Groups rotations by normalized angle in the order 90, 180, 270. Pages are
/// sorted and deduplicated; non-positive pages and angles that are not a
/// quarter turn are dropped.
pub(crate) fn rotation_buckets(rotations: &[PageRotation]) -> Vec<(i64, Vec<i64>)> {
    ROTATION_ANGLES
        .iter()
        .filter_map(|&angle| {
            let mut pages: Vec<i64> = rotations
                .iter()
                .filter(|rotation| rotation.page_number > 0)
                .filter(|rotation| rotation.degrees.rem_euclid(360) == angle)
                .map(|rotation| rotation.page_number)
                .collect();
            pages.sort_unstable();
            pages.dedup();
            (!pages.is_empty()).then_some((angle, pages))
        })
        .collect()
}

fn parse_rotations(raw: Option<&str>) -> Result<Vec<PageRotation>, AppError> {
    match raw {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|_| AppError::BadRequest("invalid rotations".to_string())),
    }
}

pub(super) async fn organize(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let order = form.require_text("order")?;
    let buckets = rotation_buckets(&parse_rotations(form.text("rotations"))?);

    let op = Operation::with_input("organize", &state, part, INPUT_PDF).await?;
    tokio::fs::copy(op.path(INPUT_PDF), op.path(WORK_PDF))
        .await
        .map_err(op.fail("failed to prepare work file"))?;

    // Rotations address original page numbers, so they run before reordering.
    // Angles are clockwise, the same convention as the rotate route.
    for (angle, pages) in buckets {
        let list = pages
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        op.run(
            Invocation::new("pdfcpu")
                .args(["rotate", "-pages", list.as_str(), WORK_PDF])
                .arg(angle.to_string()),
            "failed to rotate pages",
        )
        .await?;
    }

    op.run(
        Invocation::new("pdfcpu").args(["collect", "-pages", order, WORK_PDF, OUTPUT_PDF]),
        "failed to organize PDF",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

pub(super) async fn rotate(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let degrees = form.int_or("degrees", 90);
    if !ROTATION_ANGLES.contains(&degrees) {
        return Err(AppError::BadRequest(
            "degrees must be 90, 180, or 270".to_string(),
        ));
    }

    let op = Operation::with_input("rotate", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("pdfcpu")
            .args(["rotate", INPUT_PDF])
            .arg(degrees.to_string())
            .arg(OUTPUT_PDF),
        "failed to rotate PDF",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

pub(super) async fn crop(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let description = form.require_text("description")?;
    let unit = form.text_or("unit", "po");

    let op = Operation::with_input("crop", &state, part, INPUT_PDF).await?;
    op.run(
        Invocation::new("pdfcpu").args(["crop", "-u", unit, "--", description, INPUT_PDF, OUTPUT_PDF]),
        "failed to crop PDF",
    )
    .await?;
    op.respond(&ctx, OUTPUT_PDF)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{post_form, produced, PDF};
    use super::*;
    use crate::server::testing::test_state;
    use crate::tools::testing::{failed, ok, touch, FakeRunner};

    fn rotation(page_number: i64, degrees: i64) -> PageRotation {
        PageRotation { page_number, degrees }
    }

    /// Creates whatever pdfcpu would write so that responses resolve.
    fn pdfcpu_fake() -> std::sync::Arc<FakeRunner> {
        FakeRunner::new(|dir, invocation| {
            let args = &invocation.args;
            match args.first().map(String::as_str) {
                Some("merge") => touch(dir, &args[1]),
                Some("extract") => {
                    touch(dir, "pages/input_page_1.pdf");
                    touch(dir, "pages/input_page_2.pdf");
                }
                _ => {
                    if let Some(last) = args.last() {
                        if last.ends_with(".pdf") {
                            touch(dir, last);
                        }
                    }
                }
            }
            ok("")
        })
    }

    #[test]
    fn rotation_buckets_normalize_and_order_angles() {
        let buckets = rotation_buckets(&[
            rotation(4, -90),
            rotation(2, 90),
            rotation(1, 450),
            rotation(3, 180),
            rotation(0, 90),
            rotation(5, 45),
            rotation(6, 360),
            rotation(2, 90),
        ]);
        assert_eq!(buckets, vec![(90, vec![1, 2]), (180, vec![3]), (270, vec![4])]);
        assert!(rotation_buckets(&[]).is_empty());
    }

    #[tokio::test]
    async fn organize_rotates_original_pages_before_collecting() {
        let temp = tempfile::tempdir().unwrap();
        let runner = pdfcpu_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/pdf/organize",
            &[
                ("file", Some("deck.pdf"), PDF),
                ("order", None, b"3,1,2"),
                ("rotations", None, br#"[{"pageNumber":1,"degrees":90}]"#),
            ],
        )
        .await;
        assert_eq!(status, 200, "{json}");

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, ["rotate", "-pages", "1", "work.pdf", "90"]);
        assert_eq!(calls[1].args, ["collect", "-pages", "3,1,2", "work.pdf", "output.pdf"]);

        let (_, file, path) = produced(temp.path(), &json);
        assert_eq!(file, "output.pdf");
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn organize_passes_clockwise_angles_like_rotate() {
        let temp = tempfile::tempdir().unwrap();
        let runner = pdfcpu_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/pdf/organize",
            &[
                ("file", Some("deck.pdf"), PDF),
                ("order", None, b"1,2"),
                ("rotations", None, br#"[{"pageNumber":2,"degrees":-90}]"#),
            ],
        )
        .await;
        assert_eq!(status, 200, "{json}");
        assert_eq!(runner.calls()[0].args, ["rotate", "-pages", "2", "work.pdf", "270"]);

        let (status, json) = post_form(
            &state,
            "/pdf/rotate",
            &[("file", Some("deck.pdf"), PDF), ("degrees", None, b"270")],
        )
        .await;
        assert_eq!(status, 200, "{json}");
        assert_eq!(
            runner.calls().last().unwrap().args,
            ["rotate", "input.pdf", "270", "output.pdf"]
        );
        assert!(path.with_file_name("work.pdf").is_file());
    }

    #[tokio::test]
    async fn organize_rejects_bad_rotations_before_allocating() {
        let temp = tempfile::tempdir().unwrap();
        let runner = pdfcpu_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/api/pdf/organize",
            &[
                ("file", Some("deck.pdf"), PDF),
                ("order", None, b"1"),
                ("rotations", None, b"{not json"),
            ],
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(json["error"], "invalid rotations");
        assert!(runner.calls().is_empty());
        assert_eq!(std::fs::read_dir(temp.path()).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn rotate_rejects_non_quarter_turns() {
        let temp = tempfile::tempdir().unwrap();
        let runner = pdfcpu_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/pdf/rotate",
            &[("file", Some("a.pdf"), PDF), ("degrees", None, b"45")],
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(json["error"], "degrees must be 90, 180, or 270");

        let (status, _) = post_form(
            &state,
            "/pdf/rotate",
            &[("file", Some("a.pdf"), PDF), ("degrees", None, b"270")],
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(runner.calls()[0].args, ["rotate", "input.pdf", "270", "output.pdf"]);
    }

    #[tokio::test]
    async fn merge_keeps_upload_order_and_output_name() {
        let temp = tempfile::tempdir().unwrap();
        let runner = pdfcpu_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/pdf/merge",
            &[
                ("files", Some("b.pdf"), PDF),
                ("files", Some("a.pdf"), PDF),
                ("outputFilename", None, b"bundle"),
            ],
        )
        .await;
        assert_eq!(status, 200, "{json}");
        assert_eq!(
            runner.calls()[0].args,
            ["merge", "bundle.pdf", "input_0.pdf", "input_1.pdf"]
        );
        assert_eq!(produced(temp.path(), &json).1, "bundle.pdf");

        let (status, json) = post_form(&state, "/pdf/merge", &[("outputFilename", None, b"x")]).await;
        assert_eq!(status, 400);
        assert_eq!(json["error"], "no files provided");
    }

    #[tokio::test]
    async fn split_zips_extracted_pages() {
        let temp = tempfile::tempdir().unwrap();
        let runner = pdfcpu_fake();
        let state = test_state(temp.path(), runner.clone());

        let (status, json) = post_form(
            &state,
            "/pdf/split",
            &[
                ("file", Some("Quarterly Report.pdf"), PDF),
                ("mode", None, b"ranges"),
                ("ranges", None, b"1-2"),
            ],
        )
        .await;
        assert_eq!(status, 200, "{json}");
        assert_eq!(
            runner.calls()[0].args,
            ["extract", "-mode", "page", "-pages", "1-2", "input.pdf", "pages"]
        );
        let (_, file, path) = produced(temp.path(), &json);
        assert_eq!(file, "Quarterly Report_split_pages.zip");
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn tool_failure_is_reported_with_context() {
        let temp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|_, _| failed(1, "pdfcpu: invalid page selection"));
        let state = test_state(temp.path(), runner);

        let (status, json) = post_form(
            &state,
            "/pdf/remove-pages",
            &[("file", Some("a.pdf"), PDF), ("pages", None, b"9-")],
        )
        .await;
        assert_eq!(status, 500);
        let error = json["error"].as_str().unwrap();
        assert!(error.starts_with("failed to remove pages: pdfcpu failed"), "{error}");
        assert!(error.contains("invalid page selection"));
    }

    #[tokio::test]
    async fn missing_required_fields_are_bad_requests() {
        let temp = tempfile::tempdir().unwrap();
        let state = test_state(temp.path(), pdfcpu_fake());

        let cases: [(&str, &[(&str, Option<&str>, &[u8])], &str); 4] = [
            ("/pdf/rotate", &[("degrees", None, b"90")], "file is required"),
            ("/pdf/remove-pages", &[("file", Some("a.pdf"), PDF)], "pages is required"),
            ("/pdf/organize", &[("file", Some("a.pdf"), PDF)], "order is required"),
            ("/pdf/crop", &[("file", Some("a.pdf"), PDF)], "description is required"),
        ];
        for (uri, parts, message) in cases {
            let (status, json) = post_form(&state, uri, parts).await;
            assert_eq!(status, 400, "{uri}");
            assert_eq!(json["error"], message, "{uri}");
        }
    }
}
