//! Read-only inspections that produce a text report.

use std::fmt::Write as _;

use axum::extract::State;

use super::{OpResult, Operation, INPUT_PDF};
use crate::server::{AppState, RequestContext};
use crate::tools::{Invocation, ToolError, ToolOutput};
use crate::upload::{base_name_without_ext, UploadForm};

const DIFF_OUTPUT: &str = "differences.txt";
const NO_DIFFERENCES: &str = "No differences found between the two PDF files.\n";

pub(super) async fn compare(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let first = form.require_file("file1")?;
    let second = form.require_file("file2")?;

    let op = Operation::with_input("compare", &state, first, "file1.pdf").await?;
    op.save(second, "file2.pdf").await?;
    for stem in ["file1", "file2"] {
        op.run(
            Invocation::new("pdftotext").args([format!("{stem}.pdf"), format!("{stem}.txt")]),
            "pdftotext failed",
        )
        .await?;
    }

    // diff exits 1 when the inputs differ.
    let diff = op
        .tools()
        .run_unchecked(op.dir(), Invocation::new("diff").args(["-u", "file1.txt", "file2.txt"]))
        .await
        .map_err(op.fail("diff failed"))?;
    if !matches!(diff.code, Some(0 | 1)) {
        return Err(op.fail("diff failed")(ToolError::Failed {
            program: "diff".to_string(),
            code: diff.code,
            output: diff.combined,
        }));
    }

    let report = if diff.stdout.is_empty() {
        NO_DIFFERENCES.to_string()
    } else {
        diff.stdout
    };
    op.write(DIFF_OUTPUT, report).await?;
    op.respond(&ctx, DIFF_OUTPUT)
}

fn report_section(
    report: &mut String,
    title: &str,
    program: &str,
    result: Result<ToolOutput, ToolError>,
    empty: &str,
) {
    let _ = write!(report, "=== {title} ===\n\n");
    match result {
        Ok(output) => {
            if !output.success {
                let code = output
                    .code
                    .map_or_else(|| "signal".to_string(), |code| code.to_string());
                let _ = writeln!(report, "{program} failed: exit status {code}");
            }
            if output.combined.is_empty() {
                report.push_str(empty);
            } else {
                report.push_str(&output.combined);
            }
        }
        Err(error) => {
            let _ = writeln!(report, "{program} failed: {error}");
        }
    }
}

/// Structure check followed by metadata; tool failures are part of the report.
pub(crate) fn validation_report(
    check: Result<ToolOutput, ToolError>,
    info: Result<ToolOutput, ToolError>,
) -> String {
    let mut report = String::new();
    report_section(
        &mut report,
        "PDF Structure Validation (qpdf --check)",
        "qpdf check",
        check,
        "No issues found.\n",
    );
    report.push('\n');
    report_section(
        &mut report,
        "PDF Metadata (pdfinfo)",
        "pdfinfo",
        info,
        "No metadata available.\n",
    );
    report
}

pub(super) async fn validate_pdfa(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> OpResult {
    let part = form.require_file("file")?;
    let output = format!("{}_validation.txt", base_name_without_ext(&part.file_name));

    let op = Operation::with_input("validate-pdfa", &state, part, INPUT_PDF).await?;
    let check = op
        .tools()
        .run_unchecked(
            op.dir(),
            Invocation::new("qpdf").args(["--check", "--warning-exit-0", INPUT_PDF]),
        )
        .await;
    let info = op
        .tools()
        .run_unchecked(op.dir(), Invocation::new("pdfinfo").arg(INPUT_PDF))
        .await;

    op.write(&output, validation_report(check, info)).await?;
    op.respond(&ctx, &output)
}
