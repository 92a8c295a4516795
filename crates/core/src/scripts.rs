//! Python helpers for conversions that have no dedicated command-line tool.
//!
//! The scripts are compiled into the binary and written into the job directory
//! right before use, so a deployment only needs `python3` and the libraries.

use std::path::Path;

use crate::tools::{Invocation, ToolError, ToolOutput, Tools};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperScript {
    PdfToDocx,
    PdfToXlsx,
    PdfToPptx,
}

impl HelperScript {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::PdfToDocx => "pdf_to_docx.py",
            Self::PdfToXlsx => "pdf_to_xlsx.py",
            Self::PdfToPptx => "pdf_to_pptx.py",
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            Self::PdfToDocx => include_str!("../scripts/pdf_to_docx.py"),
            Self::PdfToXlsx => include_str!("../scripts/pdf_to_xlsx.py"),
            Self::PdfToPptx => include_str!("../scripts/pdf_to_pptx.py"),
        }
    }

    /// Writes the script into `dir` and runs `python3 <script> <input> <output>`.
    pub async fn run(
        self,
        tools: &Tools,
        dir: &Path,
        input: &str,
        output: &str,
    ) -> Result<ToolOutput, ToolError> {
        let path = dir.join(self.file_name());
        tokio::fs::write(&path, self.source())
            .await
            .map_err(|source| ToolError::Workspace {
                path: path.clone(),
                source,
            })?;

        tools
            .run(
                dir,
                Invocation::new("python3").args([self.file_name(), input, output]),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{ok, FakeRunner};

    #[test]
    fn every_script_takes_input_and_output_arguments() {
        for script in [
            HelperScript::PdfToDocx,
            HelperScript::PdfToXlsx,
            HelperScript::PdfToPptx,
        ] {
            let source = script.source();
            assert!(source.starts_with("#!/usr/bin/env python3"), "{}", script.file_name());
            assert!(source.contains("sys.argv[2]"), "{}", script.file_name());
        }
    }

    #[tokio::test]
    async fn run_writes_script_before_invoking_python() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new(|dir, invocation| {
            assert!(dir.join(&invocation.args[0]).is_file(), "script exists when python runs");
            ok("")
        });
        let tools = Tools::new(runner.clone());

        HelperScript::PdfToXlsx
            .run(&tools, temp.path(), "input.pdf", "report.xlsx")
            .await
            .expect("script run");

        let calls = runner.calls();
        assert_eq!(calls[0].program, "python3");
        assert_eq!(calls[0].args, ["pdf_to_xlsx.py", "input.pdf", "report.xlsx"]);
    }
}
