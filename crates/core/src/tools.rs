//! External command-line tool invocation.
//!
//! Handlers describe a command as an [`Invocation`] whose file arguments are
//! relative to the job directory. A [`ToolRunner`] executes it with the job
//! directory as working directory; [`Tools`] moves that blocking work onto the
//! blocking pool.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::logging::{redact_sensitive_text, TOOL_OUTPUT_TARGET};
use crate::runtime::command_for;

const TOOL_OUTPUT_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed ({}): {}", exit_label(*.code), excerpt(.output))]
    Failed {
        program: String,
        code: Option<i32>,
        output: String,
    },
    #[error("could not read {what} from {program} output")]
    Unparsable { program: String, what: &'static str },
    #[error("expected output not found (looked for {})", .candidates.join(", "))]
    OutputNotFound { candidates: Vec<String> },
    #[error("failed to prepare {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tool task aborted: {0}")]
    Aborted(String),
}

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "terminated by signal".to_string(), |c| format!("exit status {c}"))
}

fn excerpt(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.chars().count() <= TOOL_OUTPUT_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(TOOL_OUTPUT_EXCERPT_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

/// A program plus arguments, executed inside a job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Argument positions that must not appear in logs or error messages.
    secret_args: Vec<usize>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for (index, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&index) {
                write!(f, " {}", crate::logging::REDACTION_PLACEHOLDER)?;
            } else {
                write!(f, " {}", redact_sensitive_text(arg))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub success: bool,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stdout followed by stderr.
    pub combined: String,
}

/// Executes an [`Invocation`] with `dir` as working directory. Blocking.
pub trait ToolRunner: Send + Sync {
    fn run(&self, dir: &Path, invocation: &Invocation) -> Result<ToolOutput, ToolError>;
}

/// Spawns real processes, resolving binaries through [`command_for`].
#[derive(Debug, Clone, Default)]
pub struct SystemToolRunner {
    search_dirs: Vec<PathBuf>,
}

impl SystemToolRunner {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }
}

impl ToolRunner for SystemToolRunner {
    fn run(&self, dir: &Path, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        let output = command_for(&invocation.program, &self.search_dirs)
            .args(&invocation.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ToolError::Launch {
                program: invocation.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut combined = stdout.clone();
        combined.push_str(&stderr);

        Ok(ToolOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout,
            combined,
        })
    }
}

/// Async front for a shared [`ToolRunner`].
#[derive(Clone)]
pub struct Tools {
    runner: Arc<dyn ToolRunner>,
}

impl fmt::Debug for Tools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tools").finish_non_exhaustive()
    }
}

impl Tools {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }

    pub fn system(search_dirs: Vec<PathBuf>) -> Self {
        Self::new(Arc::new(SystemToolRunner::new(search_dirs)))
    }

    /// Runs the invocation and returns its output whatever the exit status.
    pub async fn run_unchecked(
        &self,
        dir: &Path,
        invocation: Invocation,
    ) -> Result<ToolOutput, ToolError> {
        let runner = Arc::clone(&self.runner);
        let dir = dir.to_path_buf();
        let rendered = invocation.to_string();
        debug!(command = %rendered, "running external tool");

        let output = tokio::task::spawn_blocking(move || runner.run(&dir, &invocation))
            .await
            .map_err(|join| ToolError::Aborted(join.to_string()))??;

        if !output.combined.trim().is_empty() {
            debug!(
                target: TOOL_OUTPUT_TARGET,
                command = %rendered,
                "{}",
                redact_sensitive_text(output.combined.trim_end())
            );
        }
        Ok(output)
    }

    /// Runs the invocation; a nonzero exit becomes [`ToolError::Failed`].
    pub async fn run(&self, dir: &Path, invocation: Invocation) -> Result<ToolOutput, ToolError> {
        let program = invocation.program.clone();
        let output = self.run_unchecked(dir, invocation).await?;
        if output.success {
            Ok(output)
        } else {
            Err(ToolError::Failed {
                program,
                code: output.code,
                output: redact_sensitive_text(&output.combined),
            })
        }
    }
}

/// Reads the page count from `pdfinfo`/`pdfcpu info` style output: the last
/// token of the first parsable line whose trimmed form starts with `Pages:`.
pub fn parse_page_count(output: &str) -> Option<u32> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Pages:"))
        .find_map(|line| {
            line.split_whitespace()
                .last()
                .and_then(|token| token.parse::<u32>().ok())
                .filter(|count| *count > 0)
        })
}

pub const LETTER_PAGE_SIZE: (f64, f64) = (612.0, 792.0);

/// Parses `Page size: 595.276 x 841.89 pts (A4)` from `pdfinfo`, defaulting to Letter.
pub fn parse_page_size(output: &str) -> (f64, f64) {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("Page size:"))
        .and_then(|rest| {
            let mut tokens = rest.split_whitespace();
            let width = tokens.next()?.parse::<f64>().ok()?;
            (tokens.next()? == "x").then_some(())?;
            let height = tokens.next()?.parse::<f64>().ok()?;
            (width > 0.0 && height > 0.0).then_some((width, height))
        })
        .unwrap_or(LETTER_PAGE_SIZE)
}

/// Page count of `file` (relative to `dir`): poppler first, pdfcpu as fallback.
pub async fn page_count(tools: &Tools, dir: &Path, file: &str) -> Result<u32, ToolError> {
    let poppler = tools.run(dir, Invocation::new("pdfinfo").arg(file)).await;
    match poppler {
        Ok(output) => {
            if let Some(count) = parse_page_count(&output.stdout) {
                return Ok(count);
            }
        }
        Err(error) => debug!(error = %error, "pdfinfo failed; falling back to pdfcpu info"),
    }

    let output = tools
        .run(dir, Invocation::new("pdfcpu").args(["info", file]))
        .await?;
    parse_page_count(&output.combined).ok_or_else(|| ToolError::Unparsable {
        program: "pdfcpu".to_string(),
        what: "page count",
    })
}

/// First candidate (relative to `dir`) that exists as a file.
pub fn resolve_output(dir: &Path, candidates: &[String]) -> Result<String, ToolError> {
    candidates
        .iter()
        .find(|name| dir.join(name.as_str()).is_file())
        .cloned()
        .ok_or_else(|| ToolError::OutputNotFound {
            candidates: candidates.to_vec(),
        })
}

/// Checks that a tool produced `name` inside `dir`.
pub fn expect_output(dir: &Path, name: &str) -> Result<(), ToolError> {
    resolve_output(dir, &[name.to_string()]).map(|_| ())
}
