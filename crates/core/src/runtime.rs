use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

/// External binaries the operation handlers shell out to.
pub const REQUIRED_TOOLS: &[&str] = &[
    "pdfcpu",
    "qpdf",
    "gs",
    "libreoffice",
    "pdftoppm",
    "pdfinfo",
    "pdftotext",
    "pdfimages",
    "pdftohtml",
    "convert",
    "identify",
    "ocrmypdf",
    "wkhtmltopdf",
    "python3",
    "diff",
];

/// Directories probed for binaries, in priority order:
///   1. configured extra directories
///   2. `<exe_dir>/`, `<exe_dir>/bin/`, `<exe_dir>/../bin/`
///   3. `<cwd>/`, `<cwd>/bin/`
fn candidate_bin_dirs(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = extra.to_vec();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn find_binary_on_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Builds a command for `binary`, preferring bundled copies over PATH lookup.
pub fn command_for(binary: &str, extra_dirs: &[PathBuf]) -> ProcessCommand {
    if Path::new(binary).components().count() > 1 {
        return ProcessCommand::new(binary);
    }
    if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs(extra_dirs)) {
        return ProcessCommand::new(path);
    }
    ProcessCommand::new(binary)
}

pub fn resolve_binary(binary: &str, extra_dirs: &[PathBuf]) -> Option<PathBuf> {
    find_binary_in_dirs(binary, &candidate_bin_dirs(extra_dirs))
        .or_else(|| find_binary_on_path(binary))
}

/// Log which external tools were resolved, for diagnostics.
/// Missing tools only fail the operations that need them.
pub fn log_tool_status(extra_dirs: &[PathBuf]) {
    let mut missing = Vec::new();
    for tool in REQUIRED_TOOLS {
        match resolve_binary(tool, extra_dirs) {
            Some(path) => info!(tool, path = %path.display(), "external tool resolved"),
            None => missing.push(*tool),
        }
    }
    if !missing.is_empty() {
        warn!(
            missing = %missing.join(", "),
            "some external tools were not found; operations using them will fail"
        );
    }
}
