//! ZIP packaging of multi-file tool outputs.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zips every regular file under `source` (recursively, sorted by relative
/// path) into `dest`. Entry names are relative to `source` with `/` separators.
/// Returns the number of entries written.
pub fn zip_directory(source: &Path, dest: &Path) -> Result<usize> {
    let mut files = Vec::new();
    collect_files(source, source, &mut files)?;
    files.sort();

    let out = File::create(dest)
        .with_context(|| format!("failed to create archive {}", dest.display()))?;
    let mut writer = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for relative in &files {
        let entry_name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer
            .start_file(entry_name.as_str(), options)
            .with_context(|| format!("failed to add {entry_name} to archive"))?;
        let mut input = File::open(source.join(relative))
            .with_context(|| format!("failed to open {}", relative.display()))?;
        io::copy(&mut input, &mut writer)
            .with_context(|| format!("failed to compress {entry_name}"))?;
    }

    writer.finish().context("failed to finalize archive")?;
    Ok(files.len())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .context("archive entry outside source directory")?;
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}

/// Async wrapper that runs [`zip_directory`] on the blocking pool and refuses
/// to produce an empty archive.
pub async fn zip_directory_nonempty(source: PathBuf, dest: PathBuf) -> Result<usize> {
    let written = tokio::task::spawn_blocking(move || zip_directory(&source, &dest))
        .await
        .context("archive task aborted")??;
    if written == 0 {
        bail!("no files to archive");
    }
    Ok(written)
}
