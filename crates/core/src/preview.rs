//! Page preview rendering.
//!
//! Preview images live at `<job>/previews/page-<n>.png`. They are produced
//! either eagerly, by a background task started with the preview request, or
//! lazily, when a client asks for a page that does not exist yet. Both paths go
//! through [`PreviewRenderer::ensure_page`], which serializes work per
//! (job, page) and publishes each image with an atomic rename.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::jobs::{JobId, JobLease};
use crate::tools::{Invocation, ToolError, Tools};

pub const PREVIEW_DIR: &str = "previews";
pub const PREVIEW_SOURCE: &str = "input.pdf";

pub fn page_file_name(page: u32) -> String {
    format!("page-{page}.png")
}

/// Parses `page-<n>.png` with `n >= 1`.
pub fn parse_page_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("page-")?
        .strip_suffix(".png")?
        .parse::<u32>()
        .ok()
        .filter(|page| *page >= 1)
}

#[derive(Debug, Clone)]
pub struct PreviewRenderer {
    tools: Tools,
    dpi: u32,
    locks: Arc<DashMap<(JobId, u32), Arc<Mutex<()>>>>,
}

impl PreviewRenderer {
    pub fn new(tools: Tools, dpi: u32) -> Self {
        Self {
            tools,
            dpi: dpi.clamp(36, 600),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Renders `page` of the job's source PDF unless it already exists.
    /// Returns the path of the published image.
    pub async fn ensure_page(&self, job: &JobLease, page: u32) -> Result<PathBuf, ToolError> {
        let preview_dir = job.join(PREVIEW_DIR);
        let target = preview_dir.join(page_file_name(page));
        if target.is_file() {
            return Ok(target);
        }

        let key = (job.id(), page);
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let rendered = {
            let _guard = lock.lock().await;
            self.render_locked(job, page, target).await
        };

        // Only waiters keep an entry alive; the map plus `lock` make two.
        self.locks.remove_if(&key, |_, entry| {
            Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2
        });
        rendered
    }

    async fn render_locked(
        &self,
        job: &JobLease,
        page: u32,
        target: PathBuf,
    ) -> Result<PathBuf, ToolError> {
        // Another caller may have finished while we waited.
        if target.is_file() {
            return Ok(target);
        }

        let preview_dir = job.join(PREVIEW_DIR);
        tokio::fs::create_dir_all(&preview_dir)
            .await
            .map_err(|source| ToolError::Workspace {
                path: preview_dir.clone(),
                source,
            })?;

        let staging_stem = format!("{PREVIEW_DIR}/.page-{page}.render");
        let page_arg = page.to_string();
        self.tools
            .run(
                job.path(),
                Invocation::new("pdftoppm")
                    .args(["-png", "-r"])
                    .arg(self.dpi.to_string())
                    .args(["-f", page_arg.as_str(), "-l", page_arg.as_str()])
                    .arg("-singlefile")
                    .args([PREVIEW_SOURCE, staging_stem.as_str()]),
            )
            .await?;

        let staged = job.join(format!("{staging_stem}.png"));
        tokio::fs::rename(&staged, &target).await.map_err(|_| {
            ToolError::OutputNotFound {
                candidates: vec![format!("{staging_stem}.png")],
            }
        })?;
        debug!(job = %job.id(), page, "rendered preview page");
        Ok(target)
    }

    /// Renders pages `1..=pages` in order on a detached task that keeps the job leased.
    pub fn spawn_render_all(&self, job: JobLease, pages: u32) {
        let renderer = self.clone();
        tokio::spawn(async move {
            for page in 1..=pages {
                if let Err(error) = renderer.ensure_page(&job, page).await {
                    warn!(job = %job.id(), page, error = %error, "background preview render failed");
                    return;
                }
            }
            info!(job = %job.id(), pages, "background preview render finished");
        });
    }

    /// Drops coalescing state for jobs that no longer exist.
    pub fn forget_jobs(&self, removed: &[JobId]) {
        if removed.is_empty() {
            return;
        }
        self.locks.retain(|(job, _), _| !removed.contains(job));
    }

    pub fn tracked_pages(&self) -> usize {
        self.locks.len()
    }
}

/// Relative URL path of a preview page, as served by `/previews/`.
pub fn preview_path_segments(job: JobId, page: u32) -> [String; 3] {
    [job.to_string(), PREVIEW_DIR.to_string(), page_file_name(page)]
}
