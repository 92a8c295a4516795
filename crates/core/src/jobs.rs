//! Per-job working directories and their retention.
//!
//! Every request that produces artifacts gets a fresh directory under the work
//! root named by a random [`JobId`]. The directory is the only record of a job:
//! its modification time drives retention, and in-memory leases pin it while a
//! handler, download, or background render is still using it.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid file name inside job directory: {0:?}")]
    InvalidName(String),
}

impl JobError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Suffix of a swept job directory awaiting deletion, `.<id>.swept`.
const TOMBSTONE_SUFFIX: &str = ".swept";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Uuid);

impl JobId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Accepts only the canonical hyphenated form so that a URL segment maps to
    /// exactly one directory name.
    pub fn parse(raw: &str) -> Option<Self> {
        let id = Uuid::try_parse(raw).ok()?;
        (id.hyphenated().to_string() == raw).then_some(Self(id))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

#[derive(Debug)]
struct JobStoreInner {
    root: PathBuf,
    retention: Duration,
    sweep_interval: Duration,
    active: DashMap<JobId, usize>,
}

/// Allocates job directories and sweeps expired ones.
#[derive(Debug, Clone)]
pub struct JobStore {
    inner: Arc<JobStoreInner>,
}

/// Pins a job directory against the retention sweeper until dropped.
#[derive(Debug)]
pub struct JobLease {
    id: JobId,
    path: PathBuf,
    store: Arc<JobStoreInner>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<JobId>,
    pub skipped_active: usize,
    pub kept: usize,
}

pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>, retention: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(JobStoreInner {
                root: root.into(),
                retention,
                sweep_interval,
                active: DashMap::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn retention(&self) -> Duration {
        self.inner.retention
    }

    /// Creates a fresh job directory with owner-only permissions.
    pub async fn allocate(&self) -> Result<JobLease, JobError> {
        let id = JobId::random();
        let lease = self.acquire(id);
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&lease.path)
            .await
            .map_err(|source| JobError::io("create job directory", &lease.path, source))?;
        debug!(job = %id, "allocated job directory");
        Ok(lease)
    }

    /// Pins an existing job. Returns `None` when the directory is gone.
    pub fn lease(&self, id: JobId) -> Option<JobLease> {
        let lease = self.acquire(id);
        // The count is taken before the check so a concurrent sweep either
        // already removed the directory or will see the lease and skip it.
        lease.path.is_dir().then_some(lease)
    }

    fn acquire(&self, id: JobId) -> JobLease {
        *self.inner.active.entry(id).or_insert(0) += 1;
        JobLease {
            id,
            path: self.inner.root.join(id.to_string()),
            store: Arc::clone(&self.inner),
        }
    }

    pub fn is_active(&self, id: JobId) -> bool {
        self.inner.active.contains_key(&id)
    }

    /// Removes every unleased job directory older than the retention window.
    /// Blocking; callers on the async runtime go through [`JobStore::sweep`].
    pub fn sweep_at(&self, now: SystemTime) -> Result<SweepReport, JobError> {
        let root = &self.inner.root;
        let mut report = SweepReport::default();

        let entries: Vec<std::fs::DirEntry> = match std::fs::read_dir(root) {
            Ok(entries) => entries
                .collect::<Result<_, _>>()
                .map_err(|source| JobError::io("list work directory", root, source))?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(source) => return Err(JobError::io("list work directory", root, source)),
        };

        for entry in entries {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if is_tombstone(name) {
                // Left behind by an interrupted sweep.
                remove_tombstone(&entry.path());
                continue;
            }
            let Some(id) = JobId::parse(name) else {
                continue;
            };
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= self.inner.retention {
                report.kept += 1;
                continue;
            }

            // The vacant slot blocks new leases only for the rename; the
            // tombstone is deleted after the shard lock is released.
            let tombstone = root.join(format!(".{id}{TOMBSTONE_SUFFIX}"));
            match self.inner.active.entry(id) {
                Entry::Occupied(_) => {
                    report.skipped_active += 1;
                    continue;
                }
                Entry::Vacant(_slot) => {
                    if let Err(error) = std::fs::rename(&path, &tombstone) {
                        warn!(job = %id, error = %error, "failed to retire expired job directory");
                        continue;
                    }
                }
            }
            report.removed.push(id);
            remove_tombstone(&tombstone);
        }

        Ok(report)
    }

    pub async fn sweep(&self) -> Result<SweepReport, JobError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.sweep_at(SystemTime::now()))
            .await
            .map_err(|join| JobError::io("sweep work directory", self.root(), io::Error::other(join)))?
    }

    /// Spawns the periodic sweeper. `on_sweep` sees every successful report,
    /// letting other components drop state held for removed jobs.
    pub fn start_sweeper<F>(&self, on_sweep: F) -> SweeperHandle
    where
        F: Fn(&SweepReport) + Send + Sync + 'static,
    {
        let store = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.inner.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First sweep runs one full period after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.sweep().await {
                    Ok(report) => {
                        if !report.removed.is_empty() || report.skipped_active > 0 {
                            info!(
                                removed = report.removed.len(),
                                skipped_active = report.skipped_active,
                                kept = report.kept,
                                "swept expired jobs"
                            );
                        }
                        on_sweep(&report);
                    }
                    Err(error) => warn!(error = %error, "job sweep failed"),
                }
            }
            debug!("job sweeper stopped");
        });

        SweeperHandle { cancel, task }
    }
}

fn is_tombstone(name: &str) -> bool {
    name.strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(TOMBSTONE_SUFFIX))
        .and_then(JobId::parse)
        .is_some()
}

fn remove_tombstone(path: &Path) {
    if let Err(error) = std::fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %error, "failed to remove swept job directory");
    }
}

impl JobLease {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the job directory.
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Clone for JobLease {
    fn clone(&self) -> Self {
        *self.store.active.entry(self.id).or_insert(0) += 1;
        Self {
            id: self.id,
            path: self.path.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if let Some(mut count) = self.store.active.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
        self.store.active.remove_if(&self.id, |_, count| *count == 0);
    }
}

impl SweeperHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            warn!(error = %error, "job sweeper task ended abnormally");
        }
    }
}
