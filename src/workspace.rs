use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::JobId;

const SCRIPT_FILE: &str = "job.py";

/// On-disk layout for job scratch space:
///
/// ```text
/// <root>/jobs/job-<id>-<nonce>/job.py     materialised script, mounted read-only
/// <root>/results/job-<id>-<nonce>/        output mount, read-write
/// ```
///
/// Every invocation gets its own nonce, so a resubmitted job id never reuses
/// a directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    jobs_dir: PathBuf,
    results_dir: PathBuf,
}

impl Workspace {
    pub fn new(root: &Path) -> Self {
        Self {
            jobs_dir: root.join("jobs"),
            results_dir: root.join("results"),
        }
    }

    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.jobs_dir).await?;
        fs::create_dir_all(&self.results_dir).await
    }

    pub async fn allocate(&self, job_id: JobId) -> io::Result<WorkArea> {
        self.prepare().await?;
        let nonce = Uuid::new_v4().simple().to_string();
        let name = format!("job-{job_id}-{}", &nonce[..12]);

        let area = WorkArea {
            job_id,
            scratch_dir: self.jobs_dir.join(&name),
            output_dir: self.results_dir.join(&name),
            name,
            released: false,
        };
        fs::create_dir(&area.scratch_dir).await?;
        fs::create_dir(&area.output_dir).await?;
        debug!(job_id, area = %area.name, "allocated work area");

        Ok(area)
    }

    /// Removes work areas older than `ttl`. These only exist when a previous
    /// process died mid-job, since live areas are released before the
    /// response goes out.
    pub async fn sweep_stale(&self, ttl: Duration) -> io::Result<usize> {
        let mut removed = 0;
        for dir in [&self.jobs_dir, &self.results_dir] {
            let mut entries = match fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_name().to_string_lossy().starts_with("job-") {
                    continue;
                }
                let modified = entry.metadata().await?.modified()?;
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO);
                if age >= ttl {
                    remove_dir(&entry.path()).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "evicted stale work areas");
        }
        Ok(removed)
    }
}

/// Scratch space owned by exactly one in-flight job.
///
/// Call [`WorkArea::release`] when done. If the area is dropped without
/// being released (panic, cancelled future) it is removed synchronously.
#[derive(Debug)]
pub struct WorkArea {
    job_id: JobId,
    name: String,
    scratch_dir: PathBuf,
    output_dir: PathBuf,
    released: bool,
}

impl WorkArea {
    /// Unique per invocation, usable as a container name suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn script_path(&self) -> PathBuf {
        self.scratch_dir.join(SCRIPT_FILE)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        let scratch = remove_dir(&self.scratch_dir).await;
        let output = remove_dir(&self.output_dir).await;
        debug!(job_id = self.job_id, area = %self.name, "released work area");
        scratch.and(output)
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        for dir in [&self.scratch_dir, &self.output_dir] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(job_id = self.job_id, dir = %dir.display(), "failed to remove work area: {e}");
                }
            }
        }
    }
}

async fn remove_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resubmitted_job_gets_a_fresh_area() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path());

        let first = workspace.allocate(1).await.unwrap();
        let second = workspace.allocate(1).await.unwrap();

        assert_ne!(first.name(), second.name());
        assert_ne!(first.output_dir(), second.output_dir());
        assert!(first.name().starts_with("job-1-"));
        assert!(first.scratch_dir().is_dir());
        assert!(second.output_dir().is_dir());
    }

    #[tokio::test]
    async fn release_removes_everything() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let area = workspace.allocate(3).await.unwrap();
        std::fs::write(area.script_path(), "print(1)").unwrap();
        std::fs::write(area.output_dir().join("out.png"), b"png").unwrap();
        let (scratch, output) = (area.scratch_dir().to_path_buf(), area.output_dir().to_path_buf());

        area.release().await.unwrap();

        assert!(!scratch.exists());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn dropping_an_unreleased_area_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let area = workspace.allocate(4).await.unwrap();
        let output = area.output_dir().to_path_buf();
        std::fs::write(output.join("partial.txt"), "x").unwrap();

        drop(area);

        assert!(!output.exists());
    }

    #[tokio::test]
    async fn sweep_evicts_only_old_job_dirs() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        workspace.prepare().await.unwrap();
        std::fs::create_dir(root.path().join("results/job-9-abandoned")).unwrap();
        std::fs::create_dir(root.path().join("results/keep-me")).unwrap();

        assert_eq!(workspace.sweep_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(workspace.sweep_stale(Duration::ZERO).await.unwrap(), 1);
        assert!(!root.path().join("results/job-9-abandoned").exists());
        assert!(root.path().join("results/keep-me").exists());
    }

    #[tokio::test]
    async fn sweep_tolerates_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(&root.path().join("never-created"));
        assert_eq!(workspace.sweep_stale(Duration::ZERO).await.unwrap(), 0);
    }
}
