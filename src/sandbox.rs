//! Isolated execution of consumer payloads.
//!
//! The dispatcher only talks to the [`Sandbox`] trait; [`docker::DockerSandbox`]
//! is the container-engine backend used in production.

pub mod docker;
pub mod output;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::IMAGE_EXTENSIONS;
use crate::error::JobError;
use crate::job::JobId;
use crate::workspace::WorkArea;

/// What a finished run left behind. Only produced for runs that exited
/// successfully; failures come back as [`JobError`] with their logs.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Primary textual result: the well-known output file when present,
    /// trimmed stdout otherwise.
    pub output: String,
    /// Candidate uploads, sorted by file name.
    pub artifacts: Vec<Artifact>,
    /// Files in the output directory that are not upload candidates.
    pub ignored_files: Vec<String>,
    /// Whether the run actually had hardware acceleration.
    pub accelerated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    /// Lowercase extension without the dot.
    pub extension: String,
}

impl Artifact {
    pub fn mime_type(&self) -> &'static str {
        match self.extension.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            _ => "application/octet-stream",
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Runs consumer source code in the pre-built sandbox image, with
    /// `area.output_dir()` mounted as `/results`.
    async fn run_script(
        &self,
        job_id: JobId,
        code: &str,
        area: &WorkArea,
    ) -> Result<ExecutionOutcome, JobError>;

    /// Pulls and runs a consumer image with `area.output_dir()` mounted as
    /// `/output`.
    async fn run_image(
        &self,
        job_id: JobId,
        image: &str,
        args: &[String],
        area: &WorkArea,
    ) -> Result<ExecutionOutcome, JobError>;
}

/// Well-known files a script may write its result to, in priority order.
pub fn script_output_files(job_id: JobId) -> [String; 2] {
    [format!("job_{job_id}_output.txt"), "output.txt".to_string()]
}

/// Picks the script's result: its output file if it wrote a non-empty one,
/// otherwise trimmed stdout. At most `limit` bytes of the file are kept.
pub async fn read_script_output(job_id: JobId, output_dir: &Path, stdout: &str, limit: usize) -> String {
    for name in script_output_files(job_id) {
        match read_output_file(&output_dir.join(&name), limit).await {
            Ok(Some(contents)) if !contents.trim().is_empty() => {
                debug!(job_id, file = %name, "using script output file");
                return contents;
            }
            Ok(_) => continue,
            Err(e) => warn!(job_id, file = %name, "could not read script output file: {e}"),
        }
    }
    stdout.trim().to_string()
}

/// Reads a regular file the container wrote. Links are refused since they
/// would resolve against the host filesystem.
async fn read_output_file(path: &Path, limit: usize) -> io::Result<Option<String>> {
    let linked = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !linked.file_type().is_file() {
        warn!(path = %path.display(), "ignoring output file that is not a regular file");
        return Ok(None);
    }

    let file = fs::File::open(path).await?;
    let opened = file.metadata().await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if (opened.dev(), opened.ino()) != (linked.dev(), linked.ino()) {
            warn!(path = %path.display(), "output file was replaced while opening, ignoring");
            return Ok(None);
        }
    }

    let mut kept = Vec::new();
    file.take(limit as u64).read_to_end(&mut kept).await?;
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    let dropped = opened.len().saturating_sub(kept.len() as u64);
    if dropped > 0 {
        text.push_str(&output::truncation_marker(dropped));
    }
    Ok(Some(text))
}

/// Non-recursive scan for image files smaller than `max_bytes`.
///
/// Returns the candidates sorted by name plus the names of everything else.
pub async fn scan_artifacts(dir: &Path, max_bytes: u64) -> io::Result<(Vec<Artifact>, Vec<String>)> {
    let mut artifacts = Vec::new();
    let mut ignored = Vec::new();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((artifacts, ignored)),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            ignored.push(file_name);
            continue;
        }

        let extension = Path::new(&file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !IMAGE_EXTENSIONS.contains(&extension.as_str()) || metadata.len() >= max_bytes {
            ignored.push(file_name);
            continue;
        }

        artifacts.push(Artifact {
            path: entry.path(),
            file_name,
            size: metadata.len(),
            extension,
        });
    }

    artifacts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    ignored.sort();
    Ok((artifacts, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    #[tokio::test]
    async fn output_file_wins_over_stdout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job_42_output.txt"), "from file").unwrap();

        assert_eq!(read_script_output(42, dir.path(), "  from stdout \n", LIMIT).await, "from file");
        assert_eq!(read_script_output(43, dir.path(), "  from stdout \n", LIMIT).await, "from stdout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn linked_output_file_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let host_file = dir.path().join("host-only.txt");
        std::fs::write(&host_file, "HOST-ONLY-SECRET").unwrap();
        let out = dir.path().join("results");
        std::fs::create_dir(&out).unwrap();
        std::os::unix::fs::symlink(&host_file, out.join("output.txt")).unwrap();
        std::os::unix::fs::symlink(&host_file, out.join("job_1_output.txt")).unwrap();

        assert_eq!(read_script_output(1, &out, "stdout", LIMIT).await, "stdout");
    }

    #[tokio::test]
    async fn oversized_output_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("output.txt"), "x".repeat(5000)).unwrap();

        let output = read_script_output(1, dir.path(), "stdout", 100).await;

        assert!(output.starts_with(&"x".repeat(100)));
        assert!(!output.starts_with(&"x".repeat(101)));
        assert!(output.ends_with("[... 4900 bytes truncated]"));
    }

    #[tokio::test]
    async fn generic_output_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("output.txt"), "generic").unwrap();
        assert_eq!(read_script_output(5, dir.path(), "ignored", LIMIT).await, "generic");
    }

    #[tokio::test]
    async fn empty_output_file_falls_back_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job_1_output.txt"), "\n").unwrap();
        assert_eq!(read_script_output(1, dir.path(), "RESULT:17\n", LIMIT).await, "RESULT:17");
    }

    #[tokio::test]
    async fn scan_keeps_small_images_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.PNG"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a.webp"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("huge.jpg"), vec![0u8; 2048]).unwrap();
        std::fs::write(dir.path().join("edge.gif"), vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("data.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();
        std::fs::write(dir.path().join("nested.png/inner.png"), vec![0u8; 10]).unwrap();

        let (artifacts, ignored) = scan_artifacts(dir.path(), 1024).await.unwrap();

        let names: Vec<_> = artifacts.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, ["a.webp", "b.PNG"]);
        assert_eq!(artifacts[1].extension, "png");
        assert_eq!(artifacts[1].mime_type(), "image/png");
        assert_eq!(artifacts[0].size, 10);
        assert_eq!(ignored, ["data.json", "edge.gif", "huge.jpg", "nested.png"]);
    }

    #[tokio::test]
    async fn scan_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (artifacts, ignored) = scan_artifacts(&dir.path().join("gone"), 1024).await.unwrap();
        assert!(artifacts.is_empty());
        assert!(ignored.is_empty());
    }
}
