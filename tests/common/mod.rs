#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gpu_worker::config::{StorageConfig, WorkerConfig};
use gpu_worker::dispatcher::{Capabilities, Dispatcher};
use gpu_worker::error::JobError;
use gpu_worker::job::{JobId, ProcessJobRequest};
use gpu_worker::sandbox::{scan_artifacts, ExecutionOutcome, Sandbox};
use gpu_worker::storage::PinataStore;
use gpu_worker::workspace::WorkArea;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Script output echoes the source; images print a fixed line.
    Succeed,
    /// Prints `RESULT:17` then exits non-zero.
    FailWithPartialOutput,
    /// Leaves a file behind, then hits the wall-clock ceiling.
    TimeOut,
    /// Writes `out.png` and `notes.txt` into the output mount.
    RenderPng,
}

/// Stands in for the container runtime and records what it was asked to do.
pub struct FakeSandbox {
    behavior: Behavior,
    calls: AtomicUsize,
    images: Mutex<Vec<String>>,
    areas: Mutex<Vec<PathBuf>>,
}

impl FakeSandbox {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            images: Mutex::new(Vec::new()),
            areas: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }

    /// Scratch and output directories of every run, in call order.
    pub fn areas(&self) -> Vec<PathBuf> {
        self.areas.lock().unwrap().clone()
    }

    async fn record(&self, area: &WorkArea) -> Result<(), JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut areas = self.areas.lock().unwrap();
        areas.push(area.scratch_dir().to_path_buf());
        areas.push(area.output_dir().to_path_buf());
        Ok(())
    }

    async fn common(&self, area: &WorkArea, stdout: &str) -> Result<ExecutionOutcome, JobError> {
        match self.behavior {
            Behavior::Succeed => Ok(ExecutionOutcome {
                stdout: stdout.to_string(),
                output: stdout.trim().to_string(),
                ..Default::default()
            }),
            Behavior::FailWithPartialOutput => Err(JobError::ScriptExecutionFailed {
                detail: "exit status: 1".into(),
                logs: "RESULT:17\n".into(),
            }),
            Behavior::TimeOut => {
                tokio::fs::write(area.output_dir().join("partial.txt"), "half done").await?;
                Err(JobError::TimedOut {
                    limit: Duration::from_secs(1),
                    logs: "still working".into(),
                })
            }
            Behavior::RenderPng => {
                tokio::fs::write(area.output_dir().join("out.png"), b"fake png").await?;
                tokio::fs::write(area.output_dir().join("notes.txt"), "notes").await?;
                let (artifacts, ignored_files) =
                    scan_artifacts(area.output_dir(), 5 * 1024 * 1024).await?;
                Ok(ExecutionOutcome {
                    stdout: "rendered 1 image\n".into(),
                    output: "rendered 1 image".into(),
                    artifacts,
                    ignored_files,
                    ..Default::default()
                })
            }
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn run_script(
        &self,
        _job_id: JobId,
        code: &str,
        area: &WorkArea,
    ) -> Result<ExecutionOutcome, JobError> {
        self.record(area).await?;
        self.common(area, &format!("{code}\n")).await
    }

    async fn run_image(
        &self,
        _job_id: JobId,
        image: &str,
        _args: &[String],
        area: &WorkArea,
    ) -> Result<ExecutionOutcome, JobError> {
        self.record(area).await?;
        self.images.lock().unwrap().push(image.to_string());
        self.common(area, "image done\n").await
    }
}

pub fn config(root: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::with_work_dir(root);
    config.docker_binary = "/nonexistent/docker".into();
    config
}

pub fn dispatcher(
    root: &Path,
    sandbox: Arc<FakeSandbox>,
    storage: StorageConfig,
) -> Arc<Dispatcher> {
    let store = PinataStore::new(&storage);
    Arc::new(Dispatcher::new(
        config(root),
        sandbox,
        Arc::new(store),
        Capabilities {
            docker_available: true,
            gpu_available: false,
        },
    ))
}

pub fn unconfigured_storage() -> StorageConfig {
    StorageConfig {
        jwt: None,
        api_url: "http://127.0.0.1:9".into(),
        gateway_url: "http://127.0.0.1:9/ipfs".into(),
    }
}

pub fn storage_at(url: &str) -> StorageConfig {
    StorageConfig {
        jwt: Some("test-jwt".into()),
        api_url: url.to_string(),
        gateway_url: format!("{url}/ipfs"),
    }
}

pub fn script(job_id: JobId, code: &str) -> ProcessJobRequest {
    request(job_id, "python-script", json!({ "code": code }))
}

pub fn image(job_id: JobId, image: &str) -> ProcessJobRequest {
    request(job_id, "docker-image", json!({ "image": image }))
}

pub fn request(job_id: JobId, job_type: &str, job_data: Value) -> ProcessJobRequest {
    ProcessJobRequest {
        job_id,
        job_type: job_type.to_string(),
        job_data,
    }
}

/// Names of everything left under `<root>/jobs` and `<root>/results`.
pub fn leftovers(root: &Path) -> Vec<String> {
    ["jobs", "results"]
        .iter()
        .flat_map(|dir| std::fs::read_dir(root.join(dir)).into_iter().flatten())
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect()
}
