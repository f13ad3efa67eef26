//! Job Dispatcher: one request in, one structured outcome out.
//!
//! The pipeline is linear: validate → execute → extract → optionally upload
//! → finalize the result reference. Jobs run one at a time; the work area is
//! released before the outcome is returned, whatever the outcome.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use serde_derive::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{combined_logs, JobError};
use crate::hasher::result_hash;
use crate::job::{JobDescriptor, JobId, JobPayload, ProcessJobRequest};
use crate::probe::{docker_status, gpu_status};
use crate::sandbox::docker::DockerSandbox;
use crate::sandbox::{Artifact, ExecutionOutcome, Sandbox};
use crate::storage::{ArtifactStore, Locator, PinataStore, StorageError};
use crate::workspace::{WorkArea, Workspace};

const PLATFORM: &str = "gpu-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validating,
    Executing,
    ExtractingOutput,
    UploadingArtifact,
    Completed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::ExtractingOutput => "extracting_output",
            Self::UploadingArtifact => "uploading_artifact",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The payloads a sandbox can actually run.
enum Task {
    Script { code: String },
    Image { reference: String, args: Vec<String> },
}

/// Host capabilities detected at startup, reported by `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub docker_available: bool,
    pub gpu_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReport {
    pub filename: String,
    #[serde(rename = "type")]
    pub extension: String,
    pub size: u64,
    /// Base64 of the file, so the caller has the bytes even without storage.
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_hash: Option<String>,
}

/// A completed job. `result_hash` is what the caller submits on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub result: String,
    pub result_hash: String,
    pub logs: String,
    pub accelerated: bool,
    pub artifacts: Vec<ArtifactReport>,
    pub image_locator: Option<Locator>,
    pub metadata_locator: Option<Locator>,
    /// Gateway links for the locators above.
    pub image_url: Option<String>,
    pub metadata_url: Option<String>,
    /// Set when uploads failed and the inline hash was kept instead.
    pub storage_error: Option<String>,
}

pub struct Dispatcher {
    config: WorkerConfig,
    sandbox: Arc<dyn Sandbox>,
    store: Arc<dyn ArtifactStore>,
    workspace: Workspace,
    capabilities: Capabilities,
    turn: Mutex<()>,
    jobs_processed: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: WorkerConfig,
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn ArtifactStore>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            workspace: Workspace::new(&config.work_dir),
            config,
            sandbox,
            store,
            capabilities,
            turn: Mutex::new(()),
            jobs_processed: AtomicU64::new(0),
        }
    }

    /// Probes the host and wires up the docker sandbox and Pinata storage.
    pub async fn from_config(config: WorkerConfig) -> std::io::Result<Self> {
        let docker = docker_status(&config.docker_binary).await;
        let gpu = gpu_status().await;
        let capabilities = Capabilities {
            docker_available: docker.docker_installed,
            gpu_available: gpu.gpu_available,
        };
        match &docker.version {
            Some(version) => info!(%version, "container runtime found"),
            None => warn!(binary = %config.docker_binary, "container runtime not reachable, jobs will fail"),
        }
        match &gpu.name {
            Some(name) => info!(gpu = %name, devices = gpu.devices.len(), "hardware accelerator detected"),
            None => warn!("no hardware accelerator detected, jobs will run CPU-only"),
        }

        let store = PinataStore::new(&config.storage);
        if !store.is_configured() {
            warn!("PINATA_JWT not set, artifact uploads will fail");
        }
        let sandbox = DockerSandbox::new(&config, capabilities.gpu_available);

        let dispatcher = Self::new(config, Arc::new(sandbox), Arc::new(store), capabilities);
        dispatcher.workspace.prepare().await?;
        dispatcher.prune().await?;
        Ok(dispatcher)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    /// Whether a job currently holds the worker.
    pub fn is_busy(&self) -> bool {
        self.turn.try_lock().is_err()
    }

    /// Evicts work areas older than the configured retention.
    pub async fn prune(&self) -> std::io::Result<usize> {
        self.workspace.sweep_stale(self.config.result_ttl).await
    }

    pub async fn process(&self, request: ProcessJobRequest) -> Result<JobReport, JobError> {
        let job_id = request.job_id;
        let _turn = self.turn.lock().await;
        info!(job_id, job_type = %request.job_type, stage = %Stage::Received, "processing job");

        let result = self.run(request).await;
        match &result {
            Ok(report) => {
                self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                info!(job_id, stage = %Stage::Completed, result_hash = %report.result_hash, "job completed");
            }
            Err(e) => error!(job_id, stage = %Stage::Failed, kind = e.kind(), "job failed: {e}"),
        }
        result
    }

    async fn run(&self, request: ProcessJobRequest) -> Result<JobReport, JobError> {
        let job_id = request.job_id;
        info!(job_id, stage = %Stage::Validating);
        let job = JobDescriptor::try_from(request)?;
        let kind = job.kind();
        let task = match job.payload {
            JobPayload::Script { code } => Task::Script { code },
            JobPayload::Image { reference, args } => Task::Image { reference, args },
            JobPayload::Description { .. } => return Err(JobError::UnsupportedJobKind(kind.to_string())),
        };

        if let Err(e) = self.prune().await {
            warn!(job_id, "stale work area sweep failed: {e}");
        }
        let area = self.workspace.allocate(job_id).await?;
        info!(job_id, %kind, stage = %Stage::Executing);
        let result = self.execute(job_id, &task, &area).await;
        if let Err(e) = area.release().await {
            warn!(job_id, "failed to remove work area: {e}");
        }
        result
    }

    async fn execute(&self, job_id: JobId, task: &Task, area: &WorkArea) -> Result<JobReport, JobError> {
        match task {
            Task::Script { code } => {
                let outcome = self.sandbox.run_script(job_id, code, area).await?;
                info!(job_id, stage = %Stage::ExtractingOutput);
                Ok(JobReport {
                    job_id,
                    result_hash: result_hash(outcome.output.as_bytes()),
                    logs: combined_logs(&outcome.stdout, &outcome.stderr),
                    result: outcome.output,
                    accelerated: outcome.accelerated,
                    artifacts: Vec::new(),
                    image_locator: None,
                    metadata_locator: None,
                    image_url: None,
                    metadata_url: None,
                    storage_error: None,
                })
            }
            Task::Image { reference, args } => {
                let outcome = self.sandbox.run_image(job_id, reference, args, area).await?;
                info!(job_id, stage = %Stage::ExtractingOutput, artifacts = outcome.artifacts.len());
                self.finalize_image_job(job_id, outcome).await
            }
        }
    }

    /// Uploads image artifacts and picks the completion proof: the first
    /// uploaded image's locator, or the inline hash when nothing was uploaded.
    async fn finalize_image_job(
        &self,
        job_id: JobId,
        outcome: ExecutionOutcome,
    ) -> Result<JobReport, JobError> {
        let mut report = JobReport {
            job_id,
            result_hash: result_hash(outcome.output.as_bytes()),
            logs: combined_logs(&outcome.stdout, &outcome.stderr),
            result: outcome.output.clone(),
            accelerated: outcome.accelerated,
            artifacts: Vec::with_capacity(outcome.artifacts.len()),
            image_locator: None,
            metadata_locator: None,
            image_url: None,
            metadata_url: None,
            storage_error: None,
        };
        let gateway = &self.config.storage.gateway_url;

        let mut storage_usable = true;
        for artifact in &outcome.artifacts {
            let data = tokio::fs::read(&artifact.path).await?;
            let mut entry = ArtifactReport {
                filename: artifact.file_name.clone(),
                extension: artifact.extension.clone(),
                size: artifact.size,
                data: STANDARD.encode(&data),
                ipfs_hash: None,
            };

            if storage_usable {
                info!(job_id, stage = %Stage::UploadingArtifact, file = %artifact.file_name);
                match self.upload_image(job_id, artifact, &outcome).await {
                    Ok((image, metadata)) => {
                        entry.ipfs_hash = Some(image.cid().to_string());
                        if report.image_locator.is_none() {
                            report.result_hash = image.uri();
                            report.image_url = Some(image.gateway_url(gateway));
                            report.image_locator = Some(image);
                            if let Ok(metadata) = &metadata {
                                report.metadata_url = Some(metadata.gateway_url(gateway));
                                report.metadata_locator = Some(metadata.clone());
                            }
                        }
                        if let Err(e) = metadata {
                            warn!(job_id, "metadata upload failed, image locator kept: {e}");
                            report.storage_error.get_or_insert_with(|| e.to_string());
                        }
                    }
                    Err(e) => {
                        warn!(job_id, file = %artifact.file_name, kind = e.kind(), "upload failed, keeping inline result: {e}");
                        storage_usable = !matches!(e, StorageError::NotConfigured);
                        report.storage_error.get_or_insert_with(|| e.to_string());
                    }
                }
            }

            report.artifacts.push(entry);
        }

        Ok(report)
    }

    /// Uploads the raw image, then a metadata document pointing at it.
    async fn upload_image(
        &self,
        job_id: JobId,
        artifact: &Artifact,
        outcome: &ExecutionOutcome,
    ) -> Result<(Locator, Result<Locator, StorageError>), StorageError> {
        let image = self
            .store
            .upload_file(&artifact.path, &format!("job-{job_id}-{}", artifact.file_name))
            .await?;

        let metadata = json!({
            "jobId": job_id,
            "image": image.uri(),
            "imageFilename": artifact.file_name,
            "imageSize": artifact.size,
            "mimeType": artifact.mime_type(),
            "executionLogs": outcome.stdout,
            "result": outcome.output,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "platform": PLATFORM,
        });
        let metadata = self
            .store
            .upload_json(&metadata, &format!("job-{job_id}-metadata.json"))
            .await;

        Ok((image, metadata))
    }
}
