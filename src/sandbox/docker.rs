use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

use super::output::capture;
use super::{read_script_output, scan_artifacts, ExecutionOutcome, Sandbox};
use crate::config::{AcceleratorMode, ResourceLimits, WorkerConfig};
use crate::error::{combined_logs, JobError};
use crate::job::JobId;
use crate::workspace::WorkArea;

const KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime messages meaning "this host cannot hand a GPU to the container".
const GPU_UNAVAILABLE: &[&str] = &[
    "could not select device driver",
    "unknown flag: --gpus",
    "nvidia-container-cli: initialization error",
];

/// Runs jobs by shelling out to the docker CLI.
///
/// Containers get `--rm`, no network, fixed CPU/memory caps and exactly one
/// writable mount (the job's output directory).
pub struct DockerSandbox {
    binary: String,
    sandbox_image: String,
    script_limits: ResourceLimits,
    image_limits: ResourceLimits,
    accelerator: AcceleratorMode,
    gpu_detected: bool,
    timeout: Duration,
    stream_limit: usize,
    artifact_max_bytes: u64,
}

struct Mount<'a> {
    host: &'a Path,
    target: &'static str,
    read_only: bool,
}

struct Finished {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

enum RunResult {
    Exited(Finished),
    TimedOut { stdout: String, stderr: String },
}

struct ContainerSpec<'a> {
    name: String,
    limits: &'a ResourceLimits,
    mounts: Vec<Mount<'a>>,
    image: &'a str,
    command: Vec<String>,
}

impl DockerSandbox {
    pub fn new(config: &WorkerConfig, gpu_detected: bool) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            sandbox_image: config.sandbox_image.clone(),
            script_limits: config.script_limits.clone(),
            image_limits: config.image_limits.clone(),
            accelerator: config.accelerator,
            gpu_detected,
            timeout: config.job_timeout,
            stream_limit: config.stream_limit,
            artifact_max_bytes: config.artifact_max_bytes,
        }
    }

    fn use_gpu(&self) -> bool {
        match self.accelerator {
            AcceleratorMode::Always => true,
            AcceleratorMode::Never => false,
            AcceleratorMode::Auto => self.gpu_detected && !cfg!(target_os = "macos"),
        }
    }

    /// Runs the container, retrying once without `--gpus` when the runtime
    /// turns the GPU request down. Returns whether the final run had a GPU.
    async fn run_container(
        &self,
        job_id: JobId,
        spec: ContainerSpec<'_>,
        deadline: Instant,
    ) -> io::Result<(RunResult, bool)> {
        let gpu = self.use_gpu();
        if !gpu {
            info!(job_id, "no hardware accelerator in use, running CPU-only");
        }

        let run = self
            .run_process(run_args(&spec, gpu), Some(spec.name.as_str()), deadline)
            .await?;

        if gpu && self.accelerator == AcceleratorMode::Auto {
            if let RunResult::Exited(finished) = &run {
                if !finished.status.success() && is_gpu_unavailable(&finished.stderr) {
                    warn!(job_id, "container runtime rejected the GPU request, falling back to CPU-only");
                    let spec = ContainerSpec {
                        name: format!("{}-cpu", spec.name),
                        ..spec
                    };
                    let run = self
                        .run_process(run_args(&spec, false), Some(spec.name.as_str()), deadline)
                        .await?;
                    return Ok((run, false));
                }
            }
        }

        Ok((run, gpu))
    }

    async fn run_process(
        &self,
        args: Vec<OsString>,
        container: Option<&str>,
        deadline: Instant,
    ) -> io::Result<RunResult> {
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().map(|s| tokio::spawn(capture(s, self.stream_limit)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(capture(s, self.stream_limit)));

        let waited = timeout_at(deadline, child.wait()).await;
        let status = match waited {
            Ok(status) => Some(status?),
            Err(_) => {
                warn!(container, "wall-clock ceiling reached, stopping container");
                if let Some(name) = container {
                    self.kill_container(name).await;
                }
                if let Err(e) = child.kill().await {
                    warn!(container, "failed to kill container client: {e}");
                }
                None
            }
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        Ok(match status {
            Some(status) => RunResult::Exited(Finished {
                status,
                stdout,
                stderr,
            }),
            None => RunResult::TimedOut { stdout, stderr },
        })
    }

    async fn kill_container(&self, name: &str) {
        let kill = Command::new(&self.binary)
            .args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match timeout(KILL_TIMEOUT, kill).await {
            Ok(Ok(status)) if status.success() => info!(container = name, "container killed"),
            Ok(Ok(status)) => warn!(container = name, %status, "docker kill did not succeed"),
            Ok(Err(e)) => warn!(container = name, "failed to run docker kill: {e}"),
            Err(_) => warn!(container = name, "docker kill timed out"),
        }
    }

    fn timed_out(&self, stdout: &str, stderr: &str) -> JobError {
        JobError::TimedOut {
            limit: self.timeout,
            logs: combined_logs(stdout, stderr),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run_script(
        &self,
        job_id: JobId,
        code: &str,
        area: &WorkArea,
    ) -> Result<ExecutionOutcome, JobError> {
        let deadline = Instant::now() + self.timeout;
        let script = area.script_path();
        fs::write(&script, code).await?;
        info!(job_id, "running consumer script in sandbox");

        let spec = ContainerSpec {
            name: container_name(area),
            limits: &self.script_limits,
            mounts: vec![
                Mount {
                    host: script.as_path(),
                    target: "/job.py",
                    read_only: true,
                },
                Mount {
                    host: area.output_dir(),
                    target: "/results",
                    read_only: false,
                },
            ],
            image: &self.sandbox_image,
            command: vec!["python3".into(), "/job.py".into()],
        };
        let result = self.run_container(job_id, spec, deadline).await;

        if let Err(e) = fs::remove_file(&script).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(job_id, "failed to remove script file: {e}");
            }
        }

        let (run, accelerated) = result.map_err(|e| JobError::ScriptExecutionFailed {
            detail: format!("could not invoke container runtime: {e}"),
            logs: String::new(),
        })?;

        match run {
            RunResult::TimedOut { stdout, stderr } => Err(self.timed_out(&stdout, &stderr)),
            RunResult::Exited(Finished {
                status,
                stdout,
                stderr,
            }) if !status.success() => Err(JobError::ScriptExecutionFailed {
                detail: status.to_string(),
                logs: combined_logs(&stdout, &stderr),
            }),
            RunResult::Exited(Finished { stdout, stderr, .. }) => {
                let output = read_script_output(job_id, area.output_dir(), &stdout, self.stream_limit).await;
                Ok(ExecutionOutcome {
                    stdout,
                    stderr,
                    output,
                    accelerated,
                    ..Default::default()
                })
            }
        }
    }

    async fn run_image(
        &self,
        job_id: JobId,
        image: &str,
        args: &[String],
        area: &WorkArea,
    ) -> Result<ExecutionOutcome, JobError> {
        let deadline = Instant::now() + self.timeout;
        info!(job_id, image, "pulling consumer image");

        let pull_failed = |logs: String| JobError::ImagePullFailed {
            image: image.to_string(),
            logs,
        };
        let pull = self
            .run_process(pull_args(image), None, deadline)
            .await
            .map_err(|e| pull_failed(format!("could not invoke container runtime: {e}")))?;
        match pull {
            RunResult::TimedOut { stdout, stderr } => return Err(self.timed_out(&stdout, &stderr)),
            RunResult::Exited(f) if !f.status.success() => {
                return Err(pull_failed(combined_logs(&f.stdout, &f.stderr)))
            }
            RunResult::Exited(_) => info!(job_id, image, "image pulled"),
        }

        let spec = ContainerSpec {
            name: container_name(area),
            limits: &self.image_limits,
            mounts: vec![Mount {
                host: area.output_dir(),
                target: "/output",
                read_only: false,
            }],
            image,
            command: args.to_vec(),
        };
        let (run, accelerated) = self
            .run_container(job_id, spec, deadline)
            .await
            .map_err(|e| JobError::ContainerExecutionFailed {
                detail: format!("could not invoke container runtime: {e}"),
                logs: String::new(),
            })?;

        let (stdout, stderr) = match run {
            RunResult::TimedOut { stdout, stderr } => return Err(self.timed_out(&stdout, &stderr)),
            RunResult::Exited(f) if !f.status.success() => {
                return Err(JobError::ContainerExecutionFailed {
                    detail: f.status.to_string(),
                    logs: combined_logs(&f.stdout, &f.stderr),
                })
            }
            RunResult::Exited(f) => (f.stdout, f.stderr),
        };

        let (artifacts, ignored_files) =
            scan_artifacts(area.output_dir(), self.artifact_max_bytes).await?;
        if !ignored_files.is_empty() {
            info!(job_id, files = ?ignored_files, "output files not eligible for upload");
        }

        Ok(ExecutionOutcome {
            output: stdout.trim().to_string(),
            stdout,
            stderr,
            artifacts,
            ignored_files,
            accelerated,
        })
    }
}

fn container_name(area: &WorkArea) -> String {
    format!("gpu-worker-{}", area.name())
}

fn run_args(spec: &ContainerSpec<'_>, gpu: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        spec.name.clone().into(),
        "--network".into(),
        "none".into(),
        "--cpus".into(),
        spec.limits.cpus.to_string().into(),
        "--memory".into(),
        spec.limits.docker_memory().into(),
    ];
    if gpu {
        args.push("--gpus".into());
        args.push("all".into());
    }
    for mount in &spec.mounts {
        let mut volume = OsString::from(mount.host);
        volume.push(":");
        volume.push(mount.target);
        if mount.read_only {
            volume.push(":ro");
        }
        args.push("-v".into());
        args.push(volume);
    }
    // Everything after the separator is image and command, never an option.
    args.push("--".into());
    args.push(spec.image.into());
    args.extend(spec.command.iter().map(OsString::from));
    args
}

fn pull_args(image: &str) -> Vec<OsString> {
    vec!["pull".into(), "--".into(), image.into()]
}

fn is_gpu_unavailable(stderr: &str) -> bool {
    GPU_UNAVAILABLE.iter().any(|needle| stderr.contains(needle))
}

async fn collect(task: Option<JoinHandle<io::Result<String>>>) -> String {
    match task {
        Some(task) => match task.await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => format!("[stream capture failed: {e}]"),
            Err(e) => format!("[stream capture aborted: {e}]"),
        },
        None => String::new(),
    }
}
