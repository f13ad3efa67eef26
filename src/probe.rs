//! Read-only capability probes behind `/check-docker` and `/check-gpu`.

use std::process::Stdio;
use std::time::Duration;

use serde_derive::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerStatus {
    pub docker_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDevice {
    pub name: String,
    pub memory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStatus {
    pub gpu_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<GpuDevice>,
}

/// Runs a command and returns its stdout when it exits successfully.
async fn probe(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(Ok(output)) => {
            debug!(program, status = %output.status, "probe exited unsuccessfully");
            None
        }
        Ok(Err(e)) => {
            debug!(program, "probe could not run: {e}");
            None
        }
        Err(_) => {
            debug!(program, "probe timed out");
            None
        }
    }
}

pub async fn docker_status(binary: &str) -> DockerStatus {
    match probe(binary, &["--version"]).await {
        Some(version) => DockerStatus {
            docker_installed: true,
            version: Some(version),
        },
        None => DockerStatus::default(),
    }
}

pub async fn gpu_status() -> GpuStatus {
    let Some(stdout) = probe(
        "nvidia-smi",
        &["--query-gpu=name,memory.total", "--format=csv,noheader"],
    )
    .await
    else {
        return GpuStatus::default();
    };

    let devices = parse_gpu_inventory(&stdout);
    GpuStatus {
        gpu_available: !devices.is_empty(),
        name: devices.first().map(|d| d.name.clone()),
        memory: devices.first().map(|d| d.memory.clone()),
        devices,
    }
}

/// Parses `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader`.
pub fn parse_gpu_inventory(stdout: &str) -> Vec<GpuDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, memory) = line.split_once(',')?;
            let name = name.trim();
            (!name.is_empty()).then(|| GpuDevice {
                name: name.to_string(),
                memory: memory.trim().to_string(),
            })
        })
        .collect()
}
