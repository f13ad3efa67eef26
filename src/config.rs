use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;

use crate::error::ConfigError;

/// Image extensions the uploader accepts as visual artifacts.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// CPU and memory caps applied to one container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpus: u32,
    pub memory_mb: u64,
}

impl ResourceLimits {
    pub fn docker_memory(&self) -> String {
        format!("{}m", self.memory_mb)
    }
}

/// When to request hardware acceleration from the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorMode {
    /// Use the GPU when one is detected, otherwise run CPU-only.
    Auto,
    Always,
    Never,
}

impl FromStr for AcceleratorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" | "gpu" => Ok(Self::Always),
            "never" | "cpu" => Ok(Self::Never),
            other => Err(format!("expected auto, always or never, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Pinata JWT. Uploads fail fast when it is missing.
    pub jwt: Option<String>,
    pub api_url: String,
    pub gateway_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            jwt: None,
            api_url: "https://api.pinata.cloud".to_string(),
            gateway_url: "https://gateway.pinata.cloud/ipfs".to_string(),
        }
    }
}

/// Everything the worker needs, resolved once at startup and handed to the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen: SocketAddr,
    /// Root of the `jobs/` and `results/` work areas. Always absolute so it
    /// can be bind-mounted.
    pub work_dir: PathBuf,
    pub docker_binary: String,
    /// Pre-built image that runs consumer scripts.
    pub sandbox_image: String,
    pub accelerator: AcceleratorMode,
    pub script_limits: ResourceLimits,
    pub image_limits: ResourceLimits,
    /// Wall-clock ceiling for one job, pull included.
    pub job_timeout: Duration,
    /// Age after which abandoned work areas are evicted.
    pub result_ttl: Duration,
    /// Per-stream capture ceiling in bytes.
    pub stream_limit: usize,
    pub artifact_max_bytes: u64,
    pub storage: StorageConfig,
}

impl WorkerConfig {
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3001)),
            work_dir: work_dir.into(),
            docker_binary: "docker".to_string(),
            sandbox_image: "gpu-worker-sandbox:latest".to_string(),
            accelerator: AcceleratorMode::Auto,
            script_limits: ResourceLimits {
                cpus: 2,
                memory_mb: 2048,
            },
            image_limits: ResourceLimits {
                cpus: 4,
                memory_mb: 4096,
            },
            job_timeout: Duration::from_secs(60 * 60),
            result_ttl: Duration::from_secs(24 * 60 * 60),
            stream_limit: 10 * 1024 * 1024,
            artifact_max_bytes: 5 * 1024 * 1024,
            storage: StorageConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let work_dir = match lookup("GPU_WORKER_DIR").filter(|s| !s.trim().is_empty()) {
            Some(dir) => absolute(Path::new(dir.trim()))?,
            None => default_work_dir()?,
        };
        let mut config = Self::with_work_dir(work_dir);

        config.listen = parse_env(&lookup, "GPU_WORKER_LISTEN", config.listen)?;
        config.docker_binary = lookup("GPU_WORKER_DOCKER_BIN").unwrap_or(config.docker_binary);
        config.sandbox_image = lookup("GPU_WORKER_SANDBOX_IMAGE").unwrap_or(config.sandbox_image);
        config.accelerator = parse_env(&lookup, "GPU_WORKER_ACCELERATOR", config.accelerator)?;
        config.job_timeout = Duration::from_secs(parse_env(
            &lookup,
            "GPU_WORKER_JOB_TIMEOUT_SECS",
            config.job_timeout.as_secs(),
        )?);
        config.result_ttl = Duration::from_secs(parse_env(
            &lookup,
            "GPU_WORKER_RESULT_TTL_SECS",
            config.result_ttl.as_secs(),
        )?);
        if config.job_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "GPU_WORKER_JOB_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        config.storage.jwt = lookup("PINATA_JWT").filter(|s| !s.trim().is_empty());
        if let Some(url) = lookup("PINATA_API_URL") {
            config.storage.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("IPFS_GATEWAY") {
            config.storage.gateway_url = url.trim_end_matches('/').to_string();
        }

        Ok(config)
    }
}

fn parse_env<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

pub fn default_work_dir() -> Result<PathBuf, ConfigError> {
    let dirs = ProjectDirs::from("io", "gpu-worker", "gpu-worker").ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
