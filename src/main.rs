use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gpu_worker::config::{absolute, WorkerConfig};
use gpu_worker::dispatcher::Dispatcher;
use gpu_worker::job::ProcessJobRequest;
use gpu_worker::server::{self, process_job_response};
use gpu_worker::service::{install_service, uninstall_service};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root for job work areas (overrides GPU_WORKER_DIR)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the job-processing HTTP API (default)
    Serve {
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Run a Python script as a job and print the response
    Script {
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        job_id: u64,
    },
    /// Run a container image as a job and print the response
    Image {
        #[arg(long, default_value_t = 0)]
        job_id: u64,
        image: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Evict abandoned work areas older than the retention period
    Prune {},
    Install {},
    Uninstall {},
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gpu_worker=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = WorkerConfig::from_env()?;
    if let Some(dir) = cli.work_dir {
        config.work_dir = absolute(&dir)?;
    }

    match cli.command {
        Some(Commands::Install {}) => return install_service(),
        Some(Commands::Uninstall {}) => return uninstall_service(),
        _ => {}
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            None => serve(config).await,
            Some(Commands::Serve { listen }) => {
                if let Some(listen) = listen {
                    config.listen = listen;
                }
                serve(config).await
            }
            Some(Commands::Script { path, job_id }) => {
                let code = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                run_once(config, job_id, "python-script", json!({ "code": code })).await
            }
            Some(Commands::Image {
                image,
                job_id,
                args,
            }) => run_once(config, job_id, "docker-image", json!({ "image": image, "args": args })).await,
            Some(Commands::Prune {}) => {
                let dispatcher = Dispatcher::from_config(config).await?;
                let removed = dispatcher.prune().await?;
                println!("Removed {removed} stale work areas");
                Ok(())
            }
            Some(Commands::Install {}) | Some(Commands::Uninstall {}) => Ok(()),
        }
    })
}

async fn serve(config: WorkerConfig) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::from_config(config).await?);
    server::serve(dispatcher).await
}

async fn run_once(
    config: WorkerConfig,
    job_id: u64,
    job_type: &str,
    job_data: serde_json::Value,
) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::from_config(config).await?);
    let request = ProcessJobRequest {
        job_id,
        job_type: job_type.to_string(),
        job_data,
    };
    let (status, response) = process_job_response(dispatcher, request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !status.is_success() {
        bail!("job {job_id} failed with status {status}");
    }
    Ok(())
}
