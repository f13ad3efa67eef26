//! Local HTTP boundary in front of the dispatcher.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_derive::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::dispatcher::{ArtifactReport, Dispatcher, JobReport};
use crate::error::JobError;
use crate::job::{JobId, ProcessJobRequest};
use crate::probe::{docker_status, gpu_status, DockerStatus, GpuStatus};

const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Wire shape of `POST /process-job` responses, success and failure alike.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessJobResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerated: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ArtifactReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_metadata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_metadata_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
}

impl From<JobReport> for ProcessJobResponse {
    fn from(report: JobReport) -> Self {
        Self {
            success: true,
            job_id: Some(report.job_id),
            result: Some(report.result),
            result_hash: Some(report.result_hash),
            logs: report.logs,
            accelerated: Some(report.accelerated),
            files: report.artifacts,
            ipfs_image: report.image_locator.map(|l| l.uri()),
            ipfs_metadata: report.metadata_locator.map(|l| l.uri()),
            ipfs_image_url: report.image_url,
            ipfs_metadata_url: report.metadata_url,
            storage_error: report.storage_error,
            ..Default::default()
        }
    }
}

impl ProcessJobResponse {
    pub fn failure(job_id: Option<JobId>, err: &JobError) -> Self {
        Self {
            success: false,
            job_id,
            logs: err.logs().to_string(),
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            ..Default::default()
        }
    }
}

pub fn status_for(err: &JobError) -> StatusCode {
    match err {
        JobError::MalformedJobDescriptor(_) | JobError::UnsupportedJobKind(_) => StatusCode::BAD_REQUEST,
        JobError::ImagePullFailed { .. } => StatusCode::BAD_GATEWAY,
        JobError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Runs one job to completion and shapes the outcome for the wire.
pub async fn process_job_response(
    dispatcher: Arc<Dispatcher>,
    request: ProcessJobRequest,
) -> (StatusCode, ProcessJobResponse) {
    let job_id = request.job_id;
    // Detached so that a caller hanging up cannot abort the container or
    // its cleanup halfway through.
    let handle = tokio::spawn(async move { dispatcher.process(request).await });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(JobError::Internal(format!("job task aborted: {e}"))),
    };

    match result {
        Ok(report) => (StatusCode::OK, report.into()),
        Err(e) => (status_for(&e), ProcessJobResponse::failure(Some(job_id), &e)),
    }
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/process-job", post(process_job))
        .route("/health", get(health))
        .route("/check-docker", get(check_docker))
        .route("/check-gpu", get(check_gpu))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

/// Binds the listener and serves until ctrl-c. A bind failure is fatal.
pub async fn serve(dispatcher: Arc<Dispatcher>) -> Result<()> {
    let addr = dispatcher.config().listen;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "gpu worker listening");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutting down after in-flight job");
        })
        .await?;

    Ok(())
}

async fn process_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    payload: Result<Json<ProcessJobRequest>, JsonRejection>,
) -> (StatusCode, Json<ProcessJobResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = JobError::MalformedJobDescriptor(rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(ProcessJobResponse::failure(None, &err)));
        }
    };

    let (status, response) = process_job_response(dispatcher, request).await;
    (status, Json(response))
}

async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Value> {
    let capabilities = dispatcher.capabilities();
    Json(json!({
        "status": "running",
        "gpuAvailable": capabilities.gpu_available,
        "dockerAvailable": capabilities.docker_available,
        "jobsProcessed": dispatcher.jobs_processed(),
        "busy": dispatcher.is_busy(),
    }))
}

async fn check_docker(State(dispatcher): State<Arc<Dispatcher>>) -> Json<DockerStatus> {
    Json(docker_status(&dispatcher.config().docker_binary).await)
}

async fn check_gpu() -> Json<GpuStatus> {
    Json(gpu_status().await)
}
