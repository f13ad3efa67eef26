use std::fmt;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::JobError;

/// Identifier assigned by the marketplace contract.
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Script,
    ContainerImage,
    OpaqueDescription,
}

impl JobKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Script => "python-script",
            Self::ContainerImage => "docker-image",
            Self::OpaqueDescription => "simple",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        match name {
            "python-script" => Some(Self::Script),
            "docker-image" => Some(Self::ContainerImage),
            "simple" => Some(Self::OpaqueDescription),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Script { code: String },
    Image { reference: String, args: Vec<String> },
    /// Free text. Never executed.
    Description { text: String },
}

/// A validated job: the payload is non-empty and matches its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub payload: JobPayload,
}

impl JobDescriptor {
    pub fn kind(&self) -> JobKind {
        match self.payload {
            JobPayload::Script { .. } => JobKind::Script,
            JobPayload::Image { .. } => JobKind::ContainerImage,
            JobPayload::Description { .. } => JobKind::OpaqueDescription,
        }
    }
}

/// Body of `POST /process-job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessJobRequest {
    pub job_id: JobId,
    pub job_type: String,
    #[serde(default)]
    pub job_data: Value,
}

impl TryFrom<ProcessJobRequest> for JobDescriptor {
    type Error = JobError;

    fn try_from(request: ProcessJobRequest) -> Result<Self, Self::Error> {
        let ProcessJobRequest {
            job_id,
            job_type,
            job_data,
        } = request;
        let kind = JobKind::from_wire(&job_type)
            .ok_or_else(|| JobError::UnsupportedJobKind(job_type.clone()))?;

        let payload = match kind {
            JobKind::Script => JobPayload::Script {
                code: required_text(&job_data, "code", kind)?,
            },
            JobKind::ContainerImage => {
                let raw = required_text(&job_data, "image", kind)?;
                let reference = normalize_image_reference(&raw);
                if reference.is_empty()
                    || reference.starts_with('-')
                    || reference.contains(char::is_whitespace)
                {
                    return Err(JobError::MalformedJobDescriptor(format!(
                        "image reference {raw:?} is not a valid reference"
                    )));
                }
                JobPayload::Image {
                    reference,
                    args: image_args(job_data.get("args"))?,
                }
            }
            JobKind::OpaqueDescription => {
                let text = match &job_data {
                    Value::String(s) => s.clone(),
                    _ => required_text(&job_data, "description", kind)?,
                };
                if text.trim().is_empty() {
                    return Err(empty_payload(kind, "description"));
                }
                JobPayload::Description { text }
            }
        };

        Ok(Self { job_id, payload })
    }
}

fn required_text(data: &Value, field: &str, kind: JobKind) -> Result<String, JobError> {
    match data.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(empty_payload(kind, field)),
        Some(other) => Err(JobError::MalformedJobDescriptor(format!(
            "{kind} job field `{field}` must be a string, got {other}"
        ))),
    }
}

fn empty_payload(kind: JobKind, field: &str) -> JobError {
    JobError::MalformedJobDescriptor(format!("{kind} job requires a non-empty `{field}`"))
}

/// Arguments come either as one whitespace-separated string or as an array.
fn image_args(value: Option<&Value>) -> Result<Vec<String>, JobError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(JobError::MalformedJobDescriptor(format!(
                    "image arguments must be strings, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(JobError::MalformedJobDescriptor(format!(
            "image arguments must be a string or an array, got {other}"
        ))),
    }
}

/// Turns a registry browse-page URL into a pullable `namespace/name`.
///
/// Best effort only: anything not recognised is returned trimmed but
/// otherwise unchanged and left to fail at pull time.
pub fn normalize_image_reference(raw: &str) -> String {
    let reference = raw.trim();
    if !reference.contains("hub.docker.com") {
        return reference.to_string();
    }

    let path_of = |marker: &str| {
        reference.find(marker).map(|at| {
            reference[at + marker.len()..]
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
        })
    };

    let extracted = if let Some(path) = path_of("hub.docker.com/r/") {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        match (segments.next(), segments.next()) {
            (Some(namespace), Some(name)) => Some(format!("{namespace}/{name}")),
            _ => None,
        }
    } else if let Some(path) = path_of("hub.docker.com/_/") {
        path.split('/').find(|s| !s.is_empty()).map(str::to_string)
    } else {
        None
    };

    match extracted {
        Some(image) => {
            info!(url = reference, image = %image, "extracted image name from registry URL");
            image
        }
        None => reference.to_string(),
    }
}
