use std::time::Duration;

use thiserror::Error;

/// Why a single job-processing call did not complete.
///
/// Every variant that can happen after the container runtime was invoked
/// carries the logs captured so far, so the caller always gets something to
/// debug with.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed job descriptor: {0}")]
    MalformedJobDescriptor(String),

    #[error("unsupported job kind: {0}")]
    UnsupportedJobKind(String),

    #[error("failed to pull image {image}")]
    ImagePullFailed { image: String, logs: String },

    #[error("script execution failed: {detail}")]
    ScriptExecutionFailed { detail: String, logs: String },

    #[error("container execution failed: {detail}")]
    ContainerExecutionFailed { detail: String, logs: String },

    #[error("job exceeded the {}s wall-clock ceiling", .limit.as_secs())]
    TimedOut { limit: Duration, logs: String },

    #[error("work area error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Stable name of the failure kind, reported next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedJobDescriptor(_) => "MalformedJobDescriptor",
            Self::UnsupportedJobKind(_) => "UnsupportedJobKind",
            Self::ImagePullFailed { .. } => "ImagePullFailed",
            Self::ScriptExecutionFailed { .. } => "ScriptExecutionFailed",
            Self::ContainerExecutionFailed { .. } => "ContainerExecutionFailed",
            Self::TimedOut { .. } => "TimedOut",
            Self::Io(_) => "WorkAreaError",
            Self::Internal(_) => "InternalError",
        }
    }

    pub fn logs(&self) -> &str {
        match self {
            Self::ImagePullFailed { logs, .. }
            | Self::ScriptExecutionFailed { logs, .. }
            | Self::ContainerExecutionFailed { logs, .. }
            | Self::TimedOut { logs, .. } => logs,
            _ => "",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("could not determine a data directory for the worker")]
    NoDataDir,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Joins the two captured streams into one diagnostic blob.
pub fn combined_logs(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("STDOUT:\n{stdout}\n\nSTDERR:\n{stderr}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_survive_on_execution_failures() {
        let err = JobError::ScriptExecutionFailed {
            detail: "exit status: 1".into(),
            logs: "RESULT:17".into(),
        };
        assert_eq!(err.logs(), "RESULT:17");
        assert_eq!(err.kind(), "ScriptExecutionFailed");
        assert_eq!(JobError::UnsupportedJobKind("simple".into()).logs(), "");
    }

    #[test]
    fn combined_logs_keeps_both_streams() {
        assert_eq!(combined_logs("out", ""), "out");
        assert_eq!(combined_logs("", "err"), "err");
        let both = combined_logs("RESULT:17", "Traceback");
        assert!(both.contains("RESULT:17"));
        assert!(both.contains("Traceback"));
    }

    #[test]
    fn timeout_message_names_the_ceiling() {
        let err = JobError::TimedOut {
            limit: Duration::from_secs(90),
            logs: String::new(),
        };
        assert_eq!(err.to_string(), "job exceeded the 90s wall-clock ceiling");
    }
}
