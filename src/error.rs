use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Validation failure for a ZFS dataset or snapshot name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("contains forbidden characters (any of '@#|<tab><>*')")]
    ForbiddenCharacters,

    #[error("must not end with a '/'")]
    TrailingSlash,
}

/// Failure while driving the `zfs` binary or interpreting its output.
#[derive(Debug, thiserror::Error)]
pub enum ZfsError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("zfs {verb} failed ({status}): {stderr}")]
    CommandFailed {
        verb: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    #[error("cannot parse zfs output line {line:?}: {reason}")]
    Parse { line: String, reason: &'static str },

    #[error("invalid snapshot name {name:?}: {source}")]
    InvalidSnapshotName { name: String, source: PathError },
}

/// Failure of a pre- or post-snapshot hook invocation.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook command failed to start: {0}")]
    Start(std::io::Error),

    #[error("hook command exited with {status}")]
    Failed { status: ExitStatus },

    #[error("hook command killed after {timeout:?} deadline")]
    Timeout { timeout: Duration },

    #[error("hook command aborted by shutdown")]
    Cancelled,

    #[error("hook command wait failed: {0}")]
    Wait(std::io::Error),
}

/// Rejected configuration. Raised at job construction, before any task runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("prefix must not be empty")]
    EmptyPrefix,

    #[error("prefix {prefix:?} contains characters not allowed in snapshot names")]
    InvalidPrefix { prefix: String },

    #[error("interval must be positive")]
    NonPositiveInterval,

    #[error("invalid filter pattern {pattern:?}: {source}")]
    InvalidFilterPattern { pattern: String, source: PathError },

    #[error("duplicate job name {0:?}")]
    DuplicateJob(String),

    #[error("cannot read jobs file {path}: {source}", path = .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse jobs file {path}: {source}", path = .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Error surface of the HTTP status API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        let body = ApiResponse::<()>::error(&message);
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }
    }
}
