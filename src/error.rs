//! Error types for upload orchestration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::UrlOperation;
use crate::task::{TaskId, UploadStatus};

/// Why a file was refused at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ValidationReason {
    TooLarge { size: u64, max: u64 },
    UnsupportedType { mime_type: String },
    EmptyName,
}

/// A file rejected before it became a task.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{file_name}: {}", describe_reason(.reason))]
pub struct ValidationError {
    pub file_name: String,
    pub reason: ValidationReason,
}

fn describe_reason(reason: &ValidationReason) -> String {
    match reason {
        ValidationReason::TooLarge { size, max } => {
            format!("file is {} bytes, limit is {} bytes", size, max)
        }
        ValidationReason::UnsupportedType { mime_type } => {
            format!("type {} is not allowed", mime_type)
        }
        ValidationReason::EmptyName => "file name is empty".to_string(),
    }
}

/// Failure to obtain a presigned URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to presign {operation} URL for {resource_id}: {message}")]
pub struct RefreshError {
    pub resource_id: String,
    pub operation: UrlOperation,
    pub status: Option<u16>,
    pub message: String,
}

/// A retryable network or server failure during a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Upload failed: {message}")]
pub struct TransferFailure {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    #[source]
    pub cause: Option<RefreshError>,
}

impl TransferFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            cause: None,
        }
    }
}

impl From<RefreshError> for TransferFailure {
    fn from(err: RefreshError) -> Self {
        Self {
            status: err.status,
            code: Some("refresh_failed".to_string()),
            message: err.to_string(),
            cause: Some(err),
        }
    }
}

/// Outcome of a transfer that did not produce a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error(transparent)]
    Failed(#[from] TransferFailure),
    #[error("Upload cancelled")]
    Canceled,
}

/// An operation invoked on a task that cannot accept it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogicError {
    #[error("Task {0} not found")]
    NotFound(TaskId),
    #[error("Task {id} is already {status}")]
    Terminal { id: TaskId, status: UploadStatus },
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: UploadStatus,
        to: UploadStatus,
    },
    #[error("Task {id} reported progress {percent}, expected 0-100")]
    InvalidProgress { id: TaskId, percent: u8 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Umbrella error for the public queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    TransferFailed(#[from] TransferFailure),
    #[error("Upload cancelled")]
    Canceled,
    #[error(transparent)]
    RefreshFailed(#[from] RefreshError),
    #[error(transparent)]
    Logic(#[from] LogicError),
}

impl From<TransferError> for UploadError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Failed(failure) => UploadError::TransferFailed(failure),
            TransferError::Canceled => UploadError::Canceled,
        }
    }
}

/// Error category recorded on a task for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransferFailed,
    Canceled,
    RefreshFailed,
    Logic,
}

/// The structured, human-readable failure stored on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
}

impl From<&TransferFailure> for TaskError {
    fn from(failure: &TransferFailure) -> Self {
        let kind = if failure.cause.is_some() {
            ErrorKind::RefreshFailed
        } else {
            ErrorKind::TransferFailed
        };
        TaskError {
            kind,
            message: failure.message.clone(),
            code: failure.code.clone(),
        }
    }
}

impl From<&UploadError> for TaskError {
    fn from(err: &UploadError) -> Self {
        match err {
            UploadError::TransferFailed(failure) => failure.into(),
            UploadError::Validation(e) => TaskError {
                kind: ErrorKind::Validation,
                message: e.to_string(),
                code: None,
            },
            UploadError::Canceled => TaskError {
                kind: ErrorKind::Canceled,
                message: err.to_string(),
                code: None,
            },
            UploadError::RefreshFailed(e) => TaskError {
                kind: ErrorKind::RefreshFailed,
                message: e.to_string(),
                code: e.status.map(|s| s.to_string()),
            },
            UploadError::Logic(e) => TaskError {
                kind: ErrorKind::Logic,
                message: e.to_string(),
                code: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_failure_is_kept_as_transfer_cause() {
        let refresh = RefreshError {
            resource_id: "slider-7".to_string(),
            operation: UrlOperation::Write,
            status: Some(503),
            message: "metadata service unavailable".to_string(),
        };
        let failure = TransferFailure::from(refresh.clone());

        assert_eq!(failure.cause, Some(refresh));
        assert_eq!(failure.status, Some(503));
        assert_eq!(TaskError::from(&failure).kind, ErrorKind::RefreshFailed);
    }

    #[test]
    fn validation_error_message_names_the_file() {
        let err = ValidationError {
            file_name: "banner.png".to_string(),
            reason: ValidationReason::TooLarge { size: 20, max: 10 },
        };
        assert_eq!(
            err.to_string(),
            "banner.png: file is 20 bytes, limit is 10 bytes"
        );
    }
}
