//! Upload task records and status definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Opaque task identifier, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(value: u64) -> Self {
        TaskId(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "canceled")]
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Done | UploadStatus::Error | UploadStatus::Canceled
        )
    }

    /// Forward edges of the task state machine. `error -> pending` is not
    /// listed: it is only reachable through an explicit retry.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (UploadStatus::Pending, UploadStatus::Uploading)
                | (UploadStatus::Pending, UploadStatus::Canceled)
                | (UploadStatus::Uploading, UploadStatus::Done)
                | (UploadStatus::Uploading, UploadStatus::Error)
                | (UploadStatus::Uploading, UploadStatus::Canceled)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Pending => write!(f, "pending"),
            UploadStatus::Uploading => write!(f, "uploading"),
            UploadStatus::Done => write!(f, "done"),
            UploadStatus::Error => write!(f, "error"),
            UploadStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl From<String> for UploadStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "uploading" => UploadStatus::Uploading,
            "done" => UploadStatus::Done,
            "error" => UploadStatus::Error,
            "canceled" | "cancelled" => UploadStatus::Canceled,
            _ => UploadStatus::Pending,
        }
    }
}

/// Where the bytes of a file live locally.
#[derive(Debug, Clone)]
pub enum FileContent {
    Path(PathBuf),
    Memory(Arc<Vec<u8>>),
}

/// A locally selected file.
#[derive(Debug, Clone, Serialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(skip)]
    pub content: FileContent,
}

impl FileDescriptor {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        FileDescriptor {
            name: name.into(),
            size: bytes.len() as u64,
            mime_type: mime_type.into(),
            content: FileContent::Memory(Arc::new(bytes)),
        }
    }

    /// Describe a file on disk. Size comes from the file metadata.
    pub async fn from_path(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(FileDescriptor {
            name,
            size: metadata.len(),
            mime_type: mime_type.into(),
            content: FileContent::Path(path),
        })
    }
}

/// Upload target chosen at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Destination {
    /// Multipart `POST` to a fixed upload endpoint; the file goes in `field`.
    Endpoint { url: String, field: String },
    /// `PUT` to a presigned write URL for this resource.
    Presigned { resource_id: String },
}

impl Destination {
    pub fn endpoint(url: impl Into<String>) -> Self {
        Destination::Endpoint {
            url: url.into(),
            field: "file".to_string(),
        }
    }

    pub fn presigned(resource_id: impl Into<String>) -> Self {
        Destination::Presigned {
            resource_id: resource_id.into(),
        }
    }
}

/// Metadata of the object created by a successful transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub url: String,
    pub etag: Option<String>,
    pub size: u64,
    pub content_type: String,
    /// JSON body returned by the backend, `Null` when it returned none.
    pub metadata: serde_json::Value,
}

/// Lifecycle record of one file's upload attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub id: TaskId,
    pub file: FileDescriptor,
    pub destination: Destination,
    pub status: UploadStatus,
    pub progress: u8,
    pub error: Option<TaskError>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub remote: Option<RemoteObject>,
    #[serde(skip)]
    pub cancel: CancellationToken,
    /// Earliest instant a backed-off task may be promoted again.
    #[serde(skip)]
    pub retry_at: Option<Instant>,
}

impl UploadTask {
    pub(crate) fn new(id: TaskId, file: FileDescriptor, destination: Destination) -> Self {
        UploadTask {
            id,
            file,
            destination,
            status: UploadStatus::Pending,
            progress: 0,
            error: None,
            retry_count: 0,
            created_at: Utc::now(),
            finished_at: None,
            remote: None,
            cancel: CancellationToken::new(),
            retry_at: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.status == UploadStatus::Pending && self.retry_at.is_none_or(|at| at <= now)
    }
}
