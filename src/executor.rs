//! Transfer executor - runs one file's transfer against a storage backend

use async_trait::async_trait;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{TransferError, TransferFailure};
use crate::observe::lock;
use crate::task::{FileDescriptor, RemoteObject, TaskId, UploadTask};

/// Resolved network target for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// `PUT` the raw bytes to a presigned URL.
    Put { url: String },
    /// Multipart `POST` with the file in `field`.
    Multipart { url: String, field: String },
}

impl TransferTarget {
    pub fn url(&self) -> &str {
        match self {
            TransferTarget::Put { url } | TransferTarget::Multipart { url, .. } => url,
        }
    }
}

/// Everything a backend needs for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub task_id: TaskId,
    pub file: &'a FileDescriptor,
    pub target: &'a TransferTarget,
}

/// Error reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError {
            status: None,
            code: None,
            message: message.into(),
        }
    }
}

impl From<BackendError> for TransferFailure {
    fn from(err: BackendError) -> Self {
        TransferFailure {
            status: err.status,
            code: err.code,
            message: err.message,
            cause: None,
        }
    }
}

/// The storage endpoint that receives file bytes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Transfer the file and return the created object. Implementations
    /// report progress through `progress`; dropping the returned future
    /// must abort the transfer.
    async fn upload(
        &self,
        request: TransferRequest<'_>,
        progress: ProgressSink,
    ) -> Result<RemoteObject, BackendError>;
}

struct ProgressInner {
    last: Mutex<Option<u8>>,
    closed: AtomicBool,
    callback: Box<dyn Fn(u8) + Send + Sync>,
}

/// Forwards strictly increasing integer percentages to a callback, in order.
/// Once closed, reports are dropped.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<ProgressInner>,
}

impl ProgressSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        ProgressSink {
            inner: Arc::new(ProgressInner {
                last: Mutex::new(None),
                closed: AtomicBool::new(false),
                callback: Box::new(callback),
            }),
        }
    }

    pub fn report_percent(&self, percent: u8) {
        if self.is_closed() {
            return;
        }
        let percent = percent.min(100);
        // Held while calling back so reports from one transfer stay ordered
        let mut last = lock(&self.inner.last);
        if self.is_closed() || last.is_some_and(|prev| percent <= prev) {
            return;
        }
        *last = Some(percent);
        (self.inner.callback)(percent);
    }

    pub fn report_bytes(&self, sent: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            ((sent.min(total) as f64 / total as f64) * 100.0) as u8
        };
        self.report_percent(percent);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _last = lock(&self.inner.last);
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("last", &*lock(&self.inner.last))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes the sink when the transfer returns, whichever way it returns.
struct CloseOnDrop(ProgressSink);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[derive(Clone)]
pub struct TransferExecutor {
    backend: Arc<dyn StorageBackend>,
}

impl TransferExecutor {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        TransferExecutor { backend }
    }

    /// Run one transfer. Resolves to the created object, `Failed` for
    /// backend errors, or `Canceled` once `cancel` fires. A backend success
    /// that lands after cancellation was requested is reported as `Canceled`.
    pub async fn execute<F>(
        &self,
        task: &UploadTask,
        target: &TransferTarget,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<RemoteObject, TransferError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        if cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }

        let sink = ProgressSink::new(on_progress);
        let _guard = CloseOnDrop(sink.clone());
        let request = TransferRequest {
            task_id: task.id,
            file: &task.file,
            target,
        };

        debug!(
            "transfer_start: {} {} bytes -> {}",
            task.id,
            task.file.size,
            target.url()
        );
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("transfer_cancelled: {}", task.id);
                return Err(TransferError::Canceled);
            }
            result = self.backend.upload(request, sink) => result,
        };

        if cancel.is_cancelled() {
            debug!("transfer_discarded: {} settled after cancellation", task.id);
            return Err(TransferError::Canceled);
        }

        result.map_err(|e| TransferError::Failed(e.into()))
    }
}
