//! Upload orchestration core for the admin console.
//!
//! Files selected by the user are validated into [`UploadTask`]s held by an
//! [`UploadRegistry`], scheduled by an [`UploadQueue`] under a concurrency
//! limit with bounded retry, and transferred by a [`TransferExecutor`]
//! through a [`StorageBackend`]. Short-lived object URLs come from a
//! [`PresignedUrlCache`] that refreshes them just before they expire.
//!
//! ```no_run
//! use std::sync::Arc;
//! use attachment_uploads::{
//!     Destination, EnqueueOptions, FileDescriptor, HttpPresignSource, HttpStorageBackend,
//!     UploadConfig, UploadSession,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(HttpStorageBackend::new()?);
//! let presign = Arc::new(HttpPresignSource::new(
//!     reqwest::Client::new(),
//!     "https://admin.example.com/api",
//! ));
//! let session = UploadSession::new(UploadConfig::default(), backend, presign)?;
//!
//! let file = FileDescriptor::from_path("cover.png", "image/png").await?;
//! let report = session.queue().enqueue(
//!     vec![file],
//!     &EnqueueOptions::new(Destination::presigned("content-42/cover.png")),
//! );
//! session.queue().wait_idle().await;
//! println!("{:?}", session.registry().get_task(report.accepted[0]));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
mod observe;
pub mod presign;
pub mod registry;
pub mod session;
pub mod task;
pub mod transport;
pub mod validate;

pub use cache::{PresignedUrlCache, PresignedUrlEntry, UrlOperation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::UploadConfig;
pub use coordinator::UploadQueue;
pub use error::{
    ConfigError, ErrorKind, LogicError, RefreshError, TaskError, TransferError, TransferFailure,
    UploadError, ValidationError, ValidationReason,
};
pub use executor::{
    BackendError, ProgressSink, StorageBackend, TransferExecutor, TransferRequest, TransferTarget,
};
pub use observe::Subscription;
pub use presign::{HttpPresignSource, PresignSource, PresignedUrl, S3PresignConfig, S3PresignSource};
pub use registry::{CancelOutcome, EnqueueOptions, EnqueueReport, UploadRegistry};
pub use session::UploadSession;
pub use task::{
    Destination, FileContent, FileDescriptor, RemoteObject, TaskId, UploadStatus, UploadTask,
};
pub use transport::HttpStorageBackend;
pub use validate::{FileValidator, PolicyValidator};
