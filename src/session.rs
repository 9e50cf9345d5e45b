//! One upload session: a registry, a URL cache and a queue wired together.
//!
//! Nothing here is process-wide; independent consumers build their own
//! session.

use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::PresignedUrlCache;
use crate::clock::{Clock, SystemClock};
use crate::config::UploadConfig;
use crate::coordinator::UploadQueue;
use crate::error::ConfigError;
use crate::executor::{StorageBackend, TransferExecutor};
use crate::presign::PresignSource;
use crate::registry::UploadRegistry;
use crate::validate::PolicyValidator;

pub struct UploadSession {
    registry: Arc<UploadRegistry>,
    urls: PresignedUrlCache,
    queue: UploadQueue,
}

impl UploadSession {
    pub fn new(
        config: UploadConfig,
        backend: Arc<dyn StorageBackend>,
        presign: Arc<dyn PresignSource>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, backend, presign, Arc::new(SystemClock))
    }

    /// Like `new`, with an explicit clock for URL expiry.
    pub fn with_clock(
        config: UploadConfig,
        backend: Arc<dyn StorageBackend>,
        presign: Arc<dyn PresignSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(UploadRegistry::new(Arc::new(
            PolicyValidator::from_config(&config),
        )));
        let urls = PresignedUrlCache::new(
            presign,
            clock,
            config.safety_margin(),
            config.presign_expires_secs,
        );
        info!(
            "upload_session: concurrency={} max_retries={} presign_expires={}s",
            config.concurrency, config.max_retries, config.presign_expires_secs
        );
        let queue = UploadQueue::new(
            config,
            registry.clone(),
            TransferExecutor::new(backend),
            Some(urls.clone()),
        );

        Ok(UploadSession {
            registry,
            urls,
            queue,
        })
    }

    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.registry
    }

    pub fn urls(&self) -> &PresignedUrlCache {
        &self.urls
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Periodically drop expired URLs. Abort the handle to stop.
    pub fn spawn_url_sweeper(&self, period: Duration) -> JoinHandle<()> {
        self.urls.spawn_sweeper(period)
    }
}
