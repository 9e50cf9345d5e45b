//! Upload queue coordinator - promotes pending tasks under the concurrency
//! limit, drives the executor and applies the retry policy

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{PresignedUrlCache, UrlOperation};
use crate::config::UploadConfig;
use crate::error::{TaskError, TransferError, TransferFailure, UploadError};
use crate::executor::{TransferExecutor, TransferTarget};
use crate::observe::lock;
use crate::registry::{CancelOutcome, EnqueueOptions, EnqueueReport, UploadRegistry};
use crate::task::{Destination, FileDescriptor, RemoteObject, TaskId, UploadStatus, UploadTask};

struct QueueInner {
    config: UploadConfig,
    registry: Arc<UploadRegistry>,
    executor: TransferExecutor,
    urls: Option<PresignedUrlCache>,
    // Never held while registry observers run
    active: Mutex<HashSet<TaskId>>,
    settled: Notify,
}

/// Cheap to clone; clones drive the same queue.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    /// `urls` resolves write URLs for `Destination::Presigned` tasks; without
    /// it those tasks fail.
    pub fn new(
        config: UploadConfig,
        registry: Arc<UploadRegistry>,
        executor: TransferExecutor,
        urls: Option<PresignedUrlCache>,
    ) -> Self {
        UploadQueue {
            inner: Arc::new(QueueInner {
                config,
                registry,
                executor,
                urls,
                active: Mutex::new(HashSet::new()),
                settled: Notify::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    /// Add files to the queue and start as many as there are free slots.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime (see `continue_queue`).
    pub fn enqueue(&self, files: Vec<FileDescriptor>, options: &EnqueueOptions) -> EnqueueReport {
        let report = self.inner.registry.enqueue(files, options);
        if !report.accepted.is_empty() {
            self.continue_queue();
        }
        report
    }

    /// Cancel a task and wait until it is terminal. A pending task never
    /// reaches the executor; an uploading one is aborted. Cancelling a
    /// terminal task changes nothing and returns it as it is.
    pub async fn cancel(&self, id: TaskId) -> Result<UploadTask, UploadError> {
        match self.inner.registry.request_cancel(id)? {
            CancelOutcome::AlreadyTerminal(status) => {
                debug!("upload_cancel: {} already {}", id, status)
            }
            CancelOutcome::Signaled => debug!("upload_cancel: {} signaled", id),
            CancelOutcome::Canceled => {}
        }
        Ok(self.inner.registry.wait_terminal(id).await?)
    }

    /// User retry of a failed task. The retry budget starts over.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime (see `continue_queue`).
    pub fn retry(&self, id: TaskId) -> Result<UploadTask, UploadError> {
        let task = self.inner.registry.restart(id)?;
        info!("upload_retry_requested: {}", id);
        self.continue_queue();
        Ok(task)
    }

    /// Remove a task from the list, cancelling it first if needed.
    pub async fn dismiss(&self, id: TaskId) -> Result<UploadTask, UploadError> {
        Ok(self.inner.registry.remove(id).await?)
    }

    /// Cancel the task if it is still unfinished after `after`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn cancel_after(&self, id: TaskId, after: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let still_running = queue
                .inner
                .registry
                .get_task(id)
                .is_some_and(|task| !task.status.is_terminal());
            if !still_running {
                return;
            }
            match queue.cancel(id).await {
                Ok(task) => info!("upload_timeout: {} after {:?} -> {}", id, after, task.status),
                Err(e) => debug!("upload_timeout: {} error={}", id, e),
            }
        })
    }

    /// Cancel every unfinished task and wait for all of them to settle.
    /// Returns how many tasks were cancelled or signaled.
    pub async fn cancel_all(&self) -> usize {
        let mut targets = HashSet::new();
        for task in self.inner.registry.snapshot() {
            if task.status.is_terminal() {
                continue;
            }
            match self.inner.registry.request_cancel(task.id) {
                Ok(CancelOutcome::AlreadyTerminal(_)) => {}
                Ok(_) => {
                    targets.insert(task.id);
                }
                Err(e) => debug!("upload_cancel_all: {} error={}", task.id, e),
            }
        }
        info!("upload_cancel_all: {} tasks", targets.len());

        let count = targets.len();
        self.inner
            .registry
            .wait_until(|tasks| {
                tasks
                    .iter()
                    .all(|task| !targets.contains(&task.id) || task.status.is_terminal())
            })
            .await;
        count
    }

    /// Resolve once nothing is uploading and nothing is waiting to start,
    /// including tasks in retry backoff.
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            let changed = self.inner.registry.changed().notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.is_idle() {
                return;
            }
            tokio::select! {
                _ = settled => {}
                _ = changed => {}
            }
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    /// Promote ready pending tasks, oldest first, into the free slots.
    /// Returns how many were started.
    ///
    /// # Panics
    ///
    /// Spawns the transfers with `tokio::spawn`, so it panics when called
    /// outside a Tokio runtime.
    pub fn continue_queue(&self) -> usize {
        let ready = self.inner.registry.ready_pending(Instant::now());
        // Slots are reserved under the lock; status changes (and the observer
        // calls they trigger) happen after it is released.
        let reserved: Vec<TaskId> = {
            let mut active = lock(&self.inner.active);
            let slots = self.inner.config.concurrency.saturating_sub(active.len());
            if slots == 0 {
                debug!("continue_queue: no free slots active={}", active.len());
                return 0;
            }
            let picked: Vec<TaskId> = ready
                .iter()
                .map(|task| task.id)
                // Still settling its previous attempt
                .filter(|id| !active.contains(id))
                .take(slots)
                .collect();
            active.extend(picked.iter().copied());
            picked
        };

        let mut started = 0;
        let mut released = 0;
        for id in reserved {
            match self.inner.registry.update_status(id, UploadStatus::Uploading) {
                Ok(task) => {
                    info!(
                        "spawn_upload_task: {} name={} size={} attempt={}",
                        task.id,
                        task.file.name,
                        task.file.size,
                        task.retry_count + 1
                    );
                    tokio::spawn(self.clone().run_task(task));
                    started += 1;
                }
                Err(e) => {
                    debug!("continue_queue: skip {} error={}", id, e);
                    lock(&self.inner.active).remove(&id);
                    released += 1;
                }
            }
        }

        if started > 0 {
            debug!(
                "continue_queue: started={} active={}",
                started,
                self.active_count()
            );
        }
        // Skipped tasks are no longer pending, so this terminates
        if released > 0 {
            started += self.continue_queue();
        }
        started
    }

    fn is_idle(&self) -> bool {
        // Tasks in backoff are pending, so they keep the queue busy
        let active = lock(&self.inner.active);
        active.is_empty()
            && self
                .inner
                .registry
                .list_by_status(UploadStatus::Pending)
                .is_empty()
    }

    async fn run_task(self, task: UploadTask) {
        let id = task.id;
        let cancel = task.cancel.clone();
        let outcome = self.attempt(&task, &cancel).await;
        self.settle(&task, outcome);

        lock(&self.inner.active).remove(&id);
        self.continue_queue();
        self.inner.settled.notify_waiters();
    }

    async fn attempt(
        &self,
        task: &UploadTask,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject, TransferError> {
        let target = self.resolve_target(task, cancel).await?;
        let registry = self.inner.registry.clone();
        let id = task.id;
        self.inner
            .executor
            .execute(task, &target, cancel, move |percent| {
                if let Err(e) = registry.update_progress(id, percent) {
                    debug!("upload_progress: {} dropped {}% error={}", id, percent, e);
                }
            })
            .await
    }

    async fn resolve_target(
        &self,
        task: &UploadTask,
        cancel: &CancellationToken,
    ) -> Result<TransferTarget, TransferError> {
        match &task.destination {
            Destination::Endpoint { url, field } => Ok(TransferTarget::Multipart {
                url: url.clone(),
                field: field.clone(),
            }),
            Destination::Presigned { resource_id } => {
                let urls = self.inner.urls.as_ref().ok_or_else(|| {
                    TransferFailure::new("No presigned URL cache configured for this queue")
                })?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransferError::Canceled),
                    url = urls.get(resource_id, UrlOperation::Write) => {
                        let url = url.map_err(TransferFailure::from)?;
                        Ok(TransferTarget::Put { url })
                    }
                }
            }
        }
    }

    fn settle(&self, task: &UploadTask, outcome: Result<RemoteObject, TransferError>) {
        let id = task.id;
        let registry = &self.inner.registry;
        let outcome = if task.cancel.is_cancelled() {
            Err(TransferError::Canceled)
        } else {
            outcome
        };

        match outcome {
            Ok(remote) => {
                if let Err(e) = registry.complete(id, remote) {
                    warn!("upload_complete_failed: {} error={}", id, e);
                    return;
                }
                if let (Destination::Presigned { resource_id }, Some(urls)) =
                    (&task.destination, &self.inner.urls)
                {
                    // The object behind any cached read URL just changed
                    urls.invalidate(resource_id, Some(UrlOperation::Read));
                }
            }
            Err(TransferError::Canceled) => {
                if let Err(e) = registry.update_status(id, UploadStatus::Canceled) {
                    debug!("upload_cancel_settle: {} error={}", id, e);
                }
            }
            Err(TransferError::Failed(failure)) => self.handle_failure(task, failure),
        }
    }

    /// Requeue a failed attempt with backoff while the budget lasts; only an
    /// exhausted budget makes the task terminal `error`.
    fn handle_failure(&self, task: &UploadTask, failure: TransferFailure) {
        let id = task.id;
        let registry = &self.inner.registry;
        let max_retries = self.inner.config.max_retries;
        let error = TaskError::from(&failure);

        if task.retry_count >= max_retries {
            match registry.set_error(id, error) {
                Ok(_) => warn!(
                    "upload_failed: {} retries exhausted ({}/{})",
                    id, task.retry_count, max_retries
                ),
                Err(e) => warn!("upload_error_failed: {} error={}", id, e),
            }
            return;
        }

        let delay = self.inner.config.backoff_delay(task.retry_count);
        let retry_at = Instant::now() + delay;
        match registry.requeue(id, error, Some(retry_at)) {
            Ok(requeued) if requeued.status == UploadStatus::Pending => {
                info!(
                    "upload_retry: {} attempt={} delay={:?} error={}",
                    id,
                    requeued.retry_count + 1,
                    delay,
                    failure.message
                );
                let queue = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(retry_at).await;
                    queue.continue_queue();
                });
            }
            Ok(requeued) => debug!("upload_retry: {} -> {} instead", id, requeued.status),
            Err(e) => warn!("upload_retry_failed: {} error={}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::executor::{BackendError, ProgressSink, StorageBackend, TransferRequest};
    use crate::validate::PolicyValidator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every attempt and records when each one started.
    struct AlwaysFailing {
        started: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl StorageBackend for AlwaysFailing {
        async fn upload(
            &self,
            _request: TransferRequest<'_>,
            _progress: ProgressSink,
        ) -> Result<RemoteObject, BackendError> {
            self.started.lock().unwrap().push(Instant::now());
            Err(BackendError {
                status: Some(503),
                code: Some("unavailable".to_string()),
                message: "storage unavailable".to_string(),
            })
        }
    }

    struct ImmediateSuccess {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for ImmediateSuccess {
        async fn upload(
            &self,
            request: TransferRequest<'_>,
            progress: ProgressSink,
        ) -> Result<RemoteObject, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress.report_percent(100);
            Ok(RemoteObject {
                url: request.target.url().to_string(),
                etag: None,
                size: request.file.size,
                content_type: request.file.mime_type.clone(),
                metadata: serde_json::Value::Null,
            })
        }
    }

    fn queue(config: UploadConfig, backend: Arc<dyn StorageBackend>) -> UploadQueue {
        let registry = Arc::new(UploadRegistry::new(Arc::new(PolicyValidator::from_config(
            &config,
        ))));
        UploadQueue::new(config, registry, TransferExecutor::new(backend), None)
    }

    fn file(name: &str) -> FileDescriptor {
        FileDescriptor::from_bytes(name, "image/png", vec![7; 16])
    }

    fn options() -> EnqueueOptions {
        EnqueueOptions::new(Destination::endpoint("http://localhost/upload"))
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_backs_off_exponentially_then_stays_in_error() {
        let backend = Arc::new(AlwaysFailing {
            started: Mutex::new(Vec::new()),
        });
        let config = UploadConfig {
            max_retries: 2,
            backoff_base_ms: 1_000,
            ..UploadConfig::default()
        };
        let queue = queue(config, backend.clone());

        let id = queue.enqueue(vec![file("a.png")], &options()).accepted[0];
        queue.wait_idle().await;

        let task = queue.registry().get_task(id).unwrap();
        assert_eq!(task.status, UploadStatus::Error);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error.unwrap().kind, ErrorKind::TransferFailed);

        let started = backend.started.lock().unwrap().clone();
        assert_eq!(started.len(), 3);
        assert!(started[1] - started[0] >= Duration::from_millis(1_000));
        assert!(started[2] - started[1] >= Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn user_retry_restarts_the_budget() {
        let backend = Arc::new(AlwaysFailing {
            started: Mutex::new(Vec::new()),
        });
        let config = UploadConfig {
            max_retries: 0,
            ..UploadConfig::default()
        };
        let queue = queue(config, backend.clone());

        let id = queue.enqueue(vec![file("a.png")], &options()).accepted[0];
        queue.wait_idle().await;
        assert_eq!(
            queue.registry().get_task(id).unwrap().status,
            UploadStatus::Error
        );

        let reopened = queue.retry(id).unwrap();
        assert_eq!(reopened.retry_count, 0);
        queue.wait_idle().await;
        assert_eq!(backend.started.lock().unwrap().len(), 2);
        assert!(matches!(
            queue.retry(TaskId::new(42)),
            Err(UploadError::Logic(_))
        ));
    }

    #[tokio::test]
    async fn presigned_destination_without_cache_fails_the_task() {
        let backend = Arc::new(ImmediateSuccess {
            calls: AtomicUsize::new(0),
        });
        let config = UploadConfig {
            max_retries: 0,
            ..UploadConfig::default()
        };
        let queue = queue(config, backend.clone());

        let id = queue
            .enqueue(
                vec![file("a.png")],
                &EnqueueOptions::new(Destination::presigned("content-1")),
            )
            .accepted[0];
        queue.wait_idle().await;

        let task = queue.registry().get_task(id).unwrap();
        assert_eq!(task.status, UploadStatus::Error);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_on_terminal_task_is_a_no_op() {
        let backend = Arc::new(ImmediateSuccess {
            calls: AtomicUsize::new(0),
        });
        let queue = queue(UploadConfig::default(), backend);

        let id = queue.enqueue(vec![file("a.png")], &options()).accepted[0];
        queue.wait_idle().await;

        let task = queue.cancel(id).await.unwrap();
        assert_eq!(task.status, UploadStatus::Done);
        assert_eq!(task.progress, 100);
        assert!(matches!(
            queue.cancel(TaskId::new(99)).await,
            Err(UploadError::Logic(_))
        ));
    }
}
