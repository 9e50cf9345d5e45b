//! Upload task registry - the single owner of task state
//!
//! Every mutation goes through this type, re-checks the task's current
//! status under the lock, and then pushes a fresh snapshot to observers.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LogicError, TaskError, ValidationError};
use crate::observe::{lock, Observers, Subscription};
use crate::task::{Destination, FileDescriptor, RemoteObject, TaskId, UploadStatus, UploadTask};
use crate::validate::FileValidator;

/// Options applied to every file of one `enqueue` call.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub destination: Destination,
}

impl EnqueueOptions {
    pub fn new(destination: Destination) -> Self {
        EnqueueOptions { destination }
    }
}

/// Per-file outcome of `enqueue`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnqueueReport {
    /// Ids of accepted files, in input order.
    pub accepted: Vec<TaskId>,
    pub rejected: Vec<ValidationError>,
}

/// What `request_cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending and is now canceled.
    Canceled,
    /// The task is uploading; its cancel token has been fired.
    Signaled,
    /// The task was already terminal; nothing changed.
    AlreadyTerminal(UploadStatus),
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<TaskId, UploadTask>,
    next_id: u64,
}

impl RegistryState {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut UploadTask, LogicError> {
        self.tasks.get_mut(&id).ok_or(LogicError::NotFound(id))
    }

    /// Tasks in FIFO order: creation time, then id.
    fn ordered(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }
}

pub struct UploadRegistry {
    state: Mutex<RegistryState>,
    validator: Arc<dyn FileValidator>,
    observers: Observers<Vec<UploadTask>>,
    changed: Notify,
}

impl UploadRegistry {
    pub fn new(validator: Arc<dyn FileValidator>) -> Self {
        UploadRegistry {
            state: Mutex::new(RegistryState::default()),
            validator,
            observers: Observers::new(),
            changed: Notify::new(),
        }
    }

    /// Validate each file and create a pending task for every accepted one.
    pub fn enqueue(&self, files: Vec<FileDescriptor>, options: &EnqueueOptions) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        let snapshot = {
            let mut state = lock(&self.state);
            for file in files {
                if let Err(rejection) = self.validator.validate(&file) {
                    info!("upload_rejected: {}", rejection);
                    report.rejected.push(rejection);
                    continue;
                }
                state.next_id += 1;
                let id = TaskId::new(state.next_id);
                debug!(
                    "upload_enqueued: {} name={} size={}",
                    id, file.name, file.size
                );
                state
                    .tasks
                    .insert(id, UploadTask::new(id, file, options.destination.clone()));
                report.accepted.push(id);
            }
            if report.accepted.is_empty() {
                return report;
            }
            self.snapshot_locked(&state)
        };
        self.publish(snapshot);
        report
    }

    pub fn get_task(&self, id: TaskId) -> Option<UploadTask> {
        lock(&self.state).tasks.get(&id).cloned()
    }

    pub fn list_by_status(&self, status: UploadStatus) -> Vec<UploadTask> {
        let state = lock(&self.state);
        state
            .ordered()
            .into_iter()
            .filter(|task| task.status == status)
            .collect()
    }

    /// All tasks in FIFO order.
    pub fn snapshot(&self) -> Vec<UploadTask> {
        lock(&self.state).ordered()
    }

    /// Pending tasks whose backoff has elapsed, in FIFO order.
    pub fn ready_pending(&self, now: Instant) -> Vec<UploadTask> {
        let state = lock(&self.state);
        state
            .ordered()
            .into_iter()
            .filter(|task| task.is_ready(now))
            .collect()
    }

    /// Earliest `retry_at` among backed-off pending tasks.
    pub fn next_retry_at(&self) -> Option<Instant> {
        let state = lock(&self.state);
        state
            .tasks
            .values()
            .filter(|task| task.status == UploadStatus::Pending)
            .filter_map(|task| task.retry_at)
            .min()
    }

    pub fn update_status(&self, id: TaskId, status: UploadStatus) -> Result<UploadTask, LogicError> {
        self.mutate(id, |task| {
            transition(task, status)?;
            Ok(true)
        })
    }

    /// Record transfer progress. Values below the current progress are stale
    /// reports and are ignored.
    pub fn update_progress(&self, id: TaskId, percent: u8) -> Result<UploadTask, LogicError> {
        self.mutate(id, |task| {
            if task.status.is_terminal() {
                return Err(LogicError::Terminal {
                    id,
                    status: task.status,
                });
            }
            if percent > 100 {
                return Err(LogicError::InvalidProgress { id, percent });
            }
            if task.status != UploadStatus::Uploading {
                return Err(LogicError::InvalidTransition {
                    id,
                    from: task.status,
                    to: UploadStatus::Uploading,
                });
            }
            if percent <= task.progress {
                return Ok(false);
            }
            task.progress = percent;
            Ok(true)
        })
    }

    /// Move an uploading task to `error` with the given reason.
    pub fn set_error(&self, id: TaskId, error: TaskError) -> Result<UploadTask, LogicError> {
        self.mutate(id, |task| {
            transition(task, UploadStatus::Error)?;
            task.error = Some(error);
            Ok(true)
        })
    }

    /// Move an uploading task to `done`, recording the created object.
    pub fn complete(&self, id: TaskId, remote: RemoteObject) -> Result<UploadTask, LogicError> {
        self.mutate(id, |task| {
            transition(task, UploadStatus::Done)?;
            task.remote = Some(remote);
            Ok(true)
        })
    }

    /// Automatic retry: `error -> pending`, progress back to 0 and one more
    /// attempt counted. The task is not promoted before `retry_at`.
    pub fn retry(&self, id: TaskId, retry_at: Option<Instant>) -> Result<UploadTask, LogicError> {
        self.mutate(id, |task| {
            reopen(task)?;
            task.retry_count += 1;
            task.retry_at = retry_at;
            Ok(true)
        })
    }

    /// Put a failed attempt straight back in the queue: `uploading -> pending`
    /// with the failure kept as the last error, one more attempt counted and
    /// a not-before instant. If the cancel token already fired, the task is
    /// canceled instead.
    pub fn requeue(
        &self,
        id: TaskId,
        error: TaskError,
        retry_at: Option<Instant>,
    ) -> Result<UploadTask, LogicError> {
        self.mutate(id, |task| {
            if task.status != UploadStatus::Uploading {
                return Err(if task.status.is_terminal() {
                    LogicError::Terminal {
                        id,
                        status: task.status,
                    }
                } else {
                    LogicError::InvalidTransition {
                        id,
                        from: task.status,
                        to: UploadStatus::Pending,
                    }
                });
            }
            if task.cancel.is_cancelled() {
                transition(task, UploadStatus::Canceled)?;
                return Ok(true);
            }
            task.status = UploadStatus::Pending;
            task.progress = 0;
            task.error = Some(error);
            task.retry_count += 1;
            task.retry_at = retry_at;
            Ok(true)
        })
    }

    /// User-initiated retry of a failed task: like `retry`, but the retry
    /// budget starts over.
    pub fn restart(&self, id: TaskId) -> Result<UploadTask, LogicError> {
        self.mutate(id, |task| {
            reopen(task)?;
            task.retry_count = 0;
            task.error = None;
            Ok(true)
        })
    }

    /// Cancel a pending task immediately, or signal an uploading one.
    pub fn request_cancel(&self, id: TaskId) -> Result<CancelOutcome, LogicError> {
        let mut outcome = CancelOutcome::Canceled;
        let result = self.mutate(id, |task| match task.status {
            UploadStatus::Pending => {
                task.cancel.cancel();
                transition(task, UploadStatus::Canceled)?;
                Ok(true)
            }
            UploadStatus::Uploading => {
                task.cancel.cancel();
                outcome = CancelOutcome::Signaled;
                Ok(false)
            }
            status => {
                outcome = CancelOutcome::AlreadyTerminal(status);
                Ok(false)
            }
        });
        result.map(|_| outcome)
    }

    /// Resolve once the task is terminal. A task that is removed while
    /// waiting yields `NotFound`.
    pub async fn wait_terminal(&self, id: TaskId) -> Result<UploadTask, LogicError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get_task(id) {
                None => return Err(LogicError::NotFound(id)),
                Some(task) if task.status.is_terminal() => return Ok(task),
                Some(_) => {}
            }
            notified.await;
        }
    }

    /// Resolve once `predicate` holds for the current task list.
    pub async fn wait_until<F>(&self, mut predicate: F)
    where
        F: FnMut(&[UploadTask]) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate(&self.snapshot()) {
                return;
            }
            notified.await;
        }
    }

    /// Delete a task. A task that is not yet terminal is cancelled first and
    /// removed once it reaches a terminal state.
    pub async fn remove(&self, id: TaskId) -> Result<UploadTask, LogicError> {
        if let CancelOutcome::Signaled = self.request_cancel(id)? {
            debug!("upload_remove: {} waiting for cancellation", id);
        }
        self.wait_terminal(id).await?;

        let (removed, snapshot) = {
            let mut state = lock(&self.state);
            let task = state.task_mut(id)?;
            // Re-check: a retry may have reopened the task since it settled
            if !task.status.is_terminal() {
                return Err(LogicError::InvalidTransition {
                    id,
                    from: task.status,
                    to: UploadStatus::Canceled,
                });
            }
            let removed = state.tasks.remove(&id).ok_or(LogicError::NotFound(id))?;
            (removed, self.snapshot_locked(&state))
        };
        info!("upload_removed: {} status={}", id, removed.status);
        self.publish(snapshot);
        Ok(removed)
    }

    /// Drop terminal tasks that finished more than `older_than` ago.
    pub fn sweep_finished(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let (removed, snapshot) = {
            let mut state = lock(&self.state);
            let before = state.tasks.len();
            state.tasks.retain(|_, task| {
                !(task.status.is_terminal() && task.finished_at.is_some_and(|at| at <= cutoff))
            });
            let removed = before - state.tasks.len();
            if removed == 0 {
                return 0;
            }
            (removed, self.snapshot_locked(&state))
        };
        debug!("upload_sweep: removed {} finished tasks", removed);
        self.publish(snapshot);
        removed
    }

    /// Register a listener for the full task list. It is called once right
    /// away and then after every mutation. Listeners must not call mutating
    /// registry or queue operations synchronously.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Vec<UploadTask>) + Send + Sync + 'static,
    {
        let current = self.snapshot();
        listener(&current);
        self.observers.subscribe(listener)
    }

    /// Fired after every mutation, observers included.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    fn mutate<F>(&self, id: TaskId, apply: F) -> Result<UploadTask, LogicError>
    where
        F: FnOnce(&mut UploadTask) -> Result<bool, LogicError>,
    {
        let (task, snapshot) = {
            let mut state = lock(&self.state);
            let task = state.task_mut(id)?;
            let before = task.status;
            let changed = apply(task)?;
            let task = task.clone();
            if !changed {
                return Ok(task);
            }
            if before != task.status {
                match task.error.as_ref() {
                    Some(err) if task.status == UploadStatus::Error => {
                        warn!("upload_status: {} -> {} error={}", id, task.status, err.message)
                    }
                    _ => info!("upload_status: {} -> {}", id, task.status),
                }
            }
            (task, self.snapshot_locked(&state))
        };
        self.publish(snapshot);
        Ok(task)
    }

    fn snapshot_locked(&self, state: &RegistryState) -> Option<Vec<UploadTask>> {
        if self.observers.is_empty() {
            None
        } else {
            Some(state.ordered())
        }
    }

    fn publish(&self, snapshot: Option<Vec<UploadTask>>) {
        if let Some(snapshot) = snapshot {
            self.observers.notify(&snapshot);
        }
        self.changed.notify_waiters();
    }
}

fn transition(task: &mut UploadTask, next: UploadStatus) -> Result<(), LogicError> {
    if task.status.is_terminal() {
        return Err(LogicError::Terminal {
            id: task.id,
            status: task.status,
        });
    }
    if !task.status.can_transition_to(next) {
        return Err(LogicError::InvalidTransition {
            id: task.id,
            from: task.status,
            to: next,
        });
    }
    task.status = next;
    match next {
        UploadStatus::Uploading => task.retry_at = None,
        UploadStatus::Done => {
            task.progress = 100;
            task.error = None;
            task.finished_at = Some(Utc::now());
        }
        UploadStatus::Error | UploadStatus::Canceled => task.finished_at = Some(Utc::now()),
        UploadStatus::Pending => {}
    }
    Ok(())
}

fn reopen(task: &mut UploadTask) -> Result<(), LogicError> {
    if task.status != UploadStatus::Error {
        return Err(LogicError::InvalidTransition {
            id: task.id,
            from: task.status,
            to: UploadStatus::Pending,
        });
    }
    task.status = UploadStatus::Pending;
    task.progress = 0;
    task.finished_at = None;
    task.remote = None;
    task.cancel = CancellationToken::new();
    Ok(())
}
