//! Presigned URL cache
//!
//! Entries are served only while `now < expires_at - safety_margin`.
//! Refreshes for the same `(resource_id, operation)` share one in-flight
//! future held in a pending-refresh table; the table entry is cleared when
//! the refresh settles, whether it succeeded or failed.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::RefreshError;
use crate::observe::{lock, Observers, Subscription};
use crate::presign::PresignSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlOperation {
    Read,
    Write,
}

impl UrlOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlOperation::Read => "read",
            UrlOperation::Write => "write",
        }
    }
}

impl fmt::Display for UrlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlEntry {
    pub resource_id: String,
    pub operation: UrlOperation,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl PresignedUrlEntry {
    pub fn is_usable(&self, now: DateTime<Utc>, safety_margin: chrono::Duration) -> bool {
        self.expires_at
            .checked_sub_signed(safety_margin)
            .is_some_and(|deadline| now < deadline)
    }
}

type CacheKey = (String, UrlOperation);
type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

struct PendingRefresh {
    id: u64,
    future: SharedRefresh,
}

struct CacheInner {
    source: Arc<dyn PresignSource>,
    clock: Arc<dyn Clock>,
    safety_margin: chrono::Duration,
    expires_in_secs: u64,
    entries: Mutex<HashMap<CacheKey, PresignedUrlEntry>>,
    // Lock order: `pending` before `entries`
    pending: Mutex<HashMap<CacheKey, PendingRefresh>>,
    next_refresh_id: AtomicU64,
    observers: Observers<Vec<PresignedUrlEntry>>,
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct PresignedUrlCache {
    inner: Arc<CacheInner>,
}

impl PresignedUrlCache {
    pub fn new(
        source: Arc<dyn PresignSource>,
        clock: Arc<dyn Clock>,
        safety_margin: chrono::Duration,
        expires_in_secs: u64,
    ) -> Self {
        PresignedUrlCache {
            inner: Arc::new(CacheInner {
                source,
                clock,
                safety_margin,
                expires_in_secs,
                entries: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_refresh_id: AtomicU64::new(0),
                observers: Observers::new(),
            }),
        }
    }

    /// Cached URL while it is still inside its safe window, otherwise a
    /// fresh one from the presign source.
    pub async fn get(&self, resource_id: &str, operation: UrlOperation) -> Result<String, RefreshError> {
        if let Some(url) = self.usable(resource_id, operation) {
            return Ok(url);
        }
        self.refresh(resource_id, operation).await
    }

    /// Fetch a new URL and overwrite the entry. Concurrent calls for the same
    /// key join the refresh already in flight.
    pub async fn refresh(&self, resource_id: &str, operation: UrlOperation) -> Result<String, RefreshError> {
        let key: CacheKey = (resource_id.to_string(), operation);
        let future = {
            let mut pending = lock(&self.inner.pending);
            match pending.get(&key) {
                Some(existing) => {
                    debug!("presign_join: {} {}", resource_id, operation);
                    existing.future.clone()
                }
                None => {
                    let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let future = run_refresh(self.inner.clone(), key.clone(), id)
                        .boxed()
                        .shared();
                    pending.insert(
                        key,
                        PendingRefresh {
                            id,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };
        future.await
    }

    /// Remove the entry for one operation, or every entry of the resource.
    /// Refreshes already in flight for those keys will not write back.
    pub fn invalidate(&self, resource_id: &str, operation: Option<UrlOperation>) -> usize {
        let matches =
            |key: &CacheKey| key.0 == resource_id && operation.is_none_or(|op| op == key.1);
        let (removed, snapshot) = {
            let mut pending = lock(&self.inner.pending);
            pending.retain(|key, _| !matches(key));
            let mut entries = lock(&self.inner.entries);
            let before = entries.len();
            entries.retain(|key, _| !matches(key));
            let removed = before - entries.len();
            (removed, snapshot_of(&entries))
        };
        if removed > 0 {
            info!("presign_invalidate: {} removed={}", resource_id, removed);
            self.inner.observers.notify(&snapshot);
        }
        removed
    }

    /// Drop entries that are past `expires_at`.
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now();
        let (removed, snapshot) = {
            let mut entries = lock(&self.inner.entries);
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at > now);
            let removed = before - entries.len();
            (removed, snapshot_of(&entries))
        };
        if removed > 0 {
            debug!("presign_sweep: removed {} expired entries", removed);
            self.inner.observers.notify(&snapshot);
        }
        removed
    }

    /// Run `sweep` every `period` until the returned handle is aborted.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                cache.sweep();
            }
        })
    }

    pub fn entry(&self, resource_id: &str, operation: UrlOperation) -> Option<PresignedUrlEntry> {
        lock(&self.inner.entries)
            .get(&(resource_id.to_string(), operation))
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<PresignedUrlEntry> {
        snapshot_of(&lock(&self.inner.entries))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener for the cache contents. Called once right away
    /// and after every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Vec<PresignedUrlEntry>) + Send + Sync + 'static,
    {
        listener(&self.snapshot());
        self.inner.observers.subscribe(listener)
    }

    fn usable(&self, resource_id: &str, operation: UrlOperation) -> Option<String> {
        let now = self.inner.clock.now();
        let entries = lock(&self.inner.entries);
        entries
            .get(&(resource_id.to_string(), operation))
            .filter(|entry| entry.is_usable(now, self.inner.safety_margin))
            .map(|entry| entry.url.clone())
    }
}

fn snapshot_of(entries: &HashMap<CacheKey, PresignedUrlEntry>) -> Vec<PresignedUrlEntry> {
    let mut list: Vec<PresignedUrlEntry> = entries.values().cloned().collect();
    list.sort_by(|a, b| {
        a.resource_id
            .cmp(&b.resource_id)
            .then(a.operation.as_str().cmp(b.operation.as_str()))
    });
    list
}

async fn run_refresh(inner: Arc<CacheInner>, key: CacheKey, id: u64) -> Result<String, RefreshError> {
    let (resource_id, operation) = (&key.0, key.1);
    // Expiry counts from before the request so latency only shortens the window
    let issued_at = inner.clock.now();
    let result = inner
        .source
        .presign(resource_id, inner.expires_in_secs, operation)
        .await
        .and_then(|presigned| {
            let expires_at = expiry_after(issued_at, presigned.expires_in).ok_or_else(|| {
                RefreshError {
                    resource_id: resource_id.clone(),
                    operation,
                    status: None,
                    message: format!("expiresIn {} is out of range", presigned.expires_in),
                }
            })?;
            Ok((presigned.url, expires_at))
        });

    let snapshot = {
        let mut pending = lock(&inner.pending);
        let current = pending.get(&key).is_some_and(|p| p.id == id);
        if current {
            pending.remove(&key);
        }

        match &result {
            Ok((url, expires_at)) if current => {
                let mut entries = lock(&inner.entries);
                entries.insert(
                    key.clone(),
                    PresignedUrlEntry {
                        resource_id: resource_id.clone(),
                        operation,
                        url: url.clone(),
                        expires_at: *expires_at,
                    },
                );
                debug!(
                    "presign_refreshed: {} {} expires_at={}",
                    resource_id, operation, expires_at
                );
                Some(snapshot_of(&entries))
            }
            Ok(_) => {
                debug!(
                    "presign_detached: {} {} invalidated while in flight",
                    resource_id, operation
                );
                None
            }
            Err(e) => {
                warn!("presign_failed: {} {} error={}", resource_id, operation, e);
                None
            }
        }
    };
    if let Some(snapshot) = snapshot {
        inner.observers.notify(&snapshot);
    }

    result.map(|(url, _)| url)
}

/// `None` when `expires_in` does not fit a timestamp.
fn expiry_after(issued_at: DateTime<Utc>, expires_in: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(expires_in).ok()?;
    issued_at.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::presign::PresignedUrl;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Counts calls; each call waits for `release` when `gated` is set.
    struct CountingSource {
        calls: AtomicUsize,
        expires_in: u64,
        fail: std::sync::atomic::AtomicBool,
        gated: bool,
        release: Notify,
    }

    impl CountingSource {
        fn new(expires_in: u64) -> Arc<Self> {
            Arc::new(CountingSource {
                calls: AtomicUsize::new(0),
                expires_in,
                fail: std::sync::atomic::AtomicBool::new(false),
                gated: false,
                release: Notify::new(),
            })
        }

        fn gated(expires_in: u64) -> Arc<Self> {
            Arc::new(CountingSource {
                calls: AtomicUsize::new(0),
                expires_in,
                fail: std::sync::atomic::AtomicBool::new(false),
                gated: true,
                release: Notify::new(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PresignSource for CountingSource {
        async fn presign(
            &self,
            resource_id: &str,
            _expires_in_secs: u64,
            operation: UrlOperation,
        ) -> Result<PresignedUrl, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.gated {
                self.release.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(RefreshError {
                    resource_id: resource_id.to_string(),
                    operation,
                    status: Some(500),
                    message: "metadata service down".to_string(),
                });
            }
            Ok(PresignedUrl {
                url: format!("https://files.example.com/{}?op={}&v={}", resource_id, operation, n),
                expires_in: self.expires_in,
            })
        }
    }

    fn cache(source: Arc<CountingSource>, clock: &ManualClock) -> PresignedUrlCache {
        PresignedUrlCache::new(
            source,
            Arc::new(clock.clone()),
            chrono::Duration::seconds(30),
            3600,
        )
    }

    fn clock() -> ManualClock {
        ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }

    #[tokio::test]
    async fn get_inside_safe_window_never_refreshes() {
        let source = CountingSource::new(120);
        let clock = clock();
        let cache = cache(source.clone(), &clock);

        let first = cache.get("attachment-1", UrlOperation::Read).await.unwrap();
        clock.advance(chrono::Duration::seconds(60));
        let second = cache.get("attachment-1", UrlOperation::Read).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn entry_inside_safety_margin_is_refreshed() {
        let source = CountingSource::new(40);
        let clock = clock();
        let cache = cache(source.clone(), &clock);

        let first = cache.get("attachment-1", UrlOperation::Read).await.unwrap();
        // 10s left before expiry, margin is 30s
        clock.advance(chrono::Duration::seconds(30));
        let second = cache.get("attachment-1", UrlOperation::Read).await.unwrap();

        assert_ne!(first, second);
        assert!(second.ends_with("v=2"));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_fetch() {
        let source = CountingSource::gated(600);
        let clock = clock();
        let cache = cache(source.clone(), &clock);

        let a = cache.refresh("slider-3", UrlOperation::Read);
        let b = cache.refresh("slider-3", UrlOperation::Read);
        let c = cache.refresh("slider-3", UrlOperation::Write);
        let release = async {
            tokio::task::yield_now().await;
            source.release.notify_waiters();
        };
        let (a, b, c, _) = tokio::join!(a, b, c, release);

        assert_eq!(a.unwrap(), b.unwrap());
        assert!(c.unwrap().contains("op=write"));
        assert_eq!(source.calls(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_stale_entry_untouched() {
        let source = CountingSource::new(40);
        let clock = clock();
        let cache = cache(source.clone(), &clock);

        cache.get("attachment-9", UrlOperation::Read).await.unwrap();
        let stale = cache.entry("attachment-9", UrlOperation::Read).unwrap();
        clock.advance(chrono::Duration::seconds(20));
        source.fail.store(true, Ordering::SeqCst);

        let err = cache.get("attachment-9", UrlOperation::Read).await.unwrap_err();
        assert_eq!(err.status, Some(500));
        assert_eq!(cache.entry("attachment-9", UrlOperation::Read), Some(stale));

        // The pending slot was cleared, so the next call fetches again
        source.fail.store(false, Ordering::SeqCst);
        cache.get("attachment-9", UrlOperation::Read).await.unwrap();
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn out_of_range_expiry_is_a_refresh_error() {
        let source = CountingSource::new(10_000_000_000_000_000);
        let clock = clock();
        let cache = cache(source.clone(), &clock);

        let err = cache.get("content-8", UrlOperation::Write).await.unwrap_err();
        assert_eq!(err.resource_id, "content-8");
        assert_eq!(err.status, None);
        assert!(err.message.contains("out of range"));
        assert!(cache.is_empty());

        // Nothing was cached, so the next call asks again
        assert!(cache.get("content-8", UrlOperation::Write).await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn expiry_after_rejects_values_past_the_timestamp_range() {
        let now = clock().now();
        assert_eq!(
            expiry_after(now, 60),
            Some(now + chrono::Duration::seconds(60))
        );
        assert_eq!(expiry_after(now, u64::MAX), None);
        assert_eq!(expiry_after(now, i64::MAX as u64), None);
    }

    #[test]
    fn oversized_margin_makes_entries_unusable() {
        let now = clock().now();
        let entry = PresignedUrlEntry {
            resource_id: "content-8".to_string(),
            operation: UrlOperation::Read,
            url: "https://cdn.example.com/content-8".to_string(),
            expires_at: now + chrono::Duration::seconds(600),
        };
        assert!(entry.is_usable(now, chrono::Duration::seconds(30)));
        assert!(!entry.is_usable(now, chrono::Duration::MAX));
    }

    #[tokio::test]
    async fn invalidate_during_refresh_discards_result() {
        let source = CountingSource::gated(600);
        let clock = clock();
        let cache = cache(source.clone(), &clock);

        let refresh = cache.refresh("content-5", UrlOperation::Read);
        let invalidate = async {
            tokio::task::yield_now().await;
            cache.invalidate("content-5", None);
            source.release.notify_waiters();
        };
        let (url, _) = tokio::join!(refresh, invalidate);

        assert!(url.is_ok());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_and_sweep_remove_entries() {
        let source = CountingSource::new(100);
        let clock = clock();
        let cache = cache(source.clone(), &clock);

        cache.get("a", UrlOperation::Read).await.unwrap();
        cache.get("a", UrlOperation::Write).await.unwrap();
        cache.get("b", UrlOperation::Read).await.unwrap();

        assert_eq!(cache.invalidate("a", Some(UrlOperation::Write)), 1);
        assert!(cache.entry("a", UrlOperation::Read).is_some());

        clock.advance(chrono::Duration::seconds(99));
        assert_eq!(cache.sweep(), 0);
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_refreshed_entries() {
        let source = CountingSource::new(100);
        let clock = clock();
        let cache = cache(source, &clock);
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sizes_clone = sizes.clone();
        let _subscription = cache.subscribe(move |entries| {
            sizes_clone.lock().unwrap().push(entries.len());
        });

        cache.get("a", UrlOperation::Read).await.unwrap();
        cache.invalidate("a", None);

        assert_eq!(*sizes.lock().unwrap(), vec![0, 1, 0]);
    }
}
