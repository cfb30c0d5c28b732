use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use super::route::Route;
use super::transport::HttpResponse;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("bucket {0} is already locked")]
    AlreadyLocked(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Longest wait taken from a server-supplied reset or retry value
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60 * 60);

/// Convert server-supplied seconds into a wait, clamped to `[0, MAX_RATE_LIMIT_WAIT]`.
pub fn wait_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(wait) if wait <= MAX_RATE_LIMIT_WAIT => wait,
        _ => {
            warn!("server asked for a {}s wait, capping at {:?}", seconds, MAX_RATE_LIMIT_WAIT);
            MAX_RATE_LIMIT_WAIT
        }
    }
}

/// Rate-limit headers of one response. Absent headers stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<f64>,
    pub global: bool,
}

impl RateLimitHeaders {
    pub fn from_response(response: &HttpResponse) -> Self {
        let parse = |name: &str| response.header(name).and_then(|value| value.trim().parse().ok());
        Self {
            bucket: response.header("x-ratelimit-bucket").map(str::to_string),
            limit: parse("x-ratelimit-limit"),
            remaining: parse("x-ratelimit-remaining"),
            reset_after: response
                .header("x-ratelimit-reset-after")
                .and_then(|value| value.trim().parse().ok()),
            global: response
                .header("x-ratelimit-global")
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    bucket_hash: Option<String>,
    limit: u32,
    remaining: u32,
    reset_after: f64,
}

/// Budget of one server-side rate-limit group.
///
/// A bucket starts with a concurrency of one until the first response reveals its
/// real limit. While locked for a duration no caller gets through, regardless of
/// free concurrency slots.
pub struct RateLimitBucket {
    key: String,
    state: Mutex<BucketState>,
    semaphore: Mutex<Arc<Semaphore>>,
    locked: Arc<watch::Sender<bool>>,
    last_used: Mutex<Instant>,
}

impl RateLimitBucket {
    pub fn new(key: impl Into<String>) -> Self {
        let (locked, _) = watch::channel(false);
        Self {
            key: key.into(),
            state: Mutex::new(BucketState {
                bucket_hash: None,
                limit: 1,
                remaining: 1,
                reset_after: 0.0,
            }),
            semaphore: Mutex::new(Arc::new(Semaphore::new(1))),
            locked: Arc::new(locked),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket_hash(&self) -> Option<String> {
        lock(&self.state).bucket_hash.clone()
    }

    pub fn limit(&self) -> u32 {
        lock(&self.state).limit
    }

    pub fn remaining(&self) -> u32 {
        lock(&self.state).remaining
    }

    pub fn reset_after(&self) -> f64 {
        lock(&self.state).reset_after
    }

    /// Free concurrency slots right now
    pub fn available_permits(&self) -> usize {
        lock(&self.semaphore).available_permits()
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    pub async fn wait_unlocked(&self) {
        let mut locked = self.locked.subscribe();
        // the sender lives as long as the bucket
        let _ = locked.wait_for(|locked| !*locked).await;
    }

    /// Wait out any lock, then take one concurrency slot.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        loop {
            self.wait_unlocked().await;

            let semaphore = lock(&self.semaphore).clone();
            let Ok(permit) = semaphore.acquire_owned().await else {
                // replaced after a limit change
                continue;
            };
            if self.is_locked() {
                drop(permit);
                continue;
            }

            *lock(&self.last_used) = Instant::now();
            return permit;
        }
    }

    /// Lock the bucket for `duration`. With `block` the call returns once the lock
    /// lifts, otherwise it returns immediately and the unlock happens in the background.
    pub async fn lock_for_duration(&self, duration: Duration, block: bool) -> Result<(), RateLimitError> {
        let acquired = self.locked.send_if_modified(|locked| {
            if *locked {
                false
            } else {
                *locked = true;
                true
            }
        });
        if !acquired {
            return Err(RateLimitError::AlreadyLocked(self.key.clone()));
        }

        warn!(bucket = %self.key, "rate limit bucket locked for {:?}", duration);
        let locked = self.locked.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            time::sleep(duration).await;
            locked.send_replace(false);
            debug!(bucket = %key, "rate limit bucket unlocked");
        });

        if block {
            self.wait_unlocked().await;
        }
        Ok(())
    }

    /// Take the server's view of this bucket. Present headers overwrite the stored
    /// values; a changed limit resizes the concurrency slots.
    pub fn ingest_headers(&self, headers: &RateLimitHeaders) {
        let mut state = lock(&self.state);
        if let Some(bucket) = &headers.bucket {
            state.bucket_hash = Some(bucket.clone());
        }
        if let Some(remaining) = headers.remaining {
            state.remaining = remaining;
        }
        if let Some(reset_after) = headers.reset_after {
            state.reset_after = reset_after;
        }
        if let Some(limit) = headers.limit {
            if limit != state.limit && limit > 0 {
                debug!(bucket = %self.key, "bucket limit {} -> {}", state.limit, limit);
                state.limit = limit;
                let old = std::mem::replace(
                    &mut *lock(&self.semaphore),
                    Arc::new(Semaphore::new(limit as usize)),
                );
                old.close();
            }
        }
    }
}

/// Process-wide map of buckets.
///
/// Routes are first keyed by their own route key; once a response reveals the
/// server's bucket hash the route is remapped so every route sharing that hash
/// shares one bucket. Buckets nobody holds are swept after they sit idle.
pub struct BucketRegistry {
    route_hashes: Mutex<HashMap<String, String>>,
    buckets: Mutex<HashMap<String, Arc<RateLimitBucket>>>,
    idle_after: Duration,
    last_sweep: Mutex<Instant>,
}

impl BucketRegistry {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            route_hashes: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            idle_after,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    fn map_key(&self, route: &Route) -> String {
        let route_key = route.key();
        let hash = lock(&self.route_hashes)
            .get(&route_key)
            .cloned()
            .unwrap_or(route_key);
        format!("{}:{}", hash, route.major_parameters())
    }

    pub fn resolve(&self, route: &Route) -> Arc<RateLimitBucket> {
        self.maybe_sweep();
        let key = self.map_key(route);
        lock(&self.buckets)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RateLimitBucket::new(key)))
            .clone()
    }

    /// Remap `route` to the bucket hash its response revealed, returning the bucket
    /// callers should use from now on.
    pub fn record_hash(&self, route: &Route, hash: &str, current: &Arc<RateLimitBucket>) -> Arc<RateLimitBucket> {
        let route_key = route.key();
        let previous = lock(&self.route_hashes).insert(route_key, hash.to_string());
        if previous.as_deref() == Some(hash) {
            return current.clone();
        }

        let key = format!("{}:{}", hash, route.major_parameters());
        debug!(route = %route, "route mapped to bucket {}", key);
        lock(&self.buckets)
            .entry(key)
            .or_insert_with(|| current.clone())
            .clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.buckets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maybe_sweep(&self) {
        {
            let mut last_sweep = lock(&self.last_sweep);
            if last_sweep.elapsed() < self.idle_after {
                return;
            }
            *last_sweep = Instant::now();
        }
        self.sweep();
    }

    /// Drop buckets that are idle, unlocked and referenced only by the map; returns how many.
    pub fn sweep(&self) -> usize {
        let mut buckets = lock(&self.buckets);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1 || bucket.is_locked() || bucket.idle_for() < self.idle_after
        });
        let removed = before - buckets.len();
        if removed > 0 {
            debug!("evicted {} idle rate limit buckets", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(limit: u32, remaining: u32, reset_after: f64) -> RateLimitHeaders {
        RateLimitHeaders {
            bucket: Some("abcd".into()),
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(reset_after),
            global: false,
        }
    }

    #[test]
    fn test_wait_duration_is_clamped() {
        assert_eq!(wait_duration(0.25), Duration::from_millis(250));
        assert_eq!(wait_duration(-3.0), Duration::ZERO);
        assert_eq!(wait_duration(f64::NAN), Duration::ZERO);
        assert_eq!(wait_duration(f64::INFINITY), MAX_RATE_LIMIT_WAIT);
        assert_eq!(wait_duration(1e300), MAX_RATE_LIMIT_WAIT);
        assert_eq!(wait_duration(7200.0), MAX_RATE_LIMIT_WAIT);
    }

    #[test]
    fn test_last_ingest_wins() {
        let bucket = RateLimitBucket::new("GET /x:");
        for (limit, remaining) in [(5, 4), (5, 3), (10, 9), (3, 0)] {
            bucket.ingest_headers(&headers(limit, remaining, 1.5));
        }

        assert_eq!(bucket.remaining(), 0);
        assert_eq!(bucket.limit(), 3);
        assert_eq!(bucket.available_permits(), 3);
        assert_eq!(bucket.bucket_hash().as_deref(), Some("abcd"));
    }

    #[test]
    fn test_partial_headers_keep_previous_values() {
        let bucket = RateLimitBucket::new("GET /x:");
        bucket.ingest_headers(&headers(5, 4, 2.0));
        bucket.ingest_headers(&RateLimitHeaders {
            remaining: Some(2),
            ..Default::default()
        });

        assert_eq!(bucket.limit(), 5);
        assert_eq!(bucket.remaining(), 2);
        assert_eq!(bucket.reset_after(), 2.0);
    }

    #[test]
    fn test_headers_from_response() {
        let response = HttpResponse::new(
            200,
            [
                ("X-RateLimit-Bucket", "h1"),
                ("X-RateLimit-Limit", "5"),
                ("X-RateLimit-Remaining", "0"),
                ("X-RateLimit-Reset-After", "0.250"),
            ],
            "",
        );
        let parsed = RateLimitHeaders::from_response(&response);
        assert_eq!(parsed.bucket.as_deref(), Some("h1"));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(0));
        assert_eq!(parsed.reset_after, Some(0.25));
        assert!(!parsed.global);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_lock_is_rejected() {
        let bucket = RateLimitBucket::new("POST /y:");
        bucket.lock_for_duration(Duration::from_secs(2), false).await.unwrap();

        assert_eq!(
            bucket.lock_for_duration(Duration::from_secs(2), false).await,
            Err(RateLimitError::AlreadyLocked("POST /y:".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_unlock() {
        let bucket = Arc::new(RateLimitBucket::new("POST /y:"));
        let start = Instant::now();
        bucket.lock_for_duration(Duration::from_secs(2), false).await.unwrap();
        assert!(bucket.is_locked());

        let _permit = bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(!bucket.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_lock_returns_after_duration() {
        let bucket = RateLimitBucket::new("POST /y:");
        let start = Instant::now();
        bucket.lock_for_duration(Duration::from_millis(1500), true).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert!(!bucket.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_moves_to_resized_semaphore() {
        let bucket = Arc::new(RateLimitBucket::new("GET /z:"));
        let held = bucket.acquire().await;

        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire().await })
        };
        tokio::task::yield_now().await;
        bucket.ingest_headers(&headers(2, 1, 1.0));

        let permit = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(permit.is_ok());
        drop(held);
    }

    #[test]
    fn test_registry_shares_buckets_by_hash() {
        let registry = BucketRegistry::new(Duration::from_secs(300));
        let messages = Route::post("/channels/{channel_id}/messages").param("channel_id", 1);
        let edits = Route::patch("/channels/{channel_id}/messages/{message_id}")
            .param("channel_id", 1)
            .param("message_id", 2);

        let first = registry.resolve(&messages);
        let first = registry.record_hash(&messages, "shared", &first);
        let second = registry.resolve(&edits);
        let second = registry.record_hash(&edits, "shared", &second);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&registry.resolve(&edits), &first));
    }

    #[test]
    fn test_registry_partitions_by_major_parameter() {
        let registry = BucketRegistry::new(Duration::from_secs(300));
        let a = registry.resolve(&Route::get("/channels/{channel_id}").param("channel_id", 1));
        let b = registry.resolve(&Route::get("/channels/{channel_id}").param("channel_id", 2));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_unused_idle_buckets() {
        let registry = BucketRegistry::new(Duration::from_secs(60));
        let held = registry.resolve(&Route::get("/a"));
        drop(registry.resolve(&Route::get("/b")));
        assert_eq!(registry.len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.len(), 1);
        drop(held);
    }
}
