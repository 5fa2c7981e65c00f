//! Per-bucket and global rate limit bookkeeping.
//!
//! Buckets are created the first time a response for them carries rate limit headers and are
//! refreshed by every later response. A request first passes the global lock (held only while a
//! platform-wide throttle is being served), then its bucket's gate, where it sleeps if the last
//! response said the bucket is empty.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use reqwest::header::{HeaderMap, DATE};
use tokio::time::Instant;

use super::routing::BucketKey;

const REMAINING: &str = "x-ratelimit-remaining";
const RESET: &str = "x-ratelimit-reset";
const GLOBAL: &str = "x-ratelimit-global";
const RETRY_AFTER: &str = "retry-after";

/// Added on top of every computed cooldown to absorb clock skew.
pub const COOLDOWN_MARGIN: Duration = Duration::from_millis(500);

/// Used when a global throttle doesn't say how long to back off.
const DEFAULT_GLOBAL_DELAY: Duration = Duration::from_secs(1);

/// The rate limit headers of one response.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    pub remaining: u64,
    pub reset: DateTime<Utc>,
    /// Server clock at the time of the response.
    pub date: DateTime<Utc>,
}

impl RateLimitHeaders {
    /// Returns `None` when the response carries no (or unusable) rate limit information.
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let remaining = header_str(headers, REMAINING)?.trim().parse::<u64>().ok()?;

        let reset_secs = header_str(headers, RESET)?.trim().parse::<f64>().ok()?;
        let reset = Utc
            .timestamp_millis_opt((reset_secs * 1000.0) as i64)
            .single()?;

        let date = header_str(headers, DATE.as_str())
            .and_then(|raw| DateTime::parse_from_rfc2822(raw.trim()).ok())
            .map(|date| date.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(Self {
            remaining,
            reset,
            date,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Whether a response announces a platform-wide throttle, and for how long.
pub fn global_throttle(headers: &HeaderMap) -> Option<Duration> {
    let flag = header_str(headers, GLOBAL)?;
    if flag.trim().eq_ignore_ascii_case("false") {
        return None;
    }

    let delay = header_str(headers, RETRY_AFTER)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .unwrap_or(DEFAULT_GLOBAL_DELAY);

    Some(delay)
}

#[derive(Debug, Default)]
struct BucketState {
    limits: Option<RateLimitHeaders>,
    /// Local time the limits were recorded, to account for time already waited.
    observed: Option<Instant>,
}

/// Cooldown state for one bucket.
#[derive(Debug)]
pub struct CooldownBucket {
    key: BucketKey,
    state: Mutex<BucketState>,
    gate: tokio::sync::Mutex<()>,
}

impl CooldownBucket {
    pub fn new(key: BucketKey) -> Self {
        Self {
            key,
            state: Mutex::new(BucketState::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    /// Requests left in the current window, once a response has told us.
    pub fn remaining(&self) -> Option<u64> {
        self.state().limits.as_ref().map(|limits| limits.remaining)
    }

    pub fn update(&self, limits: RateLimitHeaders) {
        let mut state = self.state();
        state.limits = Some(limits);
        state.observed = Some(Instant::now());
    }

    /// Whether the next request on this bucket has to wait for the window to reset.
    pub fn will_throttle(&self) -> bool {
        self.pending_cooldown().is_some()
    }

    /// Time left until the window resets, if the bucket is exhausted.
    fn pending_cooldown(&self) -> Option<Duration> {
        let state = self.state();
        let limits = state.limits.as_ref()?;
        if limits.remaining > 0 {
            return None;
        }

        let window = (limits.reset - limits.date).to_std().ok()?;
        let waited = state.observed.map(|at| at.elapsed()).unwrap_or_default();
        window.checked_sub(waited).filter(|left| !left.is_zero())
    }

    /// Sleeps out the rest of the window plus [`COOLDOWN_MARGIN`] and returns how long that was.
    ///
    /// Afterwards the remaining count is unknown again until the next response comes back.
    pub async fn cooldown(&self) -> Duration {
        let Some(left) = self.pending_cooldown() else {
            return Duration::ZERO;
        };

        let delay = left + COOLDOWN_MARGIN;
        debug!("Cooling bucket {} for {:?}", self.key, delay);
        tokio::time::sleep(delay).await;

        self.state().limits = None;
        delay
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Where the [`RateLimiter`] keeps its buckets.
pub trait BucketStore: Send + Sync {
    fn get(&self, key: &BucketKey) -> Option<Arc<CooldownBucket>>;

    fn get_or_insert(&self, key: &BucketKey) -> Arc<CooldownBucket>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: DashMap<BucketKey, Arc<CooldownBucket>>,
}

impl BucketStore for InMemoryBucketStore {
    fn get(&self, key: &BucketKey) -> Option<Arc<CooldownBucket>> {
        self.buckets.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_insert(&self, key: &BucketKey) -> Arc<CooldownBucket> {
        let entry = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CooldownBucket::new(key.clone())));
        Arc::clone(entry.value())
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }
}

pub struct RateLimiter {
    buckets: Box<dyn BucketStore>,
    global: tokio::sync::Mutex<()>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(InMemoryBucketStore::default())
    }
}

impl RateLimiter {
    pub fn new(store: impl BucketStore + 'static) -> Self {
        Self {
            buckets: Box::new(store),
            global: tokio::sync::Mutex::new(()),
        }
    }

    pub fn bucket(&self, key: &BucketKey) -> Option<Arc<CooldownBucket>> {
        self.buckets.get(key)
    }

    pub fn buckets(&self) -> &dyn BucketStore {
        self.buckets.as_ref()
    }

    /// Returns immediately unless a global throttle is being served.
    pub async fn wait_global(&self) {
        let _released = self.global.lock().await;
    }

    /// Waits out the bucket's cooldown if it's exhausted; returns the time spent sleeping.
    pub async fn cooldown_bucket(&self, key: &BucketKey) -> Duration {
        let Some(bucket) = self.buckets.get(key) else {
            return Duration::ZERO;
        };

        let _gate = bucket.gate.lock().await;
        if bucket.will_throttle() {
            bucket.cooldown().await
        } else {
            Duration::ZERO
        }
    }

    /// Everything a request has to wait for before it may go out.
    pub async fn acquire(&self, key: &BucketKey) -> Duration {
        self.wait_global().await;
        let waited = self.cooldown_bucket(key).await;
        if !waited.is_zero() {
            debug!("Bucket {} cooled down", key);
        }
        waited
    }

    /// Feeds a response's headers back into its bucket.
    ///
    /// A global throttle keeps the global lock for the announced delay, which stalls every other
    /// request at [`wait_global`](Self::wait_global) until it's over.
    pub async fn update_bucket(&self, key: &BucketKey, headers: &HeaderMap) {
        if let Some(limits) = RateLimitHeaders::parse(headers) {
            self.buckets.get_or_insert(key).update(limits);
        }

        if let Some(delay) = global_throttle(headers) {
            warn!("Global rate limit hit by {}, pausing all requests for {:?}", key, delay);
            let _held = self.global.lock().await;
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::routing::Method;
    use reqwest::header::HeaderValue;

    const DATE_HEADER: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
    const DATE_EPOCH: i64 = 1_445_412_480;

    fn headers(remaining: u64, reset_in: i64) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(DATE, HeaderValue::from_static(DATE_HEADER));
        map.insert(REMAINING, HeaderValue::from(remaining));
        map.insert(RESET, HeaderValue::from(DATE_EPOCH + reset_in));
        map
    }

    fn key() -> BucketKey {
        BucketKey::new(Method::Post, "/channels/1/messages")
    }

    #[test]
    fn parses_rate_limit_headers() {
        let limits = RateLimitHeaders::parse(&headers(3, 5)).unwrap();
        assert_eq!(limits.remaining, 3);
        assert_eq!((limits.reset - limits.date).num_seconds(), 5);
    }

    #[test]
    fn fractional_reset_is_accepted() {
        let mut map = headers(0, 0);
        map.insert(RESET, HeaderValue::from_static("1445412482.250"));
        let limits = RateLimitHeaders::parse(&map).unwrap();
        assert_eq!((limits.reset - limits.date).num_milliseconds(), 2250);
    }

    #[test]
    fn missing_headers_leave_state_alone() {
        assert!(RateLimitHeaders::parse(&HeaderMap::new()).is_none());

        let mut only_date = HeaderMap::new();
        only_date.insert(DATE, HeaderValue::from_static(DATE_HEADER));
        assert!(RateLimitHeaders::parse(&only_date).is_none());
    }

    #[tokio::test]
    async fn headerless_response_does_not_create_or_corrupt_buckets() {
        let limiter = RateLimiter::default();
        limiter.update_bucket(&key(), &HeaderMap::new()).await;
        assert!(limiter.buckets().is_empty());

        limiter.update_bucket(&key(), &headers(0, 5)).await;
        limiter.update_bucket(&key(), &HeaderMap::new()).await;
        let bucket = limiter.bucket(&key()).unwrap();
        assert_eq!(bucket.remaining(), Some(0));
        assert!(bucket.will_throttle());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_until_reset() {
        let limiter = RateLimiter::default();
        limiter.update_bucket(&key(), &headers(0, 5)).await;
        assert!(limiter.bucket(&key()).unwrap().will_throttle());

        let start = Instant::now();
        let waited = limiter.acquire(&key()).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(waited, Duration::from_millis(5500));

        // The window is spent, the next caller goes straight through.
        assert!(!limiter.bucket(&key()).unwrap().will_throttle());
        assert_eq!(limiter.acquire(&key()).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_with_quota_left_does_not_wait() {
        let limiter = RateLimiter::default();
        limiter.update_bucket(&key(), &headers(4, 5)).await;
        assert!(!limiter.bucket(&key()).unwrap().will_throttle());
        assert_eq!(limiter.acquire(&key()).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn time_already_passed_counts_against_cooldown() {
        let limiter = RateLimiter::default();
        limiter.update_bucket(&key(), &headers(0, 5)).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(limiter.acquire(&key()).await, Duration::from_millis(2500));

        limiter.update_bucket(&key(), &headers(0, 2)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!limiter.bucket(&key()).unwrap().will_throttle());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_buckets_do_not_block_each_other() {
        let limiter = Arc::new(RateLimiter::default());
        let other = BucketKey::new(Method::Post, "/channels/2/messages");
        limiter.update_bucket(&key(), &headers(0, 30)).await;

        let slow = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(&key()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = Instant::now();
        assert_eq!(limiter.acquire(&other).await, Duration::ZERO);
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(slow.await.unwrap() >= Duration::from_secs(30));
    }

    #[test]
    fn global_flag_and_retry_after() {
        let mut map = HeaderMap::new();
        assert_eq!(global_throttle(&map), None);

        map.insert(GLOBAL, HeaderValue::from_static("true"));
        map.insert(RETRY_AFTER, HeaderValue::from_static("2000"));
        assert_eq!(global_throttle(&map), Some(Duration::from_secs(2)));

        map.insert(GLOBAL, HeaderValue::from_static("false"));
        assert_eq!(global_throttle(&map), None);
    }

    #[tokio::test(start_paused = true)]
    async fn global_throttle_stalls_every_caller() {
        let limiter = Arc::new(RateLimiter::default());
        let mut map = HeaderMap::new();
        map.insert(GLOBAL, HeaderValue::from_static("true"));
        map.insert(RETRY_AFTER, HeaderValue::from_static("2000"));

        let start = Instant::now();
        let throttled = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.update_bucket(&key(), &map).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let unrelated = BucketKey::new(Method::Get, "/guilds/9");
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let unrelated = unrelated.clone();
                tokio::spawn(async move {
                    limiter.acquire(&unrelated).await;
                    Instant::now()
                })
            })
            .collect();

        for waiter in waiters {
            let released_at = waiter.await.unwrap();
            assert!(released_at - start >= Duration::from_secs(2));
        }
        throttled.await.unwrap();
    }
}
