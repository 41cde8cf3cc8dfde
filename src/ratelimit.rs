//! Flow control limiters.
//!
//! Two counters back the flow control filter: a token bucket local to this
//! process, and a fixed-window counter kept in Redis and shared by every
//! gateway node.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A limiter that admits or rejects one request at a time.
pub trait RateLimit: Send + Sync + fmt::Debug {
    /// Takes one permit. Returns `false` when the limit is exhausted.
    fn try_acquire(&self) -> bool;
}

/// Token bucket for rate limiting.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn available_tokens(&self) -> f64 {
        self.tokens
    }
}

/// In-process limiter admitting `permits` requests per `duration`, with a
/// burst of at most `permits`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    bucket: Mutex<TokenBucket>,
    permits: u64,
    duration: Duration,
}

impl TokenBucketLimiter {
    /// Creates a full bucket.
    pub fn new(permits: u64, duration: Duration) -> Self {
        let secs = duration.as_secs_f64().max(f64::EPSILON);
        Self {
            bucket: Mutex::new(TokenBucket::new(permits as f64, permits as f64 / secs)),
            permits,
            duration,
        }
    }

    /// Tokens currently in the bucket, rounded down.
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.available_tokens() as u64
    }

    /// Permits per window.
    pub fn permits(&self) -> u64 {
        self.permits
    }

    /// Window length.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl RateLimit for TokenBucketLimiter {
    fn try_acquire(&self) -> bool {
        self.bucket.lock().try_consume()
    }
}

const COUNT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
if current > tonumber(ARGV[1]) then
    return 0
end
return 1
"#;

/// Fixed-window counter shared through Redis.
///
/// Redis failures admit the request: losing the shared counter must not take
/// the gateway down with it. After a failure the limiter stops talking to
/// Redis for `reconnect_backoff` and admits right away, so an unreachable
/// server costs one connect timeout per backoff window instead of one per
/// request.
pub struct RedisCountLimiter {
    client: redis::Client,
    connection: Mutex<Option<redis::Connection>>,
    script: redis::Script,
    key: String,
    permits: u64,
    duration: Duration,
    connect_timeout: Duration,
    reconnect_backoff: Duration,
    retry_at: Mutex<Option<Instant>>,
}

impl RedisCountLimiter {
    /// Creates a limiter counting under `key`. Does not connect yet.
    pub fn new(url: &str, key: impl Into<String>, permits: u64, duration: Duration) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connection: Mutex::new(None),
            script: redis::Script::new(COUNT_SCRIPT),
            key: key.into(),
            permits,
            duration,
            connect_timeout: Duration::from_millis(500),
            reconnect_backoff: Duration::from_secs(1),
            retry_at: Mutex::new(None),
        })
    }

    /// Sets how long Redis is left alone after a failure.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Counter key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a recent failure keeps the limiter away from Redis.
    pub fn is_backing_off(&self) -> bool {
        matches!(*self.retry_at.lock(), Some(at) if Instant::now() < at)
    }

    fn back_off(&self) {
        *self.retry_at.lock() = Some(Instant::now() + self.reconnect_backoff);
    }

    /// `None` while backing off.
    fn count(&self) -> Option<redis::RedisResult<bool>> {
        if self.is_backing_off() {
            return None;
        }
        let mut slot = self.connection.lock();
        // requests queued behind a failed attempt skip Redis too
        if self.is_backing_off() {
            return None;
        }
        if slot.is_none() {
            match self.client.get_connection_with_timeout(self.connect_timeout) {
                Ok(conn) => {
                    debug!(key = %self.key, "connected flow control counter to redis");
                    *slot = Some(conn);
                }
                Err(e) => {
                    self.back_off();
                    return Some(Err(e));
                }
            }
        }
        let conn = slot.as_mut()?;
        let result = self
            .script
            .key(&self.key)
            .arg(self.permits)
            .arg(self.duration.as_secs().max(1))
            .invoke::<i64>(conn);
        Some(match result {
            Ok(admitted) => Ok(admitted == 1),
            Err(e) => {
                *slot = None;
                self.back_off();
                Err(e)
            }
        })
    }
}

impl RateLimit for RedisCountLimiter {
    fn try_acquire(&self) -> bool {
        match self.count() {
            Some(Ok(admitted)) => admitted,
            Some(Err(e)) => {
                warn!(
                    key = %self.key,
                    error = %e,
                    backoff_ms = self.reconnect_backoff.as_millis() as u64,
                    "redis flow control unavailable, admitting request"
                );
                true
            }
            None => true,
        }
    }
}

impl fmt::Debug for RedisCountLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCountLimiter")
            .field("key", &self.key)
            .field("permits", &self.permits)
            .field("duration", &self.duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_token_bucket_basic() {
        let mut bucket = TokenBucket::new(10.0, 10.0);

        for _ in 0..10 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
    }

    #[test]
    fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(10.0, 1000.0);
        for _ in 0..10 {
            bucket.try_consume();
        }

        bucket.last_update = Instant::now() - Duration::from_millis(100);
        bucket.refill();

        // ~100 tokens refilled, capped at capacity
        assert!(bucket.available_tokens() >= 9.0);
    }

    #[test]
    fn test_concurrent_acquire_admits_permits() {
        let limiter = Arc::new(TokenBucketLimiter::new(5, Duration::from_secs(1)));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || limiter.try_acquire())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_limiter_accessors() {
        let limiter = TokenBucketLimiter::new(3, Duration::from_secs(60));
        assert_eq!(limiter.permits(), 3);
        assert_eq!(limiter.duration(), Duration::from_secs(60));
        assert_eq!(limiter.available(), 3);
        limiter.try_acquire();
        assert_eq!(limiter.available(), 2);
    }

    #[test]
    fn test_redis_limiter_fails_open() {
        let limiter = RedisCountLimiter::new("redis://127.0.0.1:1/", "svc.path", 1, Duration::from_secs(1)).unwrap();
        assert_eq!(limiter.key(), "svc.path");
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_redis_limiter_backs_off_after_failure() {
        let limiter = Arc::new(
            RedisCountLimiter::new("redis://127.0.0.1:1/", "svc.path", 1, Duration::from_secs(1))
                .unwrap()
                .with_reconnect_backoff(Duration::from_secs(30)),
        );
        assert!(!limiter.is_backing_off());
        assert!(limiter.try_acquire());
        assert!(limiter.is_backing_off());

        let start = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || limiter.try_acquire())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_redis_limiter_retries_after_backoff() {
        let limiter = RedisCountLimiter::new("redis://127.0.0.1:1/", "k", 1, Duration::from_secs(1))
            .unwrap()
            .with_reconnect_backoff(Duration::from_millis(20));
        assert!(limiter.try_acquire());
        assert!(limiter.is_backing_off());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!limiter.is_backing_off());
        assert!(limiter.try_acquire());
        assert!(limiter.is_backing_off());
    }

    #[test]
    fn test_redis_limiter_rejects_bad_url() {
        assert!(RedisCountLimiter::new("not a url", "k", 1, Duration::from_secs(1)).is_err());
    }
}
