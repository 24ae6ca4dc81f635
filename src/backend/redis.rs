use crate::backend::store::{CounterStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BITFIELD_ENCODING: &str = "u63";
const BITFIELD_OFFSET: u8 = 0;

pub const DEFAULT_RETRY_INTERVAL_SECONDS: u64 = 5;

/// A [CounterStore] backed by Redis (7.0 or later, for `EXPIRE .. NX`).
///
/// Counters are stored as saturating unsigned bitfields, so a late decrement can never take a
/// counter below zero.
///
/// Availability follows the outcome of the most recent command: after a failure the store
/// reports itself unavailable for the retry interval, after which one request is let through to
/// probe it again.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    health: Arc<Health>,
}

impl RedisCounterStore {
    /// Create a Builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_window_throttle::backend::redis::RedisCounterStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisCounterStore::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECONDS),
        }
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }

    fn observe<T>(&self, result: RedisResult<T>) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                self.health.succeeded();
                Ok(value)
            }
            Err(e) => {
                self.health.failed();
                Err(e.into())
            }
        }
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    retry_interval: Duration,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    /// How long the store is skipped after a failed command.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn build(self) -> RedisCounterStore {
        RedisCounterStore {
            connection: self.connection,
            key_prefix: self.key_prefix,
            health: Arc::new(Health::new(self.retry_interval)),
        }
    }
}

struct Health {
    origin: Instant,
    // Millis since `origin` of the last failure, plus one. Zero while healthy.
    failed_at: AtomicU64,
    retry_interval: u64,
}

impl Health {
    fn new(retry_interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            failed_at: AtomicU64::new(0),
            retry_interval: retry_interval.as_millis() as u64,
        }
    }

    fn elapsed(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn is_available(&self) -> bool {
        let failed_at = self.failed_at.load(Ordering::Acquire);
        if failed_at == 0 {
            return true;
        }
        let now = self.elapsed() + 1;
        if now < failed_at + self.retry_interval {
            return false;
        }
        // Only the request that claims the slot probes, the rest wait for another interval
        self.failed_at
            .compare_exchange(failed_at, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn succeeded(&self) {
        if self.failed_at.swap(0, Ordering::AcqRel) != 0 {
            log::info!("Redis rate limit store recovered");
        }
    }

    fn failed(&self) {
        if self.failed_at.swap(self.elapsed() + 1, Ordering::AcqRel) == 0 {
            log::warn!(
                "Redis rate limit store failed, counting locally for the next {}ms",
                self.retry_interval
            );
        }
    }
}

fn first(counts: Vec<u64>) -> Result<u64, StoreError> {
    counts
        .first()
        .copied()
        .ok_or_else(|| StoreError::Backend("BITFIELD returned no value".to_owned()))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let key = self.make_key(key);
        let mut cmd = redis::cmd("BITFIELD");
        cmd.arg(key.as_ref())
            .arg("OVERFLOW")
            .arg("SAT")
            .arg("INCRBY")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(1);
        let mut con = self.connection.clone();
        let result = cmd.query_async::<_, Vec<u64>>(&mut con).await;
        first(self.observe(result)?)
    }

    async fn decrement(&self, key: &str) -> Result<(), StoreError> {
        let key = self.make_key(key);

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Decrement the rate limit count
            .cmd("BITFIELD")
            .arg(key.as_ref())
            .arg("OVERFLOW")
            .arg("SAT")
            .arg("INCRBY")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(-1)
            .ignore()
            // The counter may have expired already, in which case the decrement just created it
            // without an expiry; delete it immediately.
            .cmd("EXPIRE")
            .arg(key.as_ref())
            .arg(0)
            .arg("NX")
            .ignore();

        let mut con = self.connection.clone();
        let result = pipe.query_async::<_, ()>(&mut con).await;
        self.observe(result)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let key = self.make_key(key);
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key.as_ref()).arg(ttl_seconds);
        let mut con = self.connection.clone();
        let result = cmd.query_async::<_, i64>(&mut con).await;
        self.observe(result).map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let key = self.make_key(key);
        let mut pipe = redis::pipe();
        pipe.cmd("EXISTS")
            .arg(key.as_ref())
            .cmd("BITFIELD")
            .arg(key.as_ref())
            .arg("GET")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET);
        let mut con = self.connection.clone();
        let result = pipe.query_async::<_, (bool, Vec<u64>)>(&mut con).await;
        let (exists, counts) = self.observe(result)?;
        if !exists {
            return Ok(None);
        }
        first(counts).map(Some)
    }

    async fn set(&self, key: &str, value: u64, ttl_seconds: u64) -> Result<(), StoreError> {
        let key = self.make_key(key);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(key.as_ref())
            .ignore()
            .cmd("BITFIELD")
            .arg(key.as_ref())
            .arg("SET")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(value)
            .ignore()
            .cmd("EXPIRE")
            .arg(key.as_ref())
            .arg(ttl_seconds)
            .ignore();
        let mut con = self.connection.clone();
        let result = pipe.query_async::<_, ()>(&mut con).await;
        self.observe(result)
    }

    fn is_available(&self) -> bool {
        self.health.is_available()
    }

    fn timed_out(&self) {
        self.health.failed();
    }

    /// Increments and sets the expiry (only if the key doesn't already have one) in a single
    /// transaction, so a counter can never be left without an expiry.
    async fn increment_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let key = self.make_key(key);

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Increment the rate limit count
            .cmd("BITFIELD")
            .arg(key.as_ref())
            .arg("OVERFLOW")
            .arg("SAT")
            .arg("INCRBY")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(1)
            // Set the key to expire (only if it doesn't already have an expiry)
            .cmd("EXPIRE")
            .arg(key.as_ref())
            .arg(ttl_seconds)
            .arg("NX")
            .ignore();

        let mut con = self.connection.clone();
        let result = pipe.query_async::<_, (Vec<u64>,)>(&mut con).await;
        let (counts,) = self.observe(result)?;
        first(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    // Each test must use non-overlapping keys (because the tests may be run concurrently)
    // Each test should also reset its key on each run, so that it is in a clean state.
    async fn make_store(clear_test_key: &str) -> Builder {
        let host = option_env!("REDIS_HOST").unwrap_or("127.0.0.1");
        let port = option_env!("REDIS_PORT").unwrap_or("6379");
        let client = redis::Client::open(format!("redis://{host}:{port}")).unwrap();
        let mut manager = ConnectionManager::new(client).await.unwrap();
        manager.del::<_, ()>(clear_test_key).await.unwrap();
        RedisCounterStore::builder(manager)
    }

    #[actix_web::test]
    async fn test_increment_with_expiry() {
        let key = "test_increment_with_expiry";
        let store = make_store(key).await.build();
        assert_eq!(store.increment_with_expiry(key, 60).await.unwrap(), 1);
        assert_eq!(store.increment_with_expiry(key, 60).await.unwrap(), 2);
        let mut con = store.connection.clone();
        let ttl: i64 = con.ttl(key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60);
        assert!(store.is_available());
    }

    #[actix_web::test]
    async fn test_increment_then_expire() {
        let key = "test_increment_then_expire";
        let store = make_store(key).await.build();
        assert_eq!(store.increment(key).await.unwrap(), 1);
        store.expire(key, 30).await.unwrap();
        // Expiring twice with the same value is harmless
        store.expire(key, 30).await.unwrap();
        let mut con = store.connection.clone();
        let ttl: i64 = con.ttl(key).await.unwrap();
        assert!(ttl > 0 && ttl <= 30);
    }

    #[actix_web::test]
    async fn test_decrement() {
        let key = "test_decrement";
        let store = make_store(key).await.build();
        store.increment_with_expiry(key, 60).await.unwrap();
        store.increment_with_expiry(key, 60).await.unwrap();
        store.decrement(key).await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), Some(1));
    }

    #[actix_web::test]
    async fn test_decrement_key_gone() {
        let key = "test_decrement_key_gone";
        let store = make_store(key).await.build();
        // The rollback could happen after the key has already expired / gone
        store.decrement(key).await.unwrap();
        // In which case it must not be left behind
        assert_eq!(store.get(key).await.unwrap(), None);
    }

    #[actix_web::test]
    async fn test_set_and_get() {
        let key = "test_set_and_get";
        let store = make_store(key).await.build();
        assert_eq!(store.get(key).await.unwrap(), None);
        store.set(key, 7, 60).await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), Some(7));
        assert_eq!(store.increment_with_expiry(key, 60).await.unwrap(), 8);
    }

    #[actix_web::test]
    async fn test_key_prefix() {
        let store = make_store("prefix:test_key_prefix")
            .await
            .key_prefix(Some("prefix:"))
            .build();
        let mut con = store.connection.clone();
        store.increment_with_expiry("test_key_prefix", 60).await.unwrap();
        assert!(con
            .exists::<_, bool>("prefix:test_key_prefix")
            .await
            .unwrap());
    }

    #[test]
    fn test_health() {
        let health = Health::new(Duration::from_secs(60));
        assert!(health.is_available());
        health.failed();
        assert!(!health.is_available());
        health.succeeded();
        assert!(health.is_available());

        let health = Health::new(Duration::ZERO);
        health.failed();
        // Probed again straight away
        assert!(health.is_available());
    }

    #[test]
    fn test_health_single_probe() {
        let health = Health::new(Duration::from_millis(5));
        health.failed();
        std::thread::sleep(Duration::from_millis(20));
        let probes = (0..3).filter(|_| health.is_available()).count();
        assert_eq!(probes, 1);

        // A failed probe closes the store again
        health.failed();
        assert!(!health.is_available());
        std::thread::sleep(Duration::from_millis(20));
        assert!(health.is_available());
        health.succeeded();
        assert!(health.is_available());
        assert!(health.is_available());
    }

    #[actix_web::test]
    async fn test_timeout_marks_unavailable() {
        let store = make_store("test_timeout_marks_unavailable").await.build();
        assert!(store.is_available());
        store.timed_out();
        assert!(!store.is_available());
    }
}
