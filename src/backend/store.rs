use crate::backend::{Backend, Decision, WindowInput, WindowOutput};
use crate::window::WindowKey;
use actix_web::rt::time::timeout;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_STORE_TIMEOUT_MILLIS: u64 = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Counter store did not respond within {0:?}")]
    Timeout(Duration),
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        ::redis::RedisError,
    ),
    #[error("Counter store error: {0}")]
    Backend(String),
}

/// An external counter service shared by every process instance.
///
/// Implementations must make [CounterStore::increment] and [CounterStore::decrement] atomic on
/// the store side; callers never read-modify-write a counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter, creating it at 0 first if absent, and return the new value.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Decrement the counter. Must not create a counter that never expires.
    async fn decrement(&self, key: &str) -> Result<(), StoreError>;

    /// Set or refresh the counter's time-to-live.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    async fn set(&self, key: &str, value: u64, ttl_seconds: u64) -> Result<(), StoreError>;

    /// Current connectivity signal. Requests skip the store entirely while this is false.
    fn is_available(&self) -> bool;

    /// Called when a call to the store outlived the caller's deadline and was abandoned.
    ///
    /// The abandoned call never completes, so a store tracking its own health should count this
    /// as a failure.
    fn timed_out(&self) {}

    /// Increment the counter, making sure a newly created counter expires.
    ///
    /// The default increments, and whoever observes a count of 1 sets the expiry. Concurrent
    /// first writers may both do so, which is harmless. A failed expiry is retried once and then
    /// only logged, it never fails the request.
    ///
    /// Stores with an atomic increment-with-expiry primitive should override this.
    async fn increment_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let count = self.increment(key).await?;
        if count == 1 {
            if let Err(e) = self.expire(key, ttl_seconds).await {
                log::debug!("Unable to set expiry for rate limit key {key}: {e}, retrying");
                if let Err(e) = self.expire(key, ttl_seconds).await {
                    log::warn!("Rate limit key {key} may have been left without an expiry: {e}");
                }
            }
        }
        Ok(count)
    }
}

/// A fixed window [Backend] counting in a [CounterStore].
///
/// Every store call is bounded by a timeout.
#[derive(Clone)]
pub struct DistributedCounter {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl DistributedCounter {
    pub fn new(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_available()
    }

    pub async fn get(&self, key: &WindowKey) -> Result<Option<u64>, StoreError> {
        self.bounded(self.store.get(key.as_str())).await
    }

    pub async fn set(
        &self,
        key: &WindowKey,
        value: u64,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        self.bounded(self.store.set(key.as_str(), value, ttl_seconds))
            .await
    }

    async fn bounded<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match timeout(self.timeout, f).await {
            Ok(result) => result,
            Err(_) => {
                self.store.timed_out();
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

impl Backend<WindowInput> for DistributedCounter {
    type Output = WindowOutput;
    type RollbackToken = WindowKey;
    type Error = StoreError;

    async fn request(
        &self,
        input: WindowInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let ttl = input.window.ttl_seconds();
        let count = self
            .bounded(self.store.increment_with_expiry(input.key.as_str(), ttl))
            .await?;
        let output = WindowOutput {
            count,
            reset_at: input.window.reset_at(input.now_millis),
        };
        Ok((
            Decision::from_count(count, input.max_requests),
            output,
            input.key,
        ))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        self.bounded(self.store.decrement(token.as_str())).await
    }
}
