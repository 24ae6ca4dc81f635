use crate::backend::memory::{LocalCounterTable, DEFAULT_SWEEP_INTERVAL_SECONDS};
use crate::backend::store::{CounterStore, DistributedCounter, DEFAULT_STORE_TIMEOUT_MILLIS};
use crate::backend::{Backend, Decision, WindowInput, WindowOutput};
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::middleware::builder::HeaderCompatibleOutput;
use crate::policy::{Policy, PolicyName};
use crate::window::WindowKey;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Input for the [ThrottleEngine].
#[derive(Debug, Clone)]
pub struct ThrottleInput {
    /// The policy the request is throttled by.
    pub policy: Arc<Policy>,
    /// The resolved throttling key, see [resolve_key](crate::policy::resolve_key).
    pub key: String,
}

/// Which counter store served a request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Served {
    Distributed,
    Local,
}

/// Output from the [ThrottleEngine].
#[derive(Debug, Clone)]
pub struct ThrottleOutput {
    pub policy: PolicyName,
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Number of requests counted in this window, including this one.
    pub count: u64,
    /// Number of requests that will be permitted until the window resets.
    pub remaining: u64,
    /// Time remaining until the window resets.
    pub reset_after: Duration,
    pub served_by: Served,
}

impl HeaderCompatibleOutput for ThrottleOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the window resets (rounded upwards, so that it is guaranteed to be reset
    /// after waiting for the duration).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self.reset_after.as_millis() as u64;
        (millis + 999) / 1000
    }
}

/// Identifies the counter, and the store holding it, that a request was counted against.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RollbackToken {
    Distributed(WindowKey),
    Local(WindowKey),
}

/// The throttle decision engine.
///
/// Counts each request in the distributed store when the policy prefers it and the store is
/// available, otherwise in the [LocalCounterTable]. A request is counted in exactly one of the
/// two: any store failure or timeout sends the whole request down the local path, and the store
/// is not retried within the same request.
#[derive(Clone)]
pub struct ThrottleEngine {
    local: LocalCounterTable,
    distributed: Option<DistributedCounter>,
    clock: SharedClock,
}

impl ThrottleEngine {
    pub fn builder() -> ThrottleEngineBuilder {
        ThrottleEngineBuilder {
            store: None,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MILLIS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn local(&self) -> &LocalCounterTable {
        &self.local
    }

    /// Reverse the count of a request that completed successfully.
    ///
    /// Local counters are released immediately. Distributed counters are decremented in a
    /// spawned task so the response is not held up by the store.
    pub fn compensate(&self, token: RollbackToken) {
        match token {
            RollbackToken::Local(key) => self.local.release(&key),
            token @ RollbackToken::Distributed(_) => {
                let engine = self.clone();
                actix_web::rt::spawn(async move {
                    // Failures are logged by `rollback` itself
                    let _ = engine.rollback(token).await;
                });
            }
        }
    }

    /// Clears the current window's counter for `key` in both stores.
    pub async fn reset_key(&self, policy: &Policy, key: &str) {
        let now = self.clock.now_millis();
        let window_key = self.window_key(policy, key, now);
        self.local.remove(&window_key);
        if let Some(distributed) = self.usable_distributed(policy) {
            let ttl = policy.window().ttl_seconds();
            if let Err(e) = distributed.set(&window_key, 0, ttl).await {
                log::warn!("Unable to reset distributed rate limit count for {window_key}: {e}");
            }
        }
    }

    /// The number of requests counted for `key` in the current window.
    ///
    /// Reads the store a new request would be counted in.
    pub async fn current_count(&self, policy: &Policy, key: &str) -> u64 {
        let now = self.clock.now_millis();
        let window_key = self.window_key(policy, key, now);
        if let Some(distributed) = self.usable_distributed(policy) {
            match distributed.get(&window_key).await {
                Ok(count) => return count.unwrap_or(0),
                Err(e) => log::warn!("Unable to read distributed rate limit count: {e}"),
            }
        }
        self.local.count(&window_key).unwrap_or(0)
    }

    fn window_key(&self, policy: &Policy, key: &str, now_millis: u64) -> WindowKey {
        WindowKey::new(&policy.scope(), key, policy.window().start(now_millis))
    }

    fn usable_distributed(&self, policy: &Policy) -> Option<&DistributedCounter> {
        if !policy.prefer_distributed() {
            return None;
        }
        self.distributed.as_ref().filter(|d| d.is_available())
    }

    async fn count_distributed(
        &self,
        input: &WindowInput,
        policy: &Policy,
    ) -> Option<(Decision, WindowOutput, WindowKey)> {
        let distributed = self.usable_distributed(policy)?;
        match distributed.request(input.clone()).await {
            Ok(result) => Some(result),
            Err(e) => {
                log::warn!(
                    "Distributed rate limit store failed: {e}, counting {} locally",
                    input.key
                );
                None
            }
        }
    }
}

impl Backend<ThrottleInput> for ThrottleEngine {
    type Output = ThrottleOutput;
    type RollbackToken = RollbackToken;
    type Error = Infallible;

    async fn request(
        &self,
        input: ThrottleInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let policy = input.policy;
        let now = self.clock.now_millis();
        let window_input = WindowInput {
            key: self.window_key(&policy, &input.key, now),
            window: policy.window(),
            max_requests: policy.max(),
            now_millis: now,
        };

        let counted = self.count_distributed(&window_input, &policy).await;
        let (decision, output, token) = match counted {
            Some((decision, output, key)) => (decision, output, RollbackToken::Distributed(key)),
            None => {
                let (decision, output, key) = self.local.request(window_input).await?;
                (decision, output, RollbackToken::Local(key))
            }
        };

        let served_by = match token {
            RollbackToken::Distributed(_) => Served::Distributed,
            RollbackToken::Local(_) => Served::Local,
        };
        if decision.is_denied() {
            log::debug!(
                "Rate limit `{}` exceeded for {} ({} > {})",
                policy.name(),
                input.key,
                output.count,
                policy.max()
            );
        }
        let output = ThrottleOutput {
            policy: policy.name(),
            limit: policy.max(),
            count: output.count,
            remaining: policy.max().saturating_sub(output.count),
            reset_after: Duration::from_millis(output.reset_at.saturating_sub(now)),
            served_by,
        };
        Ok((decision, output, token))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        match token {
            RollbackToken::Local(key) => self.local.release(&key),
            RollbackToken::Distributed(key) => {
                if let Some(distributed) = &self.distributed {
                    if let Err(e) = distributed.rollback(key.clone()).await {
                        log::error!("Unable to rollback rate limit count for {key}: {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct ThrottleEngineBuilder {
    store: Option<Arc<dyn CounterStore>>,
    store_timeout: Duration,
    sweep_interval: Duration,
    clock: SharedClock,
}

impl ThrottleEngineBuilder {
    /// Count in a distributed store for policies that prefer it.
    ///
    /// Without one, every request is counted in-process.
    pub fn distributed<S>(mut self, store: S) -> Self
    where
        S: CounterStore + 'static,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Upper bound on each call to the distributed store, after which the request is counted
    /// locally instead.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Minimum time between two sweeps of expired local counters.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> ThrottleEngine {
        ThrottleEngine {
            local: LocalCounterTable::new(self.sweep_interval),
            distributed: self
                .store
                .map(|store| DistributedCounter::new(store, self.store_timeout)),
            clock: self.clock,
        }
    }
}
