use crate::backend::{Backend, Decision, WindowInput, WindowOutput};
use crate::window::{Window, WindowKey};
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// In-process fixed window counters, keyed by [WindowKey], stored in a
/// [Dashmap](dashmap::DashMap).
///
/// Each check-and-increment runs under the shard lock for its key, so concurrent requests for
/// one key are totally ordered and never both act on a stale count.
///
/// Expired counters are swept lazily by the requests themselves, at most once per sweep
/// interval.
#[derive(Clone)]
pub struct LocalCounterTable {
    map: Arc<DashMap<WindowKey, Counter>>,
    sweep_interval: u64,
    last_sweep: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Counter {
    count: u64,
    reset_at: u64,
}

impl Default for LocalCounterTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS))
    }
}

impl LocalCounterTable {
    /// # Arguments
    ///
    /// * `sweep_interval`: Minimum time between two scans for expired counters. Zero sweeps
    ///   before every request.
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            sweep_interval: sweep_interval.as_millis() as u64,
            last_sweep: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Atomically count one request against `key`, returning the new count and the time the
    /// counter expires.
    pub fn hit(&self, key: &WindowKey, window: Window, now_millis: u64) -> (u64, u64) {
        self.sweep(now_millis);
        let expiry = now_millis.saturating_add(window.length().as_millis() as u64);
        let mut counter = self.map.entry(key.clone()).or_insert_with(|| Counter {
            // If the counter doesn't exist, create it at 0 and count this request below.
            count: 0,
            reset_at: expiry,
        });
        if counter.reset_at < now_millis {
            // Expired but not yet swept, start over.
            counter.count = 0;
            counter.reset_at = expiry;
        }
        counter.count += 1;
        (counter.count, counter.reset_at)
    }

    /// Undo one [LocalCounterTable::hit]. The count never drops below zero.
    pub fn release(&self, key: &WindowKey) {
        if let Some(mut counter) = self.map.get_mut(key) {
            counter.count = counter.count.saturating_sub(1);
        }
    }

    pub fn count(&self, key: &WindowKey) -> Option<u64> {
        self.map.get(key).map(|c| c.count)
    }

    pub fn remove(&self, key: &WindowKey) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn sweep(&self, now_millis: u64) {
        let last = self.last_sweep.load(Ordering::Acquire);
        if now_millis.saturating_sub(last) < self.sweep_interval {
            return;
        }
        // Only one of the racing requests performs the scan.
        if self
            .last_sweep
            .compare_exchange(last, now_millis, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let before = self.map.len();
        self.map.retain(|_, c| c.reset_at >= now_millis);
        let removed = before.saturating_sub(self.map.len());
        if removed > 0 {
            log::debug!("Swept {removed} expired rate limit counters");
        }
    }
}

impl Backend<WindowInput> for LocalCounterTable {
    type Output = WindowOutput;
    type RollbackToken = WindowKey;
    type Error = Infallible;

    async fn request(
        &self,
        input: WindowInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let (count, _) = self.hit(&input.key, input.window, input.now_millis);
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
        self.release(&token);
        Ok(())
    }
}
