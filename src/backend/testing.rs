use crate::backend::store::{CounterStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An in-memory [CounterStore] with switches for simulating outages.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore(Arc<Inner>);

#[derive(Default)]
struct Inner {
    // key -> (value, ttl seconds)
    values: Mutex<HashMap<String, (i64, Option<u64>)>>,
    unavailable: AtomicBool,
    fail: AtomicBool,
    fail_expire: AtomicBool,
    delay_millis: AtomicU64,
    expire_calls: AtomicU64,
    increments: AtomicU64,
    racing_writers: AtomicU64,
    timeouts: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn set_available(&self, available: bool) {
        self.0.unavailable.store(!available, Ordering::SeqCst);
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.0.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_expire(&self, fail: bool) {
        self.0.fail_expire.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn delay(&self, delay: Duration) {
        self.0
            .delay_millis
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next `writers` increments each observe a fresh counter, as if they raced on a key
    /// that had just been created.
    pub(crate) fn race_first_writers(&self, writers: u64) {
        self.0.racing_writers.store(writers, Ordering::SeqCst);
    }

    pub(crate) fn timeouts(&self) -> u64 {
        self.0.timeouts.load(Ordering::SeqCst)
    }

    pub(crate) fn ttl(&self, key: &str) -> Option<u64> {
        self.0.values.lock().unwrap().get(key).and_then(|(_, ttl)| *ttl)
    }

    pub(crate) fn value(&self, key: &str) -> Option<i64> {
        self.0.values.lock().unwrap().get(key).map(|(v, _)| *v)
    }

    pub(crate) fn expire_calls(&self) -> u64 {
        self.0.expire_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn increments(&self) -> u64 {
        self.0.increments.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), StoreError> {
        let delay = self.0.delay_millis.load(Ordering::SeqCst);
        if delay > 0 {
            actix_web::rt::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.0.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection refused".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        self.check().await?;
        self.0.increments.fetch_add(1, Ordering::SeqCst);
        let mut values = self.0.values.lock().unwrap();
        let entry = values.entry(key.to_owned()).or_insert((0, None));
        let racing = self
            .0
            .racing_writers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        entry.0 = if racing { 1 } else { entry.0 + 1 };
        Ok(entry.0.max(0) as u64)
    }

    async fn decrement(&self, key: &str) -> Result<(), StoreError> {
        self.check().await?;
        if let Some(entry) = self.0.values.lock().unwrap().get_mut(key) {
            entry.0 = (entry.0 - 1).max(0);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        self.check().await?;
        self.0.expire_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_expire.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("expire failed".to_owned()));
        }
        if let Some(entry) = self.0.values.lock().unwrap().get_mut(key) {
            entry.1 = Some(ttl_seconds);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.check().await?;
        Ok(self.value(key).map(|v| v.max(0) as u64))
    }

    async fn set(&self, key: &str, value: u64, ttl_seconds: u64) -> Result<(), StoreError> {
        self.check().await?;
        self.0
            .values
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value as i64, Some(ttl_seconds)));
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.0.unavailable.load(Ordering::SeqCst)
    }

    fn timed_out(&self) {
        self.0.timeouts.fetch_add(1, Ordering::SeqCst);
        self.set_available(false);
    }
}
