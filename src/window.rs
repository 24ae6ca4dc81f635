use std::fmt::{Display, Formatter};
use std::time::Duration;

/// A fixed length counting interval, aligned to the Unix epoch.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Window {
    millis: u64,
}

impl Window {
    /// Returns `None` for windows shorter than one millisecond.
    pub fn new(length: Duration) -> Option<Self> {
        let millis = u64::try_from(length.as_millis()).ok()?;
        (millis > 0).then_some(Self { millis })
    }

    pub fn length(&self) -> Duration {
        Duration::from_millis(self.millis)
    }

    /// Start of the bucket containing `now_millis`.
    ///
    /// Every instant in `[start, start + length)` maps to the same value.
    pub fn start(&self, now_millis: u64) -> u64 {
        (now_millis / self.millis) * self.millis
    }

    /// The instant the bucket containing `now_millis` closes.
    pub fn reset_at(&self, now_millis: u64) -> u64 {
        self.start(now_millis).saturating_add(self.millis)
    }

    /// Store TTL for a counter in this window, rounded upwards to whole seconds.
    pub fn ttl_seconds(&self) -> u64 {
        (self.millis + 999) / 1000
    }
}

/// Composite counter key: `scope:key:windowStart`.
///
/// Two requests share a key iff they share a policy scope, a resolved key and a bucket.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WindowKey(String);

impl WindowKey {
    pub fn new(scope: &str, key: &str, window_start: u64) -> Self {
        Self(format!("{scope}:{key}:{window_start}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WindowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
