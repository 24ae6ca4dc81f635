pub mod engine;
pub mod memory;
#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;

pub use engine::{RollbackToken, Served, ThrottleEngine, ThrottleEngineBuilder, ThrottleInput, ThrottleOutput};
pub use memory::LocalCounterTable;
pub use store::{CounterStore, DistributedCounter, StoreError};

use crate::window::{Window, WindowKey};
use std::future::Future;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    /// The request that brings the count to exactly `max` is still allowed.
    pub fn from_count(count: u64, max: u64) -> Self {
        if count <= max {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes a counter store that makes a throttle decision per request.
///
/// A Backend is required to implement [Clone], usually this means wrapping the underlying store
/// within an [Arc](std::sync::Arc).
pub trait Backend<I: 'static>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Count an incoming request and decide whether it may proceed.
    ///
    /// Returns the decision, output describing the counter after this request, and a token
    /// allowing the increment to be reversed later.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::RollbackToken), Self::Error>>;

    /// Reverse the increment made by [Backend::request()].
    ///
    /// Used to stop successful requests counting against a client's limit, which we only learn
    /// after the request has already been allowed through.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// Input for a single counter store.
#[derive(Debug, Clone)]
pub struct WindowInput {
    /// The composite key of the counter to increment.
    pub key: WindowKey,
    /// The window the key belongs to.
    pub window: Window,
    /// The total requests to be allowed within the window.
    pub max_requests: u64,
    /// Wall clock time of the request.
    pub now_millis: u64,
}

/// Counter state after a [WindowInput] was counted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WindowOutput {
    /// Number of requests counted in this window, including this one.
    pub count: u64,
    /// Wall clock time (epoch millis) at which the window closes.
    pub reset_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_inclusive() {
        assert!(Decision::from_count(1, 5).is_allowed());
        assert!(Decision::from_count(5, 5).is_allowed());
        assert!(Decision::from_count(6, 5).is_denied());
    }
}
