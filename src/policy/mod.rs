pub mod key;
pub mod registry;

use crate::window::Window;
use actix_web::dev::ServiceRequest;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use key::{resolve_key, ClientIdentity, UNKNOWN_KEY};
pub use registry::PolicyRegistry;

/// Derives a throttling key from a request. An empty result defers to the next resolution step.
pub type KeyFn = Arc<dyn Fn(&ServiceRequest) -> String + Send + Sync>;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("Policy `{0}` must allow at least one request per window")]
    InvalidMax(PolicyName),
    #[error("Policy `{0}` must have a window of at least one millisecond")]
    InvalidWindow(PolicyName),
    #[error("Unknown rate limit policy `{0}`")]
    UnknownPolicy(String),
}

/// The named policies a call site can ask for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PolicyName {
    General,
    Auth,
    Places,
    User,
    Development,
}

impl PolicyName {
    pub const ALL: [PolicyName; 5] = [
        Self::General,
        Self::Auth,
        Self::Places,
        Self::User,
        Self::Development,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Auth => "auth",
            Self::Places => "places",
            Self::User => "user",
            Self::Development => "development",
        }
    }

    /// The `code` reported in a denial body.
    pub fn code(self) -> &'static str {
        match self {
            Self::General => "RATE_LIMIT_EXCEEDED",
            Self::Auth => "AUTH_RATE_LIMIT_EXCEEDED",
            Self::Places => "PLACES_RATE_LIMIT_EXCEEDED",
            Self::User => "USER_RATE_LIMIT_EXCEEDED",
            Self::Development => "DEV_RATE_LIMIT_EXCEEDED",
        }
    }
}

impl Display for PolicyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownPolicy(s.to_owned()))
    }
}

/// How the key is derived when no [KeyFn] is configured (or it yields nothing).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum KeyMode {
    /// The client's network address.
    #[default]
    Address,
    /// The authenticated [ClientIdentity] if present, else the network address.
    Identity,
}

/// A validated, immutable rate limit configuration.
///
/// Shared between concurrent requests behind an [Arc].
#[derive(Clone)]
pub struct Policy {
    name: PolicyName,
    window: Window,
    max: u64,
    message: String,
    key_mode: KeyMode,
    key_fn: Option<KeyFn>,
    skip_successful_requests: bool,
    prefer_distributed: bool,
}

impl Policy {
    /// # Arguments
    ///
    /// * `name`: Also determines the counter scope and the denial `code`.
    /// * `window`: The rate limiting interval.
    /// * `max`: The total requests to be allowed within the interval.
    pub fn builder(name: PolicyName, window: Duration, max: u64) -> PolicyBuilder {
        PolicyBuilder {
            name,
            window,
            max,
            message: "Too many requests, please try again later.".to_owned(),
            key_mode: KeyMode::Address,
            key_fn: None,
            skip_successful_requests: false,
            prefer_distributed: true,
        }
    }

    pub fn name(&self) -> PolicyName {
        self.name
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> &'static str {
        self.name.code()
    }

    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    pub fn key_fn(&self) -> Option<&KeyFn> {
        self.key_fn.as_ref()
    }

    pub fn skip_successful_requests(&self) -> bool {
        self.skip_successful_requests
    }

    pub fn prefer_distributed(&self) -> bool {
        self.prefer_distributed
    }

    /// Prefix for every counter key counted under this policy.
    pub fn scope(&self) -> String {
        format!("rl:{}", self.name)
    }
}

impl Debug for Policy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("window", &self.window.length())
            .field("max", &self.max)
            .field("key_mode", &self.key_mode)
            .field("key_fn", &self.key_fn.is_some())
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("prefer_distributed", &self.prefer_distributed)
            .finish()
    }
}

pub struct PolicyBuilder {
    name: PolicyName,
    window: Duration,
    max: u64,
    message: String,
    key_mode: KeyMode,
    key_fn: Option<KeyFn>,
    skip_successful_requests: bool,
    prefer_distributed: bool,
}

impl PolicyBuilder {
    /// The `message` reported in a denial body.
    pub fn message(mut self, message: &str) -> Self {
        self.message = message.to_owned();
        self
    }

    pub fn key_mode(mut self, mode: KeyMode) -> Self {
        self.key_mode = mode;
        self
    }

    /// Derive the key with a custom function, taking precedence over the [KeyMode].
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Do not count requests that complete with a status below 400.
    ///
    /// Default is false.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Count in the distributed store when one is configured and healthy.
    ///
    /// Default is true.
    pub fn prefer_distributed(mut self, prefer: bool) -> Self {
        self.prefer_distributed = prefer;
        self
    }

    pub fn build(self) -> Result<Policy, ConfigError> {
        if self.max < 1 {
            return Err(ConfigError::InvalidMax(self.name));
        }
        let window = Window::new(self.window).ok_or(ConfigError::InvalidWindow(self.name))?;
        Ok(Policy {
            name: self.name,
            window,
            max: self.max,
            message: self.message,
            key_mode: self.key_mode,
            key_fn: self.key_fn,
            skip_successful_requests: self.skip_successful_requests,
            prefer_distributed: self.prefer_distributed,
        })
    }
}
