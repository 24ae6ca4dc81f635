use crate::backend::{ThrottleEngine, ThrottleOutput};
use crate::middleware::{AllowedTransformation, DenialBody, DeniedResponse, RateLimiter};
use crate::policy::{Policy, PolicyName, PolicyRegistry};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::rc::Rc;
use std::sync::Arc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// The default denial: status 429 with a [DenialBody].
pub fn denied_json(policy: &Policy, output: &ThrottleOutput) -> HttpResponse {
    HttpResponse::TooManyRequests().json(DenialBody::new(policy, output.seconds_until_reset()))
}

pub struct RateLimiterBuilder {
    engine: ThrottleEngine,
    registry: Arc<PolicyRegistry>,
    policy: PolicyName,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl RateLimiterBuilder {
    pub(super) fn new(
        engine: ThrottleEngine,
        registry: Arc<PolicyRegistry>,
        policy: PolicyName,
    ) -> Self {
        Self {
            engine,
            registry,
            policy,
            allowed_transformation: None,
            denied_response: Rc::new(denied_json),
        }
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until the reset)
    ///
    /// The denied response keeps the default JSON body.
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(
            |map: &mut HeaderMap, output: &ThrottleOutput, _rolled_back: bool| {
                insert_headers(map, output);
            },
        ));
        self.denied_response = Rc::new(|policy: &Policy, output: &ThrottleOutput| {
            let mut response = denied_json(policy, output);
            let map = response.headers_mut();
            insert_headers(map, output);
            map.insert(RETRY_AFTER, HeaderValue::from(output.seconds_until_reset()));
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status. The
    /// final argument is whether the request's count was reversed because it succeeded.
    ///
    /// By default no changes are made to the response.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, &ThrottleOutput, bool) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to [denied_json].
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&Policy, &ThrottleOutput) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            engine: self.engine,
            registry: self.registry,
            policy: self.policy,
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
        }
    }
}

fn insert_headers<O: HeaderCompatibleOutput>(map: &mut HeaderMap, output: &O) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(output.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(output.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(output.seconds_until_reset()),
    );
}

/// A trait that an output should implement in order to be reported by
/// [RateLimiterBuilder::add_headers].
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `x-ratelimit-reset` and `retry-after` headers.
    ///
    /// This should be the number of seconds from now until the limit resets.\
    /// If the limit has already reset this should return 0.
    fn seconds_until_reset(&self) -> u64;
}
