pub mod builder;
mod hook;

pub use hook::CompletionHook;

use crate::backend::{Backend, ThrottleEngine, ThrottleInput, ThrottleOutput};
use crate::policy::{resolve_key, Policy, PolicyName, PolicyRegistry};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::HttpResponse;
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

type AllowedTransformation = dyn Fn(&mut HeaderMap, &ThrottleOutput, bool);
type DeniedResponse = dyn Fn(&Policy, &ThrottleOutput) -> HttpResponse;

/// JSON body of a throttled response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub success: bool,
    pub message: String,
    pub code: String,
    /// Seconds until the window resets.
    pub retry_after: u64,
}

impl DenialBody {
    pub fn new(policy: &Policy, retry_after: u64) -> Self {
        Self {
            success: false,
            message: policy.message().to_owned(),
            code: policy.code().to_owned(),
            retry_after,
        }
    }
}

/// Rate limit middleware.
pub struct RateLimiter {
    engine: ThrottleEngine,
    registry: Arc<PolicyRegistry>,
    policy: PolicyName,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            policy: self.policy,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
        }
    }
}

impl RateLimiter {
    /// # Arguments
    ///
    /// * `engine`: The decision engine, shared by every limiter in the application.
    /// * `registry`: The application's policies.
    /// * `policy`: The policy this call site asks for. In development the registry substitutes
    ///   its `development` policy on every request.
    pub fn builder(
        engine: ThrottleEngine,
        registry: Arc<PolicyRegistry>,
        policy: PolicyName,
    ) -> RateLimiterBuilder {
        RateLimiterBuilder::new(engine, registry, policy)
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimiter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            policy: self.policy,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S> {
    service: Rc<RefCell<S>>,
    engine: ThrottleEngine,
    registry: Arc<PolicyRegistry>,
    policy: PolicyName,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl<S, B> Service<ServiceRequest> for RateLimiterMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let engine = self.engine.clone();
        let registry = self.registry.clone();
        let requested = self.policy;
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();

        Box::pin(async move {
            let policy = match registry.select(requested) {
                Ok(policy) => policy,
                Err(e) => {
                    log::error!("Rate limiter policy lookup failed: {e}");
                    let response = HttpResponse::InternalServerError().finish();
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            let input = ThrottleInput {
                key: resolve_key(&req, &policy),
                policy: policy.clone(),
            };
            let (decision, output, token) = match engine.request(input).await {
                Ok(result) => result,
                Err(never) => match never {},
            };
            if decision.is_denied() {
                let response: HttpResponse = (denied_response)(&policy, &output);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let hook = policy
                .skip_successful_requests()
                .then(|| CompletionHook::new(engine, token));

            let result = service.call(req).await;

            let status = match &result {
                Ok(response) => response.status(),
                Err(e) => e.as_response_error().status_code(),
            };
            let rolled_back = hook.map_or(false, |hook| hook.fire(status));

            let mut service_response = result?;
            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), &output, rolled_back);
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
