#![cfg_attr(docsrs, feature(doc_cfg))]
//! Fixed window request throttling for actix-web.
//!
//! Requests are counted per policy, per client key, per window. Counting happens in a
//! distributed [CounterStore](backend::CounterStore) shared by all instances when one is
//! configured and reachable, and in an in-process table otherwise.
//!
//! ```no_run
//! use actix_web::{App, HttpServer};
//! use actix_window_throttle::backend::ThrottleEngine;
//! use actix_window_throttle::config::Environment;
//! use actix_window_throttle::policy::{PolicyName, PolicyRegistry};
//! use actix_window_throttle::RateLimiter;
//! use std::sync::Arc;
//!
//! # async fn example() -> std::io::Result<()> {
//! let registry = Arc::new(PolicyRegistry::new(Environment::from_env()).expect("invalid policy"));
//! let engine = ThrottleEngine::builder().build();
//! HttpServer::new(move || {
//!     let limiter = RateLimiter::builder(engine.clone(), registry.clone(), PolicyName::General)
//!         .add_headers()
//!         .build();
//!     App::new().wrap(limiter)
//! })
//! .bind(("127.0.0.1", 8080))?
//! .run()
//! .await
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
mod middleware;
pub mod policy;
pub mod window;

pub use middleware::builder::{denied_json, HeaderCompatibleOutput, RateLimiterBuilder};
pub use middleware::{CompletionHook, DenialBody, RateLimiter};
