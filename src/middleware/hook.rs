use crate::backend::{RollbackToken, ThrottleEngine};
use actix_web::http::StatusCode;

/// Reverses a request's count once its final status is known, if that status is a success.
///
/// [CompletionHook::fire] consumes the hook, so it runs at most once. A hook dropped without
/// firing (e.g. the request was cancelled) has no effect.
pub struct CompletionHook {
    engine: ThrottleEngine,
    token: RollbackToken,
}

impl CompletionHook {
    pub fn new(engine: ThrottleEngine, token: RollbackToken) -> Self {
        Self { engine, token }
    }

    /// Returns whether the count was reversed.
    pub fn fire(self, status: StatusCode) -> bool {
        if status.as_u16() >= 400 {
            return false;
        }
        self.engine.compensate(self.token);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ThrottleInput};
    use crate::clock::ManualClock;
    use crate::policy::{Policy, PolicyName};
    use std::sync::Arc;
    use std::time::Duration;

    async fn counted(engine: &ThrottleEngine, policy: &Arc<Policy>) -> RollbackToken {
        let input = ThrottleInput {
            policy: policy.clone(),
            key: "k".to_owned(),
        };
        engine.request(input).await.unwrap().2
    }

    fn setup() -> (ThrottleEngine, Arc<Policy>) {
        let engine = ThrottleEngine::builder().clock(ManualClock::at(0)).build();
        let policy = Policy::builder(PolicyName::Auth, Duration::from_secs(60), 5)
            .skip_successful_requests(true)
            .build()
            .unwrap();
        (engine, Arc::new(policy))
    }

    #[actix_web::test]
    async fn test_success_is_reversed() {
        let (engine, policy) = setup();
        let token = counted(&engine, &policy).await;
        assert!(CompletionHook::new(engine.clone(), token).fire(StatusCode::FOUND));
        assert_eq!(engine.current_count(&policy, "k").await, 0);
    }

    #[actix_web::test]
    async fn test_failure_is_kept() {
        let (engine, policy) = setup();
        let token = counted(&engine, &policy).await;
        assert!(!CompletionHook::new(engine.clone(), token).fire(StatusCode::UNAUTHORIZED));
        assert_eq!(engine.current_count(&policy, "k").await, 1);
    }

    #[actix_web::test]
    async fn test_dropped_hook_does_nothing() {
        let (engine, policy) = setup();
        let token = counted(&engine, &policy).await;
        drop(CompletionHook::new(engine.clone(), token));
        assert_eq!(engine.current_count(&policy, "k").await, 1);
    }
}
