use crate::config::Environment;
use crate::policy::{ConfigError, KeyMode, Policy, PolicyName};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

/// The set of policies available to call sites, built once at startup.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    environment: Environment,
    policies: HashMap<PolicyName, Arc<Policy>>,
}

impl PolicyRegistry {
    /// The built-in policies.
    ///
    /// Returns an error if any of them fails validation, which should abort startup.
    pub fn new(environment: Environment) -> Result<Self, ConfigError> {
        let policies = [
            Policy::builder(PolicyName::General, FIFTEEN_MINUTES, 100)
                .message("Too many requests from this IP, please try again later."),
            Policy::builder(PolicyName::Auth, FIFTEEN_MINUTES, 5)
                .message("Too many authentication attempts, please try again later.")
                .skip_successful_requests(true),
            Policy::builder(PolicyName::Places, MINUTE, 30)
                .message("Too many place searches, please slow down."),
            Policy::builder(PolicyName::User, FIFTEEN_MINUTES, 200)
                .message("Too many requests for this account, please try again later.")
                .key_mode(KeyMode::Identity),
            Policy::builder(PolicyName::Development, MINUTE, 10_000)
                .message("Development rate limit exceeded."),
        ]
        .into_iter()
        .map(|builder| builder.build().map(|p| (p.name(), Arc::new(p))))
        .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self {
            environment,
            policies,
        })
    }

    /// Replace the policy registered under its name.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.insert(policy.name(), Arc::new(policy));
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// The registered policy for `name`, without the development override.
    pub fn get(&self, name: PolicyName) -> Option<&Arc<Policy>> {
        self.policies.get(&name)
    }

    /// The policy a call site asking for `requested` is throttled by.
    ///
    /// In development this is always the `development` policy.
    pub fn select(&self, requested: PolicyName) -> Result<Arc<Policy>, ConfigError> {
        let name = if self.environment.is_development() {
            PolicyName::Development
        } else {
            requested
        };
        self.get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPolicy(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_policies() {
        let registry = PolicyRegistry::new(Environment::Production).unwrap();
        let expected = [
            (PolicyName::General, FIFTEEN_MINUTES, 100, false, KeyMode::Address),
            (PolicyName::Auth, FIFTEEN_MINUTES, 5, true, KeyMode::Address),
            (PolicyName::Places, MINUTE, 30, false, KeyMode::Address),
            (PolicyName::User, FIFTEEN_MINUTES, 200, false, KeyMode::Identity),
            (PolicyName::Development, MINUTE, 10_000, false, KeyMode::Address),
        ];
        for (name, window, max, skip, mode) in expected {
            let policy = registry.get(name).unwrap();
            assert_eq!(policy.window().length(), window, "{name}");
            assert_eq!(policy.max(), max, "{name}");
            assert_eq!(policy.skip_successful_requests(), skip, "{name}");
            assert_eq!(policy.key_mode(), mode, "{name}");
        }
    }

    #[test]
    fn test_select_in_production() {
        let registry = PolicyRegistry::new(Environment::Production).unwrap();
        for name in [PolicyName::General, PolicyName::Auth, PolicyName::User] {
            assert_eq!(registry.select(name).unwrap().name(), name);
        }
    }

    #[test]
    fn test_development_overrides_every_request() {
        let registry = PolicyRegistry::new(Environment::Development).unwrap();
        for name in PolicyName::ALL {
            assert_eq!(registry.select(name).unwrap().name(), PolicyName::Development);
        }
        // The registered entries themselves are unchanged
        assert_eq!(registry.get(PolicyName::Auth).unwrap().max(), 5);
    }

    #[test]
    fn test_with_policy_replaces_builtin() {
        let places = Policy::builder(PolicyName::Places, MINUTE, 3).build().unwrap();
        let registry = PolicyRegistry::new(Environment::Production)
            .unwrap()
            .with_policy(places);
        assert_eq!(registry.select(PolicyName::Places).unwrap().max(), 3);
    }
}
