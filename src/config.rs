use std::str::FromStr;

/// Environment variable consulted by [Environment::from_env].
pub const ENVIRONMENT_VAR: &str = "APP_ENV";

/// The environment the host process is running in.
///
/// In [Environment::Development] every call site is throttled by the lenient `development`
/// policy, whichever policy it asked for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    /// Reads [ENVIRONMENT_VAR], treating unset or unrecognised values as production.
    pub fn from_env() -> Self {
        std::env::var(ENVIRONMENT_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(()),
        }
    }
}
