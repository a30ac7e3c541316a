use serde::{Deserialize, Serialize};
use std::fmt;

/// Canal nommé auquel les connexions s'abonnent.
/// Formes canoniques : `marketplace`, `provider:<id>`, `job:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

pub const MARKETPLACE: &str = "marketplace";

impl Topic {
    pub fn marketplace() -> Self {
        Self(MARKETPLACE.to_string())
    }

    pub fn provider(provider_id: &str) -> Self {
        Self(format!("provider:{}", provider_id))
    }

    pub fn job(job_id: &str) -> Self {
        Self(format!("job:{}", job_id))
    }

    /// Topic brut (ex: `unsubscribe` reçoit la clé complète du client)
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
