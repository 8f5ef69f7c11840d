//! Persistence policy and the optional header store collaborator.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where obtained authorization headers may be kept beyond memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistencePolicy {
    #[default]
    Never,
    Always,
    /// Not supported by this client; behaves as `Never`.
    Biometrics,
}

impl PersistencePolicy {
    /// Policy actually applied.
    pub fn effective(self) -> Self {
        match self {
            PersistencePolicy::Biometrics => PersistencePolicy::Never,
            other => other,
        }
    }

    pub fn persists(self) -> bool {
        self.effective() == PersistencePolicy::Always
    }
}

/// Durable storage for authorization headers (keychain, secure prefs, ...).
/// Only consulted when the effective policy is [`PersistencePolicy::Always`].
#[async_trait]
pub trait HeaderStore: Send + Sync {
    async fn load_cached_header(&self, scope: Option<&str>) -> Option<String>;
    async fn save_cached_header(&self, scope: Option<&str>, header: &str);
    async fn remove_cached_header(&self, scope: Option<&str>);
}

/// Process-local store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryHeaderStore {
    headers: Mutex<HashMap<Option<String>, String>>,
}

impl MemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(self, scope: Option<&str>, header: impl Into<String>) -> Self {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.map(str::to_string), header.into());
        self
    }

    pub fn len(&self) -> usize {
        self.headers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HeaderStore for MemoryHeaderStore {
    async fn load_cached_header(&self, scope: Option<&str>) -> Option<String> {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scope.map(str::to_string))
            .cloned()
    }

    async fn save_cached_header(&self, scope: Option<&str>, header: &str) {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.map(str::to_string), header.to_string());
    }

    async fn remove_cached_header(&self, scope: Option<&str>) {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&scope.map(str::to_string));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biometrics_falls_back_to_never() {
        assert_eq!(PersistencePolicy::Biometrics.effective(), PersistencePolicy::Never);
        assert!(!PersistencePolicy::Biometrics.persists());
        assert!(PersistencePolicy::Always.persists());
    }

    #[test]
    fn deserializes_upper_case_names() {
        let policy: PersistencePolicy = serde_json::from_str("\"ALWAYS\"").unwrap();
        assert_eq!(policy, PersistencePolicy::Always);
        assert_eq!(
            serde_json::to_string(&PersistencePolicy::Biometrics).unwrap(),
            "\"BIOMETRICS\""
        );
    }
}
