//! Realm name to challenge handler bindings.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use super::handlers::ChallengeHandler;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a challenge handler is already registered for realm '{0}'")]
    DuplicateHandler(String),
}

/// One handler per realm. Realm names are exact, case-sensitive strings.
#[derive(Default)]
pub struct ChallengeRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ChallengeHandler>>>,
}

impl ChallengeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `realm`; fails if the realm already has one.
    pub fn register(
        &self,
        realm: impl Into<String>,
        handler: Arc<dyn ChallengeHandler>,
    ) -> Result<(), RegistryError> {
        let realm = realm.into();
        let mut guard = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(&realm) {
            return Err(RegistryError::DuplicateHandler(realm));
        }
        log::debug!("registered challenge handler for realm '{realm}'");
        guard.insert(realm, handler);
        Ok(())
    }

    /// Bind `handler` to `realm`, returning the handler it replaced.
    pub fn register_or_replace(
        &self,
        realm: impl Into<String>,
        handler: Arc<dyn ChallengeHandler>,
    ) -> Option<Arc<dyn ChallengeHandler>> {
        let realm = realm.into();
        let mut guard = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let previous = guard.insert(realm.clone(), handler);
        if previous.is_some() {
            log::info!("replaced challenge handler for realm '{realm}'");
        }
        previous
    }

    pub fn unregister(&self, realm: &str) -> Option<Arc<dyn ChallengeHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(realm)
    }

    pub fn resolve(&self, realm: &str) -> Option<Arc<dyn ChallengeHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(realm)
            .cloned()
    }

    pub fn contains(&self, realm: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(realm)
    }

    /// Registered realm names, sorted.
    pub fn realms(&self) -> Vec<String> {
        let mut realms: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        realms.sort();
        realms
    }
}

impl fmt::Debug for ChallengeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeRegistry")
            .field("realms", &self.realms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::Challenge;
    use crate::challenges::handlers::{ChallengeSession, HandlerError};
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl ChallengeHandler for NoopHandler {
        async fn handle_challenge(
            &self,
            _challenge: Challenge,
            session: ChallengeSession,
        ) -> Result<(), HandlerError> {
            session.submit_success();
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_leaves_state_unchanged() {
        let registry = ChallengeRegistry::new();
        let first: Arc<dyn ChallengeHandler> = Arc::new(NoopHandler);
        registry.register("AuthRealm", first.clone()).unwrap();

        let err = registry.register("AuthRealm", first.clone()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler("AuthRealm".into()));
        assert_eq!(registry.realms(), vec!["AuthRealm".to_string()]);
        assert!(Arc::ptr_eq(&registry.resolve("AuthRealm").unwrap(), &first));
    }

    #[test]
    fn realm_names_are_case_sensitive_and_replaceable() {
        let registry = ChallengeRegistry::new();
        registry.register("AuthRealm", Arc::new(NoopHandler)).unwrap();
        assert!(registry.resolve("authrealm").is_none());

        let replacement: Arc<dyn ChallengeHandler> = Arc::new(NoopHandler);
        assert!(registry.register_or_replace("AuthRealm", replacement.clone()).is_some());
        assert!(Arc::ptr_eq(&registry.resolve("AuthRealm").unwrap(), &replacement));
        assert!(registry.unregister("AuthRealm").is_some());
        assert!(!registry.contains("AuthRealm"));
    }
}
