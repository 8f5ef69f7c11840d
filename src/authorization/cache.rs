//! In-memory authorization header cache keyed by scope.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

/// Cached authorization header for one scope. `scope == None` is the default
/// scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationEntry {
    pub scope: Option<String>,
    pub header: String,
    pub obtained_at: DateTime<Utc>,
}

/// Entries are swapped whole, so readers never see a partial write. Last
/// writer wins.
#[derive(Debug, Default)]
pub struct AuthorizationCache {
    entries: RwLock<HashMap<Option<String>, Arc<AuthorizationEntry>>>,
}

impl AuthorizationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scope: Option<&str>) -> Option<Arc<AuthorizationEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scope.map(str::to_string))
            .cloned()
    }

    pub fn header(&self, scope: Option<&str>) -> Option<String> {
        self.get(scope).map(|entry| entry.header.clone())
    }

    pub fn put(&self, scope: Option<&str>, header: impl Into<String>) -> Arc<AuthorizationEntry> {
        let entry = Arc::new(AuthorizationEntry {
            scope: scope.map(str::to_string),
            header: header.into(),
            obtained_at: Utc::now(),
        });
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.scope.clone(), entry.clone());
        entry
    }

    pub fn invalidate(&self, scope: Option<&str>) -> Option<Arc<AuthorizationEntry>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&scope.map(str::to_string))
    }

    /// Drop the entry only if it still holds `header`, so a newer header
    /// written concurrently survives.
    pub fn invalidate_if(&self, scope: Option<&str>, header: &str) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = scope.map(str::to_string);
        match guard.get(&key) {
            Some(entry) if entry.header == header => {
                guard.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_independent() {
        let cache = AuthorizationCache::new();
        cache.put(None, "Bearer default");
        cache.put(Some("accounts"), "Bearer accounts");

        assert_eq!(cache.header(None).as_deref(), Some("Bearer default"));
        assert_eq!(cache.header(Some("accounts")).as_deref(), Some("Bearer accounts"));
        assert!(cache.header(Some("payments")).is_none());

        cache.invalidate(Some("accounts"));
        assert!(cache.header(Some("accounts")).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn later_put_supersedes_and_conditional_invalidate_spares_it() {
        let cache = AuthorizationCache::new();
        let first = cache.put(None, "Bearer old");
        let second = cache.put(None, "Bearer new");
        assert!(second.obtained_at >= first.obtained_at);

        assert!(!cache.invalidate_if(None, "Bearer old"));
        assert_eq!(cache.header(None).as_deref(), Some("Bearer new"));
        assert!(cache.invalidate_if(None, "Bearer new"));
        assert!(cache.is_empty());
    }
}
