//! Authorization header lifecycle: cached lookups, persistence, and
//! coalesced fetches.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::oneshot;

use super::cache::{AuthorizationCache, AuthorizationEntry};
use super::persistence::{HeaderStore, PersistencePolicy};
use crate::client::{WlClientError, WlClientResult};

type Waiters = Vec<oneshot::Sender<WlClientResult<String>>>;

struct ManagerInner {
    cache: AuthorizationCache,
    inflight: Mutex<HashMap<Option<String>, Waiters>>,
    policy: RwLock<PersistencePolicy>,
    store: Option<Arc<dyn HeaderStore>>,
}

/// Owns the [`AuthorizationCache`]. Cheap to clone.
///
/// At most one fetch per scope is in flight; every caller that asks while it
/// runs receives a clone of its result.
#[derive(Clone)]
pub struct AuthorizationManager {
    inner: Arc<ManagerInner>,
}

impl AuthorizationManager {
    pub fn new(policy: PersistencePolicy, store: Option<Arc<dyn HeaderStore>>) -> Self {
        if policy == PersistencePolicy::Biometrics {
            log::info!("biometric header persistence is unsupported, using NEVER");
        }
        Self {
            inner: Arc::new(ManagerInner {
                cache: AuthorizationCache::new(),
                inflight: Mutex::new(HashMap::new()),
                policy: RwLock::new(policy),
                store,
            }),
        }
    }

    pub fn cache(&self) -> &AuthorizationCache {
        &self.inner.cache
    }

    pub fn persistence_policy(&self) -> PersistencePolicy {
        *self.inner.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_persistence_policy(&self, policy: PersistencePolicy) {
        if policy == PersistencePolicy::Biometrics {
            log::info!("biometric header persistence is unsupported, using NEVER");
        }
        *self.inner.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    fn persistent_store(&self) -> Option<&Arc<dyn HeaderStore>> {
        self.inner
            .store
            .as_ref()
            .filter(|_| self.persistence_policy().persists())
    }

    /// Cached header for `scope`, falling back to the persistent store.
    pub async fn cached(&self, scope: Option<&str>) -> Option<String> {
        if let Some(header) = self.inner.cache.header(scope) {
            return Some(header);
        }
        let store = self.persistent_store()?;
        let header = store.load_cached_header(scope).await?;
        self.inner.cache.put(scope, header.clone());
        Some(header)
    }

    pub async fn store(&self, scope: Option<&str>, header: &str) -> Arc<AuthorizationEntry> {
        let entry = self.inner.cache.put(scope, header);
        if let Some(store) = self.persistent_store() {
            store.save_cached_header(scope, header).await;
        }
        entry
    }

    pub async fn invalidate(&self, scope: Option<&str>) {
        self.inner.cache.invalidate(scope);
        if let Some(store) = self.persistent_store() {
            store.remove_cached_header(scope).await;
        }
    }

    /// Invalidate `scope` if it still holds the header a server just
    /// rejected.
    pub async fn invalidate_rejected(&self, scope: Option<&str>, rejected: &str) {
        if self.inner.cache.invalidate_if(scope, rejected) {
            log::debug!("dropped rejected authorization header for scope {scope:?}");
            if let Some(store) = self.persistent_store() {
                store.remove_cached_header(scope).await;
            }
        }
    }

    /// Return the header for `scope`, running `fetch` only on a miss or when
    /// `force_refresh` is set. Concurrent calls for one scope share a fetch.
    pub async fn obtain<F, Fut>(
        &self,
        scope: Option<String>,
        force_refresh: bool,
        fetch: F,
    ) -> WlClientResult<String>
    where
        F: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = WlClientResult<String>> + Send + 'static,
    {
        if !force_refresh {
            if let Some(header) = self.cached(scope.as_deref()).await {
                return Ok(header);
            }
        }

        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut inflight = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.get_mut(&scope) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    inflight.insert(scope.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            log::debug!("fetching authorization header for scope {scope:?}");
            let fetch = fetch(scope.clone());
            let manager = self.clone();
            // Detached so a cancelled leader does not strand the other waiters.
            tokio::spawn(async move {
                let result = fetch.await;
                if let Ok(header) = &result {
                    manager.store(scope.as_deref(), header).await;
                }
                let waiters = manager
                    .inner
                    .inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&scope)
                    .unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        rx.await.unwrap_or(Err(WlClientError::Cancelled))
    }

    /// Wait for the fetch in flight for `scope`, if there is one.
    pub async fn join_fetch(&self, scope: Option<&str>) -> Option<WlClientResult<String>> {
        let rx = {
            let mut inflight = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            let waiters = inflight.get_mut(&scope.map(str::to_string))?;
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            rx
        };
        Some(rx.await.unwrap_or(Err(WlClientError::Cancelled)))
    }

    pub fn is_fetching(&self, scope: Option<&str>) -> bool {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&scope.map(str::to_string))
    }

    /// Number of scopes with a fetch in flight.
    pub fn inflight(&self) -> usize {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for AuthorizationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationManager")
            .field("cached", &self.inner.cache.len())
            .field("policy", &self.persistence_policy())
            .field("store", &self.inner.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::MemoryHeaderStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_obtains_share_one_fetch() {
        let manager = AuthorizationManager::new(PersistencePolicy::Never, None);
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let fetches = fetches.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .obtain(Some("x".into()), false, move |_scope| {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("Bearer shared".to_string())
                        }
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "Bearer shared");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cache().header(Some("x")).as_deref(), Some("Bearer shared"));
        assert_eq!(manager.inflight(), 0);
    }

    #[tokio::test]
    async fn join_fetch_waits_for_the_header_to_be_stored() {
        let manager = AuthorizationManager::new(PersistencePolicy::Never, None);
        assert!(manager.join_fetch(Some("x")).await.is_none());

        let leader = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .obtain(Some("x".into()), false, |_| async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok("Bearer joined".to_string())
                    })
                    .await
            })
        };
        while !manager.is_fetching(Some("x")) {
            tokio::task::yield_now().await;
        }

        let joined = manager.join_fetch(Some("x")).await.unwrap().unwrap();
        assert_eq!(joined, "Bearer joined");
        assert_eq!(manager.cache().header(Some("x")).as_deref(), Some("Bearer joined"));
        assert_eq!(leader.await.unwrap().unwrap(), "Bearer joined");
    }

    #[tokio::test]
    async fn cached_header_skips_fetch_unless_forced() {
        let manager = AuthorizationManager::new(PersistencePolicy::Never, None);
        manager.store(None, "Bearer cached").await;

        let header = manager
            .obtain(None, false, |_| async { Ok("Bearer fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(header, "Bearer cached");

        let header = manager
            .obtain(None, true, |_| async { Ok("Bearer fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(header, "Bearer fresh");
    }

    #[tokio::test]
    async fn failed_fetch_reaches_every_waiter_and_caches_nothing() {
        let manager = AuthorizationManager::new(PersistencePolicy::Never, None);
        let first = manager.obtain(Some("x".into()), false, |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(WlClientError::Authorization("token endpoint returned 500".into()))
        });
        let second = manager.obtain(Some("x".into()), false, |_| async {
            Ok("Bearer unused".to_string())
        });
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first, Err(WlClientError::Authorization(_))));
        assert_eq!(first, second);
        assert!(manager.cache().is_empty());
    }

    #[tokio::test]
    async fn persists_only_under_always_policy() {
        let store = Arc::new(MemoryHeaderStore::new().with_header(Some("saved"), "Bearer saved"));
        let manager = AuthorizationManager::new(PersistencePolicy::Biometrics, Some(store.clone()));
        assert!(manager.cached(Some("saved")).await.is_none());
        manager.store(None, "Bearer memory-only").await;
        assert_eq!(store.len(), 1);

        manager.set_persistence_policy(PersistencePolicy::Always);
        assert_eq!(manager.cached(Some("saved")).await.as_deref(), Some("Bearer saved"));
        manager.store(None, "Bearer durable").await;
        assert_eq!(store.len(), 2);
        manager.invalidate(None).await;
        assert_eq!(store.len(), 1);
    }
}
