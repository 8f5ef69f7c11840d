//! Authorization cache, persistence policy, and the manager that obtains
//! headers on demand.

pub mod cache;
pub mod manager;
pub mod persistence;

pub use cache::{AuthorizationCache, AuthorizationEntry};
pub use manager::AuthorizationManager;
pub use persistence::{HeaderStore, MemoryHeaderStore, PersistencePolicy};
