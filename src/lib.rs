//! # wlclient-rs
//!
//! Client-side core for challenge-based re-authentication against a
//! mobile-middleware server.
//!
//! Requests go out through a [`WlClient`]. When the server answers with an
//! authorization challenge, the request is parked on its realm's queue, the
//! realm's [`ChallengeHandler`] authenticates through a [`ChallengeSession`],
//! and the parked requests are replayed with a fresh authorization header
//! (or rejected if authentication failed). Callers only see the final
//! response.
//!
//! ## Features
//!
//! - One challenge cycle per realm at a time; other realms run independently
//! - FIFO replay of parked requests, with cancellation and per-request timeouts
//! - Authorization header cache with coalesced fetches and optional persistence
//! - Built-in adapter and login-form handlers, selectable from configuration
//! - Pluggable transport (reqwest by default) and structured events/metrics
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wlclient_rs::{AdapterChallengeHandler, ResourceRequest, StaticCredentials, WlClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WlClient::builder()
//!         .with_base_url("https://mfp.example.com/mfp/api/")
//!         .build()?;
//!     client.register_challenge_handler(
//!         "AuthRealm",
//!         Arc::new(AdapterChallengeHandler::new(
//!             "AuthAdapter",
//!             "submitAuthentication",
//!             Arc::new(StaticCredentials::new("alice", "secret")),
//!         )),
//!     )?;
//!
//!     let response = client.send(ResourceRequest::get("/adapters/Auth/secret")?).await?;
//!     println!("Response: {}", response.text());
//!     Ok(())
//! }
//! ```

mod client;

pub mod authorization;
pub mod challenges;
pub mod modules;

pub use crate::client::{
    AuthorizationConfig,
    SendHandle,
    WlClient,
    WlClientBuilder,
    WlClientConfig,
    WlClientError,
    WlClientResult,
};

pub use crate::authorization::{
    AuthorizationCache,
    AuthorizationEntry,
    AuthorizationManager,
    HeaderStore,
    MemoryHeaderStore,
    PersistencePolicy,
};

pub use crate::challenges::core::{
    AdapterInvocation,
    AuthenticateHeader,
    Challenge,
    RawResponse,
    RequestBuildError,
    ReqwestResourceTransport,
    ResourceRequest,
    ResourceResponse,
    ResourceTransport,
    TransportError,
    get_authorization_scope,
    is_authorization_required,
};

pub use crate::challenges::handlers::{
    AdapterChallengeHandler,
    ChallengeHandler,
    ChallengeOutcome,
    ChallengeSession,
    Credentials,
    CredentialsProvider,
    HandlerBinding,
    HandlerError,
    LoginFormChallengeHandler,
    RealmBinding,
    StaticCredentials,
};

pub use crate::challenges::pipeline::{PipelineConfig, RequestPipeline};
pub use crate::challenges::queue::{DrainReport, PendingRequest, PendingRequestQueue};
pub use crate::challenges::registry::{ChallengeRegistry, RegistryError};
pub use crate::challenges::state::{ChallengePhase, ChallengeStateMachine, TransitionError};

pub use crate::modules::{
    ChallengeEvent,
    ClientEvent,
    ErrorEvent,
    EventDispatcher,
    EventHandler,
    GlobalStats,
    HostStats,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    RealmStats,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
