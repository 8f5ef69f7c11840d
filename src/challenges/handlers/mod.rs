//! Challenge handler capability set and the built-in handler variants.
//!
//! A handler decides whether a challenging response is its own
//! (`is_custom_response`) and then drives the dialogue (`handle_challenge`)
//! through the [`ChallengeSession`] it receives: submit credentials, then
//! report success or failure.

pub mod adapter;
pub mod login_form;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::challenges::core::{Challenge, ResourceResponse};

pub use crate::challenges::session::{ChallengeOutcome, ChallengeSession};
pub use adapter::AdapterChallengeHandler;
pub use login_form::LoginFormChallengeHandler;

/// Error type handlers may return from `handle_challenge`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// Whether `response` carries a challenge this handler understands.
    fn is_custom_response(&self, response: &ResourceResponse) -> bool {
        let _ = response;
        true
    }

    /// Run the dialogue for `challenge`. The cycle ends when the session
    /// reports an outcome; returning an error fails the cycle.
    async fn handle_challenge(
        &self,
        challenge: Challenge,
        session: ChallengeSession,
    ) -> Result<(), HandlerError>;
}

/// Username/password pair collected for a realm.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of credentials for the built-in handlers (a login screen, a
/// keychain, a test fixture).
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(
        &self,
        realm: &str,
        challenge: &Challenge,
    ) -> Result<Credentials, HandlerError>;
}

/// Always answers with the same credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self(Credentials::new(username, password))
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(
        &self,
        _realm: &str,
        _challenge: &Challenge,
    ) -> Result<Credentials, HandlerError> {
        Ok(self.0.clone())
    }
}

/// Built-in handler variant selected for a realm by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerBinding {
    Adapter {
        adapter: String,
        procedure: String,
    },
    LoginForm {
        url: String,
        #[serde(default = "login_form::default_username_field")]
        username_field: String,
        #[serde(default = "login_form::default_password_field")]
        password_field: String,
    },
}

impl HandlerBinding {
    pub fn build(&self, credentials: Arc<dyn CredentialsProvider>) -> Arc<dyn ChallengeHandler> {
        match self {
            HandlerBinding::Adapter { adapter, procedure } => Arc::new(
                AdapterChallengeHandler::new(adapter.clone(), procedure.clone(), credentials),
            ),
            HandlerBinding::LoginForm {
                url,
                username_field,
                password_field,
            } => Arc::new(
                LoginFormChallengeHandler::new(url.clone(), credentials)
                    .with_field_names(username_field.clone(), password_field.clone()),
            ),
        }
    }
}

/// Realm-to-handler binding as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RealmBinding {
    pub realm: String,
    #[serde(flatten)]
    pub handler: HandlerBinding,
}

/// Extract a server-provided error message from an authentication response.
pub(crate) fn rejection_reason(response: &ResourceResponse) -> String {
    response
        .json()
        .and_then(|json| {
            json.get("errorMessage")
                .or_else(|| json.get("error"))
                .and_then(|value| value.as_str())
        })
        .map(str::to_string)
        .unwrap_or_else(|| format!("authentication rejected with status {}", response.status()))
}

/// Response still asks for authentication (`authRequired: true`).
pub(crate) fn auth_required(response: &ResourceResponse) -> bool {
    response
        .json()
        .and_then(|json| json.get("authRequired"))
        .and_then(|value| value.as_bool())
        .unwrap_or(false)
}
