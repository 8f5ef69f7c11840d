//! Adapter-based authentication: credentials are sent to an adapter
//! procedure as its positional parameters.

use std::sync::Arc;

use async_trait::async_trait;

use crate::challenges::core::{AdapterInvocation, Challenge, ResourceResponse};

use super::{
    ChallengeHandler, ChallengeSession, Credentials, CredentialsProvider, HandlerError,
    auth_required, rejection_reason,
};

/// Answers a realm's challenge by invoking `adapter/procedure` with
/// `[username, password]`.
pub struct AdapterChallengeHandler {
    adapter: String,
    procedure: String,
    credentials: Arc<dyn CredentialsProvider>,
}

impl AdapterChallengeHandler {
    pub fn new(
        adapter: impl Into<String>,
        procedure: impl Into<String>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            adapter: adapter.into(),
            procedure: procedure.into(),
            credentials,
        }
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    fn invocation(&self, credentials: &Credentials) -> AdapterInvocation {
        AdapterInvocation::new(&self.adapter, &self.procedure)
            .with_parameters([credentials.username.as_str(), credentials.password.as_str()])
    }
}

#[async_trait]
impl ChallengeHandler for AdapterChallengeHandler {
    fn is_custom_response(&self, response: &ResourceResponse) -> bool {
        matches!(response.status(), 401 | 403) || auth_required(response)
    }

    async fn handle_challenge(
        &self,
        challenge: Challenge,
        session: ChallengeSession,
    ) -> Result<(), HandlerError> {
        let credentials = self
            .credentials
            .credentials(session.realm(), &challenge)
            .await?;

        log::debug!(
            "submitting credentials for realm '{}' to {}/{}",
            session.realm(),
            self.adapter,
            self.procedure
        );
        let response = session
            .submit_adapter_authentication(self.invocation(&credentials))
            .await?;

        if response.is_success() && !auth_required(&response) {
            session.submit_success();
        } else {
            session.submit_failure(rejection_reason(&response));
        }
        Ok(())
    }
}
