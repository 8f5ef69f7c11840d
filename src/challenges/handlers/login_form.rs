//! Form-based authentication against a security-check endpoint.

use std::sync::Arc;

use async_trait::async_trait;

use crate::challenges::core::{Challenge, ResourceResponse};

use super::{
    ChallengeHandler, ChallengeSession, CredentialsProvider, HandlerError, auth_required,
    rejection_reason,
};

pub fn default_username_field() -> String {
    "j_username".to_string()
}

pub fn default_password_field() -> String {
    "j_password".to_string()
}

/// Posts a username/password form to `url` when its realm is challenged.
pub struct LoginFormChallengeHandler {
    url: String,
    username_field: String,
    password_field: String,
    credentials: Arc<dyn CredentialsProvider>,
}

impl LoginFormChallengeHandler {
    pub fn new(url: impl Into<String>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            url: url.into(),
            username_field: default_username_field(),
            password_field: default_password_field(),
            credentials,
        }
    }

    /// Override the form field names (`j_username`/`j_password` by default).
    pub fn with_field_names(
        mut self,
        username_field: impl Into<String>,
        password_field: impl Into<String>,
    ) -> Self {
        self.username_field = username_field.into();
        self.password_field = password_field.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChallengeHandler for LoginFormChallengeHandler {
    fn is_custom_response(&self, response: &ResourceResponse) -> bool {
        response.status() == 401 || auth_required(response)
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

        let fields = [
            (self.username_field.as_str(), credentials.username.as_str()),
            (self.password_field.as_str(), credentials.password.as_str()),
        ];
        let response = session.submit_login_form(&self.url, &fields).await?;

        if response.is_success() && !auth_required(&response) {
            session.submit_success();
        } else {
            session.submit_failure(rejection_reason(&response));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::RawResponse;
    use crate::challenges::handlers::StaticCredentials;
    use bytes::Bytes;
    use http::HeaderMap;
    use url::Url;

    #[test]
    fn form_handler_ignores_forbidden_responses() {
        let handler = LoginFormChallengeHandler::new(
            "/j_security_check",
            Arc::new(StaticCredentials::new("bob", "pw")),
        )
        .with_field_names("user", "pass");
        assert_eq!(handler.username_field, "user");
        assert_eq!(handler.url(), "/j_security_check");

        let forbidden = ResourceResponse::from_raw(RawResponse {
            status: 403,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            url: Url::parse("https://mfp.example.com/resource").unwrap(),
        });
        assert!(!handler.is_custom_response(&forbidden));
    }
}
