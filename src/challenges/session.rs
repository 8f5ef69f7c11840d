//! Handle a challenge handler uses to talk back to the client during one
//! cycle.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use http::HeaderValue;
use http::header::CONTENT_TYPE;
use tokio::sync::oneshot;

use crate::challenges::core::types::RequestOrigin;
use crate::challenges::core::{
    AdapterInvocation, FORM_CONTENT_TYPE, ResourceRequest, ResourceResponse, encode_form,
};
use crate::challenges::pipeline::RequestPipeline;
use crate::client::{WlClientError, WlClientResult};

/// What the handler reported for its cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Success,
    Failure(String),
}

struct SessionInner {
    pipeline: RequestPipeline,
    realm: String,
    scope: Option<String>,
    cycle: u64,
    outcome: Mutex<Option<oneshot::Sender<ChallengeOutcome>>>,
}

/// Bound to one realm and one cycle. Clones share the same outcome slot:
/// only the first `submit_success`/`submit_failure` counts.
#[derive(Clone)]
pub struct ChallengeSession {
    inner: Arc<SessionInner>,
}

impl ChallengeSession {
    pub(crate) fn new(
        pipeline: RequestPipeline,
        realm: String,
        scope: Option<String>,
        cycle: u64,
    ) -> (Self, oneshot::Receiver<ChallengeOutcome>) {
        let (tx, rx) = oneshot::channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                pipeline,
                realm,
                scope,
                cycle,
                outcome: Mutex::new(Some(tx)),
            }),
        };
        (session, rx)
    }

    pub fn realm(&self) -> &str {
        &self.inner.realm
    }

    /// Scope announced by the challenge, if any.
    pub fn scope(&self) -> Option<&str> {
        self.inner.scope.as_deref()
    }

    pub fn cycle(&self) -> u64 {
        self.inner.cycle
    }

    /// An outcome was already reported (or the cycle was abandoned).
    pub fn is_completed(&self) -> bool {
        self.inner
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }

    /// Invoke an adapter procedure with the invocation's parameters sent as
    /// the JSON-encoded `params` form field.
    pub async fn submit_adapter_authentication(
        &self,
        invocation: AdapterInvocation,
    ) -> WlClientResult<ResourceResponse> {
        let request = invocation.to_request(self.inner.pipeline.adapter_path())?;
        self.submit_request(request).await
    }

    /// Post `fields` as a URL-encoded form to `url`.
    pub async fn submit_login_form(
        &self,
        url: &str,
        fields: &[(&str, &str)],
    ) -> WlClientResult<ResourceResponse> {
        let request = ResourceRequest::post(url)?
            .with_header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
            .with_body(encode_form(fields.iter().copied()));
        self.submit_request(request).await
    }

    /// Send an arbitrary authentication request for this realm. A challenge
    /// for the same realm on the response fails with `ChallengeLoop`.
    pub async fn submit_request(&self, request: ResourceRequest) -> WlClientResult<ResourceResponse> {
        if self.is_completed() {
            return Err(WlClientError::InvalidRequest(format!(
                "challenge cycle {} for realm '{}' has already completed",
                self.inner.cycle, self.inner.realm
            )));
        }
        self.inner
            .pipeline
            .start_submission(&self.inner.realm, self.inner.cycle)?;

        let request = request.with_origin(RequestOrigin::Submission {
            realm: self.inner.realm.clone(),
        });
        self.inner.pipeline.send(request).await
    }

    /// Report that authentication succeeded. Returns false if an outcome was
    /// already reported.
    pub fn submit_success(&self) -> bool {
        self.report(ChallengeOutcome::Success)
    }

    /// Report that authentication failed with `reason`. Returns false if an
    /// outcome was already reported.
    pub fn submit_failure(&self, reason: impl Into<String>) -> bool {
        self.report(ChallengeOutcome::Failure(reason.into()))
    }

    fn report(&self, outcome: ChallengeOutcome) -> bool {
        let sender = self
            .inner
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => {
                log::warn!(
                    "ignoring {outcome:?} for realm '{}' cycle {}: already completed",
                    self.inner.realm,
                    self.inner.cycle
                );
                false
            }
        }
    }
}

impl fmt::Debug for ChallengeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeSession")
            .field("realm", &self.inner.realm)
            .field("scope", &self.inner.scope)
            .field("cycle", &self.inner.cycle)
            .field("completed", &self.is_completed())
            .finish()
    }
}
