//! Request pipeline and challenge-cycle driver.
//!
//! Every outbound request goes through [`RequestPipeline::send`]. A response
//! carrying an authorization challenge parks the request on its realm's queue
//! and, if the realm is idle, starts a challenge cycle on a spawned task. The
//! cycle hands a [`ChallengeSession`] to the realm's handler; once the handler
//! reports an outcome, the parked requests are replayed (success) or rejected
//! (failure) and the realm returns to idle.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use http::header::AUTHORIZATION;
use tokio::sync::oneshot;
use url::Url;

use crate::authorization::AuthorizationManager;
use crate::challenges::core::types::RequestOrigin;
use crate::challenges::core::{
    Challenge, ChallengeDetection, ResourceRequest, ResourceResponse, ResourceTransport,
    TransportError,
};
use crate::challenges::handlers::ChallengeHandler;
use crate::challenges::queue::{DrainReport, PendingRequest, PendingRequestQueue, drain_success};
use crate::challenges::registry::ChallengeRegistry;
use crate::challenges::session::{ChallengeOutcome, ChallengeSession};
use crate::challenges::state::{ChallengePhase, ChallengeStateMachine, TransitionError};
use crate::client::{WlClientError, WlClientResult};
use crate::modules::events::{
    ChallengeEvent, ClientEvent, ErrorEvent, EventDispatcher, ParkedEvent, RejectEvent,
    ReplayEvent, RequestEvent, ResponseEvent,
};

type DispatchFuture<'a> =
    Pin<Box<dyn Future<Output = WlClientResult<ResourceResponse>> + Send + 'a>>;

/// Settings the pipeline needs from the client configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: Url,
    pub default_timeout: Duration,
    /// Upper bound for one challenge cycle; `None` waits forever.
    pub challenge_timeout: Option<Duration>,
    pub challenge_scheme: String,
    pub default_realm: Option<String>,
    pub adapter_path: String,
    pub token_path: String,
    /// Fetch a fresh authorization header before replaying parked requests.
    pub refresh_on_success: bool,
}

#[derive(Debug, Default)]
struct RealmTable {
    machines: HashMap<String, ChallengeStateMachine>,
    queue: PendingRequestQueue,
    /// Realms whose last cycle succeeded, with the scope it authorized.
    authenticated: HashMap<String, Option<String>>,
    /// Explicit logins waiting for the realm's running cycle.
    logins: HashMap<String, Vec<oneshot::Sender<WlClientResult<()>>>>,
}

impl RealmTable {
    fn phase(&self, realm: &str) -> ChallengePhase {
        self.machines
            .get(realm)
            .map(ChallengeStateMachine::phase)
            .unwrap_or(ChallengePhase::Idle)
    }

    fn machine_mut(&mut self, realm: &str) -> &mut ChallengeStateMachine {
        self.machines
            .entry(realm.to_string())
            .or_insert_with(|| ChallengeStateMachine::new(realm))
    }
}

struct PipelineShared {
    config: PipelineConfig,
    transport: Arc<dyn ResourceTransport>,
    registry: Arc<ChallengeRegistry>,
    authorization: AuthorizationManager,
    events: EventDispatcher,
    realms: Mutex<RealmTable>,
    next_id: AtomicU64,
}

impl PipelineShared {
    fn realms(&self) -> MutexGuard<'_, RealmTable> {
        self.realms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a parked request from its queue when the waiting caller goes away
/// (dropped future, cancelled handle, or timeout).
struct ParkedGuard {
    shared: Arc<PipelineShared>,
    realm: String,
    id: u64,
}

impl Drop for ParkedGuard {
    fn drop(&mut self) {
        if self.shared.realms().queue.remove(&self.realm, self.id).is_some() {
            log::debug!(
                "removed parked request {} from realm '{}' before replay",
                self.id,
                self.realm
            );
        }
    }
}

struct Parked {
    rx: oneshot::Receiver<WlClientResult<ResourceResponse>>,
    guard: ParkedGuard,
}

impl Parked {
    async fn wait(self) -> WlClientResult<ResourceResponse> {
        let Parked { rx, guard } = self;
        let result = rx.await;
        drop(guard);
        result.unwrap_or(Err(WlClientError::Cancelled))
    }
}

enum Dialogue {
    Reported(Option<ChallengeOutcome>),
    Returned(Result<Result<(), String>, tokio::task::JoinError>),
}

/// Shared request pipeline. Cheap to clone.
#[derive(Clone)]
pub struct RequestPipeline {
    shared: Arc<PipelineShared>,
}

impl RequestPipeline {
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn ResourceTransport>,
        registry: Arc<ChallengeRegistry>,
        authorization: AuthorizationManager,
        events: EventDispatcher,
    ) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                config,
                transport,
                registry,
                authorization,
                events,
                realms: Mutex::new(RealmTable::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn adapter_path(&self) -> &str {
        &self.shared.config.adapter_path
    }

    pub fn registry(&self) -> &Arc<ChallengeRegistry> {
        &self.shared.registry
    }

    pub fn authorization(&self) -> &AuthorizationManager {
        &self.shared.authorization
    }

    pub fn challenge_phase(&self, realm: &str) -> ChallengePhase {
        self.shared.realms().phase(realm)
    }

    /// Number of requests currently parked on `realm`.
    pub fn pending_requests(&self, realm: &str) -> usize {
        self.shared.realms().queue.len(realm)
    }

    /// Send `request`, transparently running a challenge cycle if the server
    /// asks for authentication. The request timeout (or the default) bounds
    /// the whole call, including time spent parked.
    pub async fn send(&self, request: ResourceRequest) -> WlClientResult<ResourceResponse> {
        let limit = request.timeout().unwrap_or(self.shared.config.default_timeout);
        match tokio::time::timeout(limit, self.dispatch(request)).await {
            Ok(result) => result,
            Err(_) => Err(WlClientError::Timeout(limit)),
        }
    }

    /// Header for `scope`, fetched from the token endpoint on a miss or when
    /// `force_refresh` is set.
    pub async fn obtain_authorization_header(
        &self,
        scope: Option<String>,
        force_refresh: bool,
    ) -> WlClientResult<String> {
        let origin = RequestOrigin::Authorization {
            scope: scope.clone(),
        };
        self.obtain_with_origin(scope, force_refresh, origin).await
    }

    async fn obtain_with_origin(
        &self,
        scope: Option<String>,
        force_refresh: bool,
        origin: RequestOrigin,
    ) -> WlClientResult<String> {
        let pipeline = self.clone();
        self.shared
            .authorization
            .obtain(scope, force_refresh, move |scope| async move {
                pipeline.fetch_authorization_header(scope, origin).await
            })
            .await
    }

    async fn fetch_authorization_header(
        &self,
        scope: Option<String>,
        origin: RequestOrigin,
    ) -> WlClientResult<String> {
        let mut request = ResourceRequest::get(&self.shared.config.token_path)?.with_origin(origin);
        if let Some(scope) = &scope {
            request.set_query_parameter("scope", scope);
        }

        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(WlClientError::Authorization(format!(
                "token endpoint answered with status {}",
                response.status()
            )));
        }

        if let Some(json) = response.json() {
            if let Some(token) = json.get("access_token").and_then(|value| value.as_str()) {
                let token_type = json
                    .get("token_type")
                    .and_then(|value| value.as_str())
                    .unwrap_or(&self.shared.config.challenge_scheme);
                return Ok(format!("{token_type} {token}"));
            }
        }
        response
            .header(AUTHORIZATION)
            .map(str::to_string)
            .ok_or_else(|| {
                WlClientError::Authorization("token endpoint returned no access token".into())
            })
    }

    /// Boxed so the cycle task spawned from here can call back into it.
    fn dispatch(&self, request: ResourceRequest) -> DispatchFuture<'_> {
        Box::pin(async move {
            let mut request = match self.park_if_active(request) {
                Ok(parked) => return parked.wait().await,
                Err(request) => request,
            };

            if request.origin.carries_authorization() && request.header("authorization").is_none() {
                let cached = self.shared.authorization.cached(request.scope()).await;
                if let Some(header) = cached {
                    request.set_header("authorization", &header)?;
                }
            }

            let response = self.transmit(&request).await?;

            let challenge = match Challenge::from_response(
                &response,
                &self.shared.config.challenge_scheme,
                self.shared.config.default_realm.as_deref(),
            ) {
                Ok(challenge) => challenge,
                Err(ChallengeDetection::None) => return Ok(response),
                Err(ChallengeDetection::MissingRealm) => {
                    log::warn!("challenge from {} names no realm", response.url());
                    return Err(WlClientError::UnhandledChallenge {
                        realm: String::new(),
                    });
                }
            };
            let realm = challenge.realm.clone();

            if request.origin.loops_on(&realm) {
                log::warn!("realm '{realm}' challenged its own authentication traffic");
                return Err(WlClientError::ChallengeLoop { realm });
            }

            let Some(handler) = self.shared.registry.resolve(&realm) else {
                return Err(WlClientError::UnhandledChallenge { realm });
            };
            if !handler.is_custom_response(&response) {
                return Ok(response);
            }

            // The header was rejected whoever attached it; the replay picks up
            // whatever the cache holds once the cycle is over.
            if request.origin.carries_authorization() {
                let rejected = request.header("authorization").map(str::to_string);
                if let Some(rejected) = rejected {
                    self.shared
                        .authorization
                        .invalidate_rejected(request.scope(), &rejected)
                        .await;
                    request.remove_header(AUTHORIZATION);
                }
            }
            if challenge.scope.is_some() {
                request.set_scope(challenge.scope.clone());
            }

            let (parked, started) = self.park_challenged(&realm, request);
            if let Some(cycle) = started {
                self.emit_phase(&realm, cycle, ChallengePhase::Challenged, None);
                tokio::spawn(self.clone().run_cycle(realm, cycle, challenge, handler));
            }
            parked.wait().await
        })
    }

    async fn transmit(&self, request: &ResourceRequest) -> WlClientResult<ResourceResponse> {
        let url = request.resolve_url(&self.shared.config.base_url)?;
        let limit = request.timeout().unwrap_or(self.shared.config.default_timeout);

        self.emit(ClientEvent::Request(RequestEvent {
            url: url.clone(),
            method: request.method().clone(),
            authorized: request.header("authorization").is_some(),
            timestamp: Utc::now(),
        }));

        let started = Instant::now();
        let result = self
            .shared
            .transport
            .transmit(
                request.method(),
                &url,
                request.header_map(),
                request.body().map(|body| body.as_ref()),
                limit,
            )
            .await;

        match result {
            Ok(raw) => {
                self.emit(ClientEvent::Response(ResponseEvent {
                    url: url.clone(),
                    method: request.method().clone(),
                    status: raw.status,
                    latency: started.elapsed(),
                    timestamp: Utc::now(),
                }));
                Ok(ResourceResponse::from_raw(raw))
            }
            Err(err) => {
                self.emit(ClientEvent::Error(ErrorEvent {
                    host: url.host_str().unwrap_or("").to_string(),
                    error: err.to_string(),
                    timestamp: Utc::now(),
                }));
                Err(match err {
                    TransportError::TimedOut => WlClientError::Timeout(limit),
                    other => WlClientError::Request(other),
                })
            }
        }
    }

    /// Park a request whose realm context names a realm with a running
    /// cycle. Gives the request back when it may go out.
    fn park_if_active(&self, request: ResourceRequest) -> Result<Parked, ResourceRequest> {
        let Some(realm) = request.realm().map(str::to_string) else {
            return Err(request);
        };
        if request.origin.loops_on(&realm) {
            return Err(request);
        }

        let (parked, queued) = {
            let mut table = self.shared.realms();
            if !table.phase(&realm).is_active() {
                return Err(request);
            }
            self.enqueue(&mut table, &realm, request)
        };
        self.emit_parked(&realm, queued);
        Ok(parked)
    }

    /// Park a challenged request. Returns the new cycle number when this
    /// challenge started one.
    fn park_challenged(&self, realm: &str, request: ResourceRequest) -> (Parked, Option<u64>) {
        let (parked, queued, started) = {
            let mut table = self.shared.realms();
            let (parked, queued) = self.enqueue(&mut table, realm, request);
            let machine = table.machine_mut(realm);
            let started = if machine.phase() == ChallengePhase::Idle {
                machine.begin().ok()
            } else {
                None
            };
            (parked, queued, started)
        };
        self.emit_parked(realm, queued);
        (parked, started)
    }

    fn enqueue(
        &self,
        table: &mut RealmTable,
        realm: &str,
        request: ResourceRequest,
    ) -> (Parked, usize) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let queued = table.queue.enqueue(realm, PendingRequest::new(id, request, tx));
        let parked = Parked {
            rx,
            guard: ParkedGuard {
                shared: Arc::clone(&self.shared),
                realm: realm.to_string(),
                id,
            },
        };
        (parked, queued)
    }

    /// Run a challenge cycle for `realm` without waiting for the server to
    /// ask. Joins the running cycle if there is one.
    pub async fn login(&self, realm: &str) -> WlClientResult<()> {
        let Some(handler) = self.shared.registry.resolve(realm) else {
            return Err(WlClientError::UnhandledChallenge {
                realm: realm.to_string(),
            });
        };

        let (tx, rx) = oneshot::channel();
        let started = {
            let mut table = self.shared.realms();
            table.logins.entry(realm.to_string()).or_default().push(tx);
            let machine = table.machine_mut(realm);
            if machine.phase() == ChallengePhase::Idle {
                machine.begin().ok()
            } else {
                None
            }
        };

        if let Some(cycle) = started {
            log::info!("starting login to realm '{realm}'");
            self.emit_phase(realm, cycle, ChallengePhase::Challenged, None);
            let challenge = Challenge::solicited(realm, self.shared.config.challenge_scheme.as_str());
            tokio::spawn(self.clone().run_cycle(realm.to_string(), cycle, challenge, handler));
        }
        rx.await.unwrap_or(Err(WlClientError::Cancelled))
    }

    /// Forget that `realm` is authenticated and drop the header its last
    /// cycle authorized. Returns false if the realm was not authenticated.
    pub async fn logout(&self, realm: &str) -> bool {
        let scope = self.shared.realms().authenticated.remove(realm);
        let Some(scope) = scope else {
            return false;
        };
        self.shared.authorization.invalidate(scope.as_deref()).await;
        log::info!("logged out of realm '{realm}'");
        true
    }

    /// Whether the last cycle for `realm` succeeded and no logout followed.
    pub fn is_user_authenticated(&self, realm: &str) -> bool {
        self.shared.realms().authenticated.contains_key(realm)
    }

    /// `Challenged -> Submitting` for a handler's sub-request.
    pub(crate) fn start_submission(&self, realm: &str, cycle: u64) -> WlClientResult<()> {
        let first = {
            let mut table = self.shared.realms();
            let machine = table.machine_mut(realm);
            let first = machine.phase() == ChallengePhase::Challenged;
            machine.start_submission(cycle).inspect_err(|err| {
                log::warn!("rejected submission: {err}");
            })?;
            first
        };
        if first {
            self.emit_phase(realm, cycle, ChallengePhase::Submitting, None);
        }
        Ok(())
    }

    async fn run_cycle(
        self,
        realm: String,
        cycle: u64,
        challenge: Challenge,
        handler: Arc<dyn ChallengeHandler>,
    ) {
        let scope = challenge.scope.clone();
        let (session, mut outcome_rx) =
            ChallengeSession::new(self.clone(), realm.clone(), scope.clone(), cycle);

        let mut handling = tokio::spawn(async move {
            handler
                .handle_challenge(challenge, session)
                .await
                .map_err(|err| err.to_string())
        });
        let abort = handling.abort_handle();

        let dialogue = async {
            let step = tokio::select! {
                biased;
                outcome = &mut outcome_rx => Dialogue::Reported(outcome.ok()),
                joined = &mut handling => Dialogue::Returned(joined),
            };
            match step {
                Dialogue::Reported(Some(outcome)) => Some(outcome),
                // Every session handle is gone; the handler's own result
                // explains why.
                Dialogue::Reported(None) => handler_failure(&realm, (&mut handling).await),
                Dialogue::Returned(joined) => match handler_failure(&realm, joined) {
                    Some(failure) => Some(failure),
                    None => outcome_rx.await.ok(),
                },
            }
        };

        let outcome = match self.shared.config.challenge_timeout {
            Some(limit) => match tokio::time::timeout(limit, dialogue).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    abort.abort();
                    Some(ChallengeOutcome::Failure(format!(
                        "challenge for realm '{realm}' timed out after {limit:?}"
                    )))
                }
            },
            None => dialogue.await,
        }
        .unwrap_or_else(|| {
            ChallengeOutcome::Failure(format!(
                "challenge handler for realm '{realm}' finished without reporting an outcome"
            ))
        });

        match outcome {
            ChallengeOutcome::Success => self.finish_success(&realm, cycle, scope).await,
            ChallengeOutcome::Failure(reason) => self.finish_failure(&realm, cycle, reason),
        }
    }

    async fn finish_success(&self, realm: &str, cycle: u64, scope: Option<String>) {
        if let Err(err) = self.transition(realm, |machine| machine.succeed(cycle)) {
            self.finish_failure(realm, cycle, err.to_string());
            return;
        }
        self.emit_phase(realm, cycle, ChallengePhase::Succeeded, None);

        // Token requests for this scope parked on the cycle go first. The
        // fetch they belong to can only finish once they are replayed.
        let tokens = self
            .shared
            .realms()
            .queue
            .take_where(realm, |request| request.origin.fetches_token_for(scope.as_deref()));
        let mut report = self.replay_parked(realm, tokens).await;

        let joined = self.shared.authorization.join_fetch(scope.as_deref()).await;
        let refreshed = match joined {
            Some(result) => Some(result),
            None if self.shared.config.refresh_on_success => {
                let origin = RequestOrigin::AuthorizationRefresh {
                    realm: realm.to_string(),
                    scope: scope.clone(),
                };
                Some(self.obtain_with_origin(scope.clone(), true, origin).await)
            }
            None => None,
        };
        if let Some(Err(err)) = refreshed {
            log::warn!("could not refresh authorization header after realm '{realm}' succeeded: {err}");
            self.shared.authorization.invalidate(scope.as_deref()).await;
        }

        let (pending, logins) = {
            let mut table = self.shared.realms();
            let pending = table.queue.take(realm);
            if let Err(err) = table.machine_mut(realm).reset() {
                log::warn!("{err}");
            }
            table.authenticated.insert(realm.to_string(), scope);
            (pending, table.logins.remove(realm).unwrap_or_default())
        };
        for login in logins {
            let _ = login.send(Ok(()));
        }

        let rest = self.replay_parked(realm, pending).await;
        report.replayed += rest.replayed;
        report.skipped += rest.skipped;
        report.failed += rest.failed;

        self.emit(ClientEvent::Replay(ReplayEvent {
            realm: realm.to_string(),
            replayed: report.replayed,
            skipped: report.skipped,
            failed: report.failed,
            timestamp: Utc::now(),
        }));
    }

    async fn replay_parked(&self, realm: &str, pending: Vec<PendingRequest>) -> DrainReport {
        if pending.is_empty() {
            return DrainReport::default();
        }
        let pipeline = self.clone();
        let owner = realm.to_string();
        drain_success(pending, move |request| {
            let pipeline = pipeline.clone();
            let realm = owner.clone();
            async move {
                pipeline
                    .send(request.with_origin(RequestOrigin::Replay { realm }))
                    .await
            }
        })
        .await
    }

    fn finish_failure(&self, realm: &str, cycle: u64, reason: String) {
        let error = WlClientError::AuthenticationFailed(reason.clone());
        let (rejected, logins) = {
            let mut table = self.shared.realms();
            let machine = table.machine_mut(realm);
            if machine.phase() != ChallengePhase::Failed {
                if let Err(err) = machine.fail(cycle) {
                    log::warn!("{err}");
                }
            }
            if let Err(err) = machine.reset() {
                log::warn!("{err}");
            }
            table.authenticated.remove(realm);
            let logins = table.logins.remove(realm).unwrap_or_default();
            (table.queue.drain_failure(realm, &error), logins)
        };
        for login in logins {
            let _ = login.send(Err(error.clone()));
        }

        self.emit_phase(realm, cycle, ChallengePhase::Failed, Some(reason.clone()));
        self.emit(ClientEvent::Reject(RejectEvent {
            realm: realm.to_string(),
            count: rejected,
            reason,
            timestamp: Utc::now(),
        }));
    }

    fn transition<F>(&self, realm: &str, apply: F) -> Result<(), TransitionError>
    where
        F: FnOnce(&mut ChallengeStateMachine) -> Result<(), TransitionError>,
    {
        let mut table = self.shared.realms();
        apply(table.machine_mut(realm))
    }

    fn emit(&self, event: ClientEvent) {
        self.shared.events.dispatch(event);
    }

    fn emit_phase(&self, realm: &str, cycle: u64, phase: ChallengePhase, detail: Option<String>) {
        self.emit(ClientEvent::Challenge(ChallengeEvent {
            realm: realm.to_string(),
            cycle,
            phase,
            detail,
            timestamp: Utc::now(),
        }));
    }

    fn emit_parked(&self, realm: &str, queued: usize) {
        self.emit(ClientEvent::Parked(ParkedEvent {
            realm: realm.to_string(),
            queued,
            timestamp: Utc::now(),
        }));
    }
}

/// Failure outcome for a handler task that errored or panicked.
fn handler_failure(
    realm: &str,
    joined: Result<Result<(), String>, tokio::task::JoinError>,
) -> Option<ChallengeOutcome> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(ChallengeOutcome::Failure(format!(
            "challenge handler for realm '{realm}' failed: {err}"
        ))),
        Err(err) => Some(ChallengeOutcome::Failure(format!(
            "challenge handler for realm '{realm}' aborted: {err}"
        ))),
    }
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("base_url", &self.shared.config.base_url.as_str())
            .field("realms", &self.shared.registry.realms())
            .finish()
    }
}
