//! High level client facade.
//!
//! Wires together the request pipeline, challenge registry, authorization
//! manager, and the event/metrics subsystems behind one explicit context
//! object. Every session is independent; nothing is global.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderValue;
use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

use crate::authorization::{AuthorizationManager, HeaderStore, PersistencePolicy};
use crate::challenges::core::{
	AdapterInvocation, DEFAULT_CHALLENGE_SCHEME, FORM_CONTENT_TYPE, RequestBuildError, ReqwestResourceTransport,
	ResourceRequest, ResourceResponse, ResourceTransport, TransportError, encode_form,
	get_authorization_scope, is_authorization_required,
};
use crate::challenges::handlers::{ChallengeHandler, CredentialsProvider, RealmBinding};
use crate::challenges::pipeline::{PipelineConfig, RequestPipeline};
use crate::challenges::registry::{ChallengeRegistry, RegistryError};
use crate::challenges::state::{ChallengePhase, TransitionError};
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler, MetricsHandler};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};

/// Result alias used across the client.
pub type WlClientResult<T> = Result<T, WlClientError>;

/// Error surfaced to callers of the client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WlClientError {
	#[error("request failed: {0}")]
	Request(#[from] TransportError),
	#[error("no challenge handler registered for realm '{realm}'")]
	UnhandledChallenge { realm: String },
	#[error("a challenge handler is already registered for realm '{realm}'")]
	DuplicateHandler { realm: String },
	#[error("challenge loop detected for realm '{realm}'")]
	ChallengeLoop { realm: String },
	#[error("authentication failed: {0}")]
	AuthenticationFailed(String),
	#[error("request timed out after {0:?}")]
	Timeout(Duration),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("authorization error: {0}")]
	Authorization(String),
	#[error("invalid challenge state: {0}")]
	InvalidTransition(#[from] TransitionError),
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error("request was cancelled")]
	Cancelled,
	#[error("procedure '{procedure}' failed: {reason}")]
	ProcedureFailed { procedure: String, reason: String },
}

impl From<RequestBuildError> for WlClientError {
	fn from(err: RequestBuildError) -> Self {
		WlClientError::InvalidRequest(err.to_string())
	}
}

impl From<RegistryError> for WlClientError {
	fn from(err: RegistryError) -> Self {
		match err {
			RegistryError::DuplicateHandler(realm) => WlClientError::DuplicateHandler { realm },
		}
	}
}

/// Token endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
	/// Path (relative to `base_url`) answering `GET ?scope=` with a token.
	pub token_path: String,
	/// Fetch a fresh header after a successful challenge, before replaying.
	pub refresh_on_success: bool,
}

impl Default for AuthorizationConfig {
	fn default() -> Self {
		Self {
			token_path: "/authorization/v1/token".to_string(),
			refresh_on_success: true,
		}
	}
}

/// Client configuration. Deserialisable from JSON; missing keys take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WlClientConfig {
	pub base_url: String,
	pub default_timeout_ms: u64,
	/// `null` lets a challenge cycle run without limit.
	pub challenge_timeout_ms: Option<u64>,
	pub challenge_scheme: String,
	pub default_realm: Option<String>,
	pub adapter_path: String,
	pub authorization: AuthorizationConfig,
	pub persistence_policy: PersistencePolicy,
	pub enable_metrics: bool,
	pub realms: Vec<RealmBinding>,
}

impl Default for WlClientConfig {
	fn default() -> Self {
		Self {
			base_url: "http://localhost:9080/mfp/api/".to_string(),
			default_timeout_ms: 30_000,
			challenge_timeout_ms: Some(120_000),
			challenge_scheme: DEFAULT_CHALLENGE_SCHEME.to_string(),
			default_realm: None,
			adapter_path: "/adapters".to_string(),
			authorization: AuthorizationConfig::default(),
			persistence_policy: PersistencePolicy::Never,
			enable_metrics: true,
			realms: Vec::new(),
		}
	}
}

impl WlClientConfig {
	pub fn from_json(json: &str) -> WlClientResult<Self> {
		serde_json::from_str(json).map_err(|err| WlClientError::Configuration(err.to_string()))
	}

	fn pipeline_config(&self) -> WlClientResult<PipelineConfig> {
		if self.default_timeout_ms == 0 {
			return Err(WlClientError::Configuration(
				"default_timeout_ms must be greater than zero".into(),
			));
		}
		if self.challenge_scheme.trim().is_empty() {
			return Err(WlClientError::Configuration("challenge_scheme must not be empty".into()));
		}

		// Relative request URLs join onto the base, so it must end with '/'.
		let mut base = self.base_url.trim().to_string();
		if !base.ends_with('/') {
			base.push('/');
		}
		let base_url = Url::parse(&base)
			.map_err(|err| WlClientError::Configuration(format!("invalid base_url '{base}': {err}")))?;

		Ok(PipelineConfig {
			base_url,
			default_timeout: Duration::from_millis(self.default_timeout_ms),
			challenge_timeout: self.challenge_timeout_ms.map(Duration::from_millis),
			challenge_scheme: self.challenge_scheme.trim().to_string(),
			default_realm: self.default_realm.clone(),
			adapter_path: self.adapter_path.clone(),
			token_path: self.authorization.token_path.clone(),
			refresh_on_success: self.authorization.refresh_on_success,
		})
	}
}

/// Fluent builder for [`WlClient`].
pub struct WlClientBuilder {
	config: WlClientConfig,
	transport: Option<Arc<dyn ResourceTransport>>,
	header_store: Option<Arc<dyn HeaderStore>>,
	credentials: Option<Arc<dyn CredentialsProvider>>,
	handlers: Vec<(String, Arc<dyn ChallengeHandler>)>,
	event_handlers: Vec<Arc<dyn EventHandler>>,
}

impl WlClientBuilder {
	pub fn new() -> Self {
		Self {
			config: WlClientConfig::default(),
			transport: None,
			header_store: None,
			credentials: None,
			handlers: Vec::new(),
			event_handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: WlClientConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
		self.config.base_url = base_url.into();
		self
	}

	pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
		self.config.default_timeout_ms = millis(timeout);
		self
	}

	/// Bound each challenge cycle; `None` removes the bound.
	pub fn with_challenge_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.config.challenge_timeout_ms = timeout.map(millis);
		self
	}

	pub fn with_challenge_scheme(mut self, scheme: impl Into<String>) -> Self {
		self.config.challenge_scheme = scheme.into();
		self
	}

	pub fn with_default_realm(mut self, realm: impl Into<String>) -> Self {
		self.config.default_realm = Some(realm.into());
		self
	}

	pub fn with_adapter_path(mut self, path: impl Into<String>) -> Self {
		self.config.adapter_path = path.into();
		self
	}

	pub fn with_token_path(mut self, path: impl Into<String>) -> Self {
		self.config.authorization.token_path = path.into();
		self
	}

	pub fn disable_refresh_on_success(mut self) -> Self {
		self.config.authorization.refresh_on_success = false;
		self
	}

	pub fn with_persistence_policy(mut self, policy: PersistencePolicy) -> Self {
		self.config.persistence_policy = policy;
		self
	}

	pub fn with_header_store(mut self, store: Arc<dyn HeaderStore>) -> Self {
		self.header_store = Some(store);
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn ResourceTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Credentials used by handlers built from realm bindings.
	pub fn with_credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
		self.credentials = Some(provider);
		self
	}

	pub fn with_realm_binding(mut self, binding: RealmBinding) -> Self {
		self.config.realms.push(binding);
		self
	}

	pub fn with_challenge_handler(
		mut self,
		realm: impl Into<String>,
		handler: Arc<dyn ChallengeHandler>,
	) -> Self {
		self.handlers.push((realm.into(), handler));
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.event_handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> WlClientResult<WlClient> {
		let pipeline_config = self.config.pipeline_config()?;

		let transport: Arc<dyn ResourceTransport> = match self.transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestResourceTransport::new()?),
		};

		let registry = Arc::new(ChallengeRegistry::new());
		if !self.config.realms.is_empty() {
			let credentials = self.credentials.ok_or_else(|| {
				WlClientError::Configuration(
					"realm bindings need a credentials provider".into(),
				)
			})?;
			for binding in &self.config.realms {
				registry.register(binding.realm.clone(), binding.handler.build(credentials.clone()))?;
			}
		}
		for (realm, handler) in self.handlers {
			registry.register(realm, handler)?;
		}

		let metrics = self.config.enable_metrics.then(MetricsCollector::new);

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in self.event_handlers {
			events.register_handler(handler);
		}

		let authorization = AuthorizationManager::new(self.config.persistence_policy, self.header_store);
		let pipeline = RequestPipeline::new(pipeline_config, transport, registry, authorization, events);

		log::debug!(
			"client ready for {} with realms {:?}",
			pipeline.config().base_url,
			pipeline.registry().realms()
		);

		Ok(WlClient { pipeline, metrics })
	}
}

fn millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for WlClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// In-flight request started with [`WlClient::spawn_send`].
///
/// Await it for the response. Cancelling (or dropping the client side of a
/// parked request) removes it from its realm queue; a running challenge cycle
/// is not affected.
#[derive(Debug)]
pub struct SendHandle {
	handle: JoinHandle<WlClientResult<ResourceResponse>>,
}

impl SendHandle {
	pub fn cancel(&self) {
		self.handle.abort();
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}
}

impl Future for SendHandle {
	type Output = WlClientResult<ResourceResponse>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.handle)
			.poll(cx)
			.map(|joined| joined.unwrap_or(Err(WlClientError::Cancelled)))
	}
}

/// Client session. Cheap to clone; clones share all state.
#[derive(Clone, Debug)]
pub struct WlClient {
	pipeline: RequestPipeline,
	metrics: Option<MetricsCollector>,
}

impl WlClient {
	/// Construct a client from `config` with the reqwest transport.
	pub fn new(config: WlClientConfig) -> WlClientResult<Self> {
		WlClient::builder().with_config(config).build()
	}

	pub fn builder() -> WlClientBuilder {
		WlClientBuilder::new()
	}

	pub fn config(&self) -> &PipelineConfig {
		self.pipeline.config()
	}

	/// Send `request`, running a challenge cycle first if its realm asks
	/// for authentication.
	pub async fn send(&self, request: ResourceRequest) -> WlClientResult<ResourceResponse> {
		self.pipeline.send(request).await
	}

	pub async fn send_with_body(
		&self,
		request: ResourceRequest,
		body: impl Into<Bytes>,
	) -> WlClientResult<ResourceResponse> {
		self.pipeline.send(request.with_body(body)).await
	}

	/// Send `parameters` as a URL-encoded form body.
	pub async fn send_form_parameters<I, K, V>(
		&self,
		request: ResourceRequest,
		parameters: I,
	) -> WlClientResult<ResourceResponse>
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: AsRef<str>,
	{
		let request = request
			.with_header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
			.with_body(encode_form(parameters));
		self.pipeline.send(request).await
	}

	/// Send on a spawned task. The returned handle can be awaited or
	/// cancelled.
	pub fn spawn_send(&self, request: ResourceRequest) -> SendHandle {
		let pipeline = self.pipeline.clone();
		SendHandle {
			handle: tokio::spawn(async move { pipeline.send(request).await }),
		}
	}

	/// Call an adapter procedure. A JSON body with `isSuccessful: false` fails
	/// with `ProcedureFailed`.
	pub async fn invoke_procedure(&self, invocation: &AdapterInvocation) -> WlClientResult<ResourceResponse> {
		let request = invocation.to_request(self.pipeline.adapter_path())?;
		let response = self.pipeline.send(request).await?;

		let json = response.json();
		let successful = json
			.and_then(|json| json.get("isSuccessful"))
			.and_then(|value| value.as_bool());
		if successful == Some(false) {
			let reason = json
				.and_then(|json| json.get("errors"))
				.and_then(|errors| errors.as_array())
				.and_then(|errors| errors.first())
				.and_then(|error| error.as_str())
				.map(str::to_string)
				.unwrap_or_else(|| format!("unsuccessful with status {}", response.status()));
			return Err(WlClientError::ProcedureFailed {
				procedure: format!("{}/{}", invocation.adapter, invocation.procedure),
				reason,
			});
		}
		Ok(response)
	}

	/// Authenticate to `realm` through its handler without waiting for a
	/// challenge.
	pub async fn login(&self, realm: &str) -> WlClientResult<()> {
		self.pipeline.login(realm).await
	}

	/// Log out of `realm`, or of the default realm when `None`. Returns false
	/// when there was nothing to log out of.
	pub async fn logout(&self, realm: Option<&str>) -> bool {
		match self.realm_or_default(realm) {
			Some(realm) => self.pipeline.logout(&realm).await,
			None => false,
		}
	}

	/// Whether the user is authenticated in `realm`, or in the default realm
	/// when `None`.
	pub fn is_user_authenticated(&self, realm: Option<&str>) -> bool {
		self.realm_or_default(realm)
			.is_some_and(|realm| self.pipeline.is_user_authenticated(&realm))
	}

	fn realm_or_default(&self, realm: Option<&str>) -> Option<String> {
		realm
			.map(str::to_string)
			.or_else(|| self.pipeline.config().default_realm.clone())
	}

	pub fn register_challenge_handler(
		&self,
		realm: impl Into<String>,
		handler: Arc<dyn ChallengeHandler>,
	) -> WlClientResult<()> {
		Ok(self.pipeline.registry().register(realm, handler)?)
	}

	/// Register `handler`, replacing (and returning) any existing one.
	pub fn replace_challenge_handler(
		&self,
		realm: impl Into<String>,
		handler: Arc<dyn ChallengeHandler>,
	) -> Option<Arc<dyn ChallengeHandler>> {
		self.pipeline.registry().register_or_replace(realm, handler)
	}

	pub fn unregister_challenge_handler(&self, realm: &str) -> Option<Arc<dyn ChallengeHandler>> {
		self.pipeline.registry().unregister(realm)
	}

	pub fn registered_realms(&self) -> Vec<String> {
		self.pipeline.registry().realms()
	}

	/// Authorization header for `scope` (`None` = default scope), fetched
	/// only when nothing is cached.
	pub async fn obtain_authorization_header(&self, scope: Option<&str>) -> WlClientResult<String> {
		self.pipeline
			.obtain_authorization_header(scope.map(str::to_string), false)
			.await
	}

	pub async fn refresh_authorization_header(&self, scope: Option<&str>) -> WlClientResult<String> {
		self.pipeline
			.obtain_authorization_header(scope.map(str::to_string), true)
			.await
	}

	pub async fn get_cached_authorization_header(&self, scope: Option<&str>) -> Option<String> {
		self.pipeline.authorization().cached(scope).await
	}

	/// Attach the cached header for the request's scope, if any.
	pub async fn add_cached_authorization_header(
		&self,
		mut request: ResourceRequest,
	) -> WlClientResult<ResourceRequest> {
		let cached = self.pipeline.authorization().cached(request.scope()).await;
		if let Some(header) = cached {
			request.set_header(AUTHORIZATION.as_str(), &header)?;
		}
		Ok(request)
	}

	pub async fn invalidate_authorization_header(&self, scope: Option<&str>) {
		self.pipeline.authorization().invalidate(scope).await;
	}

	/// Whether `response` carries a challenge of the configured scheme.
	pub fn is_authorization_required(&self, response: &ResourceResponse) -> bool {
		is_authorization_required(
			response.status(),
			response.header(WWW_AUTHENTICATE),
			&self.pipeline.config().challenge_scheme,
		)
	}

	pub fn get_authorization_scope(&self, response: &ResourceResponse) -> Option<String> {
		response.header(WWW_AUTHENTICATE).and_then(get_authorization_scope)
	}

	pub fn authorization_persistence_policy(&self) -> PersistencePolicy {
		self.pipeline.authorization().persistence_policy()
	}

	pub fn set_authorization_persistence_policy(&self, policy: PersistencePolicy) {
		self.pipeline.authorization().set_persistence_policy(policy);
	}

	pub fn challenge_phase(&self, realm: &str) -> ChallengePhase {
		self.pipeline.challenge_phase(realm)
	}

	pub fn is_challenge_active(&self, realm: &str) -> bool {
		self.pipeline.challenge_phase(realm).is_active()
	}

	/// Requests parked on `realm` waiting for its challenge to finish.
	pub fn pending_requests(&self, realm: &str) -> usize {
		self.pipeline.pending_requests(realm)
	}

	pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_defaults_and_json_overrides() {
		let config = WlClientConfig::from_json(
			r#"{
				"base_url": "https://mfp.example.com/mfp/api",
				"challenge_timeout_ms": null,
				"authorization": {"refresh_on_success": false},
				"persistence_policy": "BIOMETRICS",
				"realms": [{"realm": "AuthRealm", "kind": "adapter", "adapter": "AuthAdapter", "procedure": "submit"}]
			}"#,
		)
		.unwrap();

		assert_eq!(config.default_timeout_ms, 30_000);
		assert_eq!(config.challenge_timeout_ms, None);
		assert_eq!(config.authorization.token_path, "/authorization/v1/token");
		assert!(!config.authorization.refresh_on_success);
		assert_eq!(config.persistence_policy, PersistencePolicy::Biometrics);
		assert_eq!(config.realms.len(), 1);

		let pipeline = config.pipeline_config().unwrap();
		assert_eq!(pipeline.base_url.as_str(), "https://mfp.example.com/mfp/api/");
		assert_eq!(pipeline.default_timeout, Duration::from_secs(30));
		assert_eq!(pipeline.challenge_timeout, None);
	}

	#[test]
	fn rejects_unusable_configuration() {
		let config = WlClientConfig {
			default_timeout_ms: 0,
			..WlClientConfig::default()
		};
		assert!(matches!(config.pipeline_config(), Err(WlClientError::Configuration(_))));

		let config = WlClientConfig {
			base_url: "not a url".into(),
			..WlClientConfig::default()
		};
		assert!(matches!(config.pipeline_config(), Err(WlClientError::Configuration(_))));

		assert!(matches!(
			WlClientConfig::from_json("{\"default_timeout_ms\": \"soon\"}"),
			Err(WlClientError::Configuration(_))
		));
	}

	#[test]
	fn realm_bindings_require_credentials() {
		let err = WlClient::builder()
			.with_transport(Arc::new(NeverTransport))
			.with_realm_binding(
				serde_json::from_str(r#"{"realm": "R", "kind": "login_form", "url": "/j_security_check"}"#)
					.unwrap(),
			)
			.build()
			.unwrap_err();
		assert!(matches!(err, WlClientError::Configuration(_)));
	}

	#[test]
	fn builder_durations_saturate_instead_of_truncating() {
		let builder = WlClient::builder()
			.with_default_timeout(Duration::from_millis(1500))
			.with_challenge_timeout(Some(Duration::MAX));
		assert_eq!(builder.config.default_timeout_ms, 1500);
		assert_eq!(builder.config.challenge_timeout_ms, Some(u64::MAX));
	}

	#[test]
	fn registry_errors_map_to_duplicate_handler() {
		let err: WlClientError = RegistryError::DuplicateHandler("R".into()).into();
		assert_eq!(err, WlClientError::DuplicateHandler { realm: "R".into() });
	}

	struct NeverTransport;

	#[async_trait::async_trait]
	impl ResourceTransport for NeverTransport {
		async fn transmit(
			&self,
			_method: &http::Method,
			_url: &Url,
			_headers: &http::HeaderMap,
			_body: Option<&[u8]>,
			_timeout: Duration,
		) -> Result<crate::challenges::core::RawResponse, TransportError> {
			Err(TransportError::Unreachable)
		}
	}
}
