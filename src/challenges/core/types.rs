//! Core data structures shared across the request pipeline, challenge handlers,
//! and the authorization layer.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::transport::RawResponse;

/// Problems detected while assembling a [`ResourceRequest`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestBuildError {
    #[error("request URL must be specified")]
    MissingUrl,
    #[error("request method '{0}' is invalid or not supported")]
    UnsupportedMethod(String),
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("invalid request URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Who issued a request. Used to reject challenge loops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum RequestOrigin {
    #[default]
    Caller,
    /// Explicit `obtain_authorization_header` round trip for `scope`.
    Authorization { scope: Option<String> },
    /// Credentials submitted by the handler of `realm`.
    Submission { realm: String },
    /// Replay of a request parked on `realm`.
    Replay { realm: String },
    /// Token refresh for `scope` after a successful cycle on `realm`.
    AuthorizationRefresh {
        realm: String,
        scope: Option<String>,
    },
}

impl RequestOrigin {
    /// A challenge for `realm` on a request with this origin would recurse.
    pub(crate) fn loops_on(&self, realm: &str) -> bool {
        match self {
            RequestOrigin::Submission { realm: own }
            | RequestOrigin::Replay { realm: own }
            | RequestOrigin::AuthorizationRefresh { realm: own, .. } => own == realm,
            RequestOrigin::Caller | RequestOrigin::Authorization { .. } => false,
        }
    }

    /// Whether this is a token endpoint request fetching the header for `scope`.
    pub(crate) fn fetches_token_for(&self, scope: Option<&str>) -> bool {
        match self {
            RequestOrigin::Authorization { scope: own }
            | RequestOrigin::AuthorizationRefresh { scope: own, .. } => own.as_deref() == scope,
            _ => false,
        }
    }

    /// Whether the cached authorization header should be attached.
    pub(crate) fn carries_authorization(&self) -> bool {
        matches!(self, RequestOrigin::Caller | RequestOrigin::Replay { .. })
    }
}

/// Outbound request against a protected resource or adapter procedure.
///
/// The URL is either absolute or relative to the client base URL (adapter
/// calls use the `/adapters/<adapter>/<procedure>` form). Headers keep their
/// insertion order and compare names case-insensitively.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    url: String,
    method: Method,
    headers: HeaderMap,
    query: BTreeMap<String, String>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    realm: Option<String>,
    scope: Option<String>,
    pub(crate) origin: RequestOrigin,
}

impl ResourceRequest {
    pub fn new(url: impl AsRef<str>, method: Method) -> Result<Self, RequestBuildError> {
        let url = url.as_ref().trim();
        if url.is_empty() {
            return Err(RequestBuildError::MissingUrl);
        }
        if !is_supported_method(&method) {
            return Err(RequestBuildError::UnsupportedMethod(method.to_string()));
        }

        Ok(Self {
            url: url.to_string(),
            method,
            headers: HeaderMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout: None,
            realm: None,
            scope: None,
            origin: RequestOrigin::Caller,
        })
    }

    pub fn get(url: impl AsRef<str>) -> Result<Self, RequestBuildError> {
        Self::new(url, Method::GET)
    }

    pub fn post(url: impl AsRef<str>) -> Result<Self, RequestBuildError> {
        Self::new(url, Method::POST)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn query_parameters(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// Replace all query parameters.
    pub fn set_query_parameters<I, K, V>(&mut self, parameters: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.query = parameters
            .into_iter()
            .map(|(name, value)| (name.into(), value.to_string()))
            .collect();
    }

    pub fn set_query_parameter(&mut self, name: impl Into<String>, value: impl ToString) {
        self.query.insert(name.into(), value.to_string());
    }

    pub fn with_query_parameter(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set_query_parameter(name, value);
        self
    }

    /// All values of `name`, in insertion order.
    pub fn headers(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect()
    }

    pub fn header_names(&self) -> Vec<String> {
        self.headers.keys().map(|name| name.as_str().to_string()).collect()
    }

    /// First value of `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn header_map(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    /// Set `name`, replacing any existing values.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), RequestBuildError> {
        let (name, value) = parse_header(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Append a value to `name`, keeping existing values.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), RequestBuildError> {
        let (name, value) = parse_header(name, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub(crate) fn remove_header(&mut self, name: HeaderName) {
        self.headers.remove(name);
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Realm this request is known to be protected by, if any.
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Authorization scope whose cached header is attached on send.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub(crate) fn set_scope(&mut self, scope: Option<String>) {
        self.scope = scope;
    }

    pub(crate) fn with_origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Resolve the request URL against `base`, appending query parameters.
    pub fn resolve_url(&self, base: &Url) -> Result<Url, RequestBuildError> {
        let invalid = |err: url::ParseError| RequestBuildError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        };

        let mut resolved = match Url::parse(&self.url) {
            Ok(absolute) if absolute.has_host() => absolute,
            _ => base
                .join(self.url.trim_start_matches('/'))
                .map_err(invalid)?,
        };

        if !self.query.is_empty() {
            let mut pairs = resolved.query_pairs_mut();
            for (name, value) in &self.query {
                pairs.append_pair(name, value);
            }
        }

        Ok(resolved)
    }
}

/// Methods accepted by the resource request surface.
pub fn is_supported_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET
            | Method::POST
            | Method::PUT
            | Method::DELETE
            | Method::HEAD
            | Method::OPTIONS
            | Method::TRACE
            | Method::CONNECT
    )
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), RequestBuildError> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| RequestBuildError::InvalidHeader(name.to_string()))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| RequestBuildError::InvalidHeader(name.to_string()))?;
    Ok((header_name, header_value))
}

/// Content type used for URL-encoded form submissions.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// URL-encode `pairs` as a form body.
pub fn encode_form<I, K, V>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Read-only response handed back to callers and challenge handlers.
#[derive(Debug, Clone)]
pub struct ResourceResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    json: Option<Value>,
}

impl ResourceResponse {
    pub fn from_raw(raw: RawResponse) -> Self {
        let is_json = raw
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("json"))
            .unwrap_or(false);
        let json = if is_json {
            serde_json::from_slice(&raw.body).ok()
        } else {
            None
        };

        Self {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            url: raw.url,
            json,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Final URL the response was served from.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parsed body, present only when the content type is JSON and it parsed.
    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }
}

/// Adapter procedure call used for adapter-based authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInvocation {
    pub adapter: String,
    pub procedure: String,
    pub parameters: Vec<Value>,
}

impl AdapterInvocation {
    pub fn new(adapter: impl Into<String>, procedure: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            procedure: procedure.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters<I, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// Relative URL of the procedure below `adapter_path`.
    pub fn path(&self, adapter_path: &str) -> String {
        format!(
            "{}/{}/{}",
            adapter_path.trim_end_matches('/'),
            self.adapter,
            self.procedure
        )
    }

    /// POST request calling the procedure, parameters JSON-encoded in the
    /// `params` form field.
    pub fn to_request(&self, adapter_path: &str) -> Result<ResourceRequest, RequestBuildError> {
        let params = Value::Array(self.parameters.clone()).to_string();
        Ok(ResourceRequest::post(self.path(adapter_path))?
            .with_header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
            .with_body(encode_form([("params", params.as_str())])))
    }
}
