//! Authorization challenge parsing helpers.
//!
//! Inspects `WWW-Authenticate` style headers to decide whether a response is
//! an authorization challenge and which realm/scope it belongs to.

use std::collections::HashMap;

use http::header::WWW_AUTHENTICATE;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use super::types::ResourceResponse;

/// Scheme used when none is configured.
pub const DEFAULT_CHALLENGE_SCHEME: &str = "Bearer";

/// A parsed `WWW-Authenticate` header: scheme token plus auth-params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateHeader {
    pub scheme: String,
    pub params: HashMap<String, String>,
}

impl AuthenticateHeader {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (scheme, rest) = match raw.find(char::is_whitespace) {
            Some(index) => (&raw[..index], &raw[index..]),
            None => (raw, ""),
        };
        if scheme.is_empty() || scheme.contains('=') {
            return None;
        }

        let params = AUTH_PARAM_RE
            .captures_iter(rest)
            .filter_map(|caps| {
                let name = caps.name("name")?.as_str().to_ascii_lowercase();
                let value = caps
                    .name("quoted")
                    .map(|m| m.as_str().replace("\\\"", "\""))
                    .or_else(|| caps.name("token").map(|m| m.as_str().to_string()))?;
                Some((name, value))
            })
            .collect();

        Some(Self {
            scheme: scheme.to_string(),
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn scheme_matches(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }
}

/// Whether a status/header pair is an authorization challenge for `scheme`.
///
/// 401 with the scheme is always a challenge; 403 only when the server says
/// the current token lacks scope.
pub fn is_authorization_required(status: u16, header: Option<&str>, scheme: &str) -> bool {
    let Some(parsed) = header.and_then(AuthenticateHeader::parse) else {
        return false;
    };
    if !parsed.scheme_matches(scheme) {
        return false;
    }

    match status {
        401 => true,
        403 => parsed.param("error") == Some("insufficient_scope"),
        _ => false,
    }
}

/// Scope named by the challenge header, if any.
pub fn get_authorization_scope(header: &str) -> Option<String> {
    AuthenticateHeader::parse(header)
        .and_then(|parsed| parsed.param("scope").map(str::to_string))
        .filter(|scope| !scope.is_empty())
}

/// Challenge handed to a realm's handler.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: String,
    pub scope: Option<String>,
    pub scheme: String,
    pub params: HashMap<String, String>,
    pub status: u16,
    pub body: Option<Value>,
}

/// Outcome of inspecting a response for a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDetection {
    None,
    /// A challenge was recognised but names no realm and no default exists.
    MissingRealm,
}

impl Challenge {
    /// Challenge for an explicit login to `realm`, raised by the client
    /// rather than by a server response.
    pub fn solicited(realm: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            scope: None,
            scheme: scheme.into(),
            params: HashMap::new(),
            status: 401,
            body: None,
        }
    }

    /// Build the challenge for `response`, or report why there is none.
    ///
    /// The realm comes from the `realm` auth-param, then the scope, then
    /// `default_realm`.
    pub fn from_response(
        response: &ResourceResponse,
        scheme: &str,
        default_realm: Option<&str>,
    ) -> Result<Self, ChallengeDetection> {
        let header = response.header(WWW_AUTHENTICATE);
        if !is_authorization_required(response.status(), header, scheme) {
            return Err(ChallengeDetection::None);
        }
        let parsed = header
            .and_then(AuthenticateHeader::parse)
            .ok_or(ChallengeDetection::None)?;

        let scope = parsed.param("scope").filter(|s| !s.is_empty()).map(str::to_string);
        let realm = parsed
            .param("realm")
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .or_else(|| scope.clone())
            .or_else(|| default_realm.map(str::to_string))
            .ok_or(ChallengeDetection::MissingRealm)?;

        Ok(Self {
            realm,
            scope,
            scheme: parsed.scheme,
            params: parsed.params,
            status: response.status(),
            body: response.json().cloned(),
        })
    }
}

static AUTH_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"(?P<name>[A-Za-z0-9_\-]+)\s*=\s*(?:"(?P<quoted>(?:[^"\\]|\\.)*)"|(?P<token>[^\s,"]+))"#,
    )
    .build()
    .unwrap()
});
