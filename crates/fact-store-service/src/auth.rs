use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::http::{header, HeaderMap};
use fact_store_core::Principal;
use serde::Deserialize;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuthError {
    /// The provider answered and the credential is not valid.
    #[error("credential rejected: {0}")]
    Rejected(String),
    /// The provider could not be asked.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a bearer token to a principal. Implementations may block.
pub trait TokenVerifier: Send + Sync {
    fn verifier_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Fixed token table for local development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: BTreeMap<String, Principal>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), Principal::new(user_id));
        self
    }

    /// Builds a table from `TOKEN=USER_ID` pairs.
    pub fn from_pairs(pairs: &[String]) -> Result<Self> {
        let mut verifier = Self::new();
        for pair in pairs {
            let (token, user_id) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("static token must be TOKEN=USER_ID, got '{pair}'"))?;
            if token.is_empty() || user_id.is_empty() {
                return Err(anyhow!("static token must be TOKEN=USER_ID, got '{pair}'"));
            }
            verifier = verifier.with_token(token, user_id);
        }
        Ok(verifier)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verifier_name(&self) -> &'static str {
        "static"
    }

    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Rejected("unknown token".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct IdentityUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Asks the hosted identity provider who owns a token (`GET {base}/auth/v1/user`).
#[derive(Debug, Clone)]
pub struct RemoteTokenVerifier {
    user_url: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl RemoteTokenVerifier {
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            user_url: format!("{}/auth/v1/user", base_url.trim_end_matches('/')),
            api_key,
            agent,
        }
    }
}

impl TokenVerifier for RemoteTokenVerifier {
    fn verifier_name(&self) -> &'static str {
        "remote"
    }

    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let mut req = self
            .agent
            .get(&self.user_url)
            .set("authorization", &format!("Bearer {token}"));
        if let Some(key) = &self.api_key {
            req = req.set("apikey", key);
        }

        match req.call() {
            Ok(response) => {
                let user: IdentityUser = response.into_json().map_err(|err| {
                    AuthError::Unavailable(format!("invalid identity response: {err}"))
                })?;
                if user.id.trim().is_empty() {
                    return Err(AuthError::Rejected(
                        "identity response has no user id".to_string(),
                    ));
                }
                Ok(Principal {
                    id: fact_store_core::PrincipalId(user.id),
                    email: user.email,
                })
            }
            Err(ureq::Error::Status(code, _)) => Err(AuthError::Rejected(format!(
                "identity provider returned http status {code}"
            ))),
            Err(ureq::Error::Transport(err)) => Err(AuthError::Unavailable(format!(
                "http transport failure: {err}"
            ))),
        }
    }
}

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
