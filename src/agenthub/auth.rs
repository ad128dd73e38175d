//! Bearer-token verification against the external identity service.
//!
//! The platform never issues or decodes tokens itself; it forwards the
//! caller's bearer to the identity service's verification endpoint and
//! receives the claims back. The [`TokenVerifier`] trait keeps that
//! dependency swappable — tests use [`StaticTokenVerifier`], and a local
//! JWT verifier could drop in without touching the orchestrator.
//!
//! The verified bearer is request-scoped: it is threaded through the
//! dispatch pipeline and consumed only by the A2A client and this module.
//! It is never persisted and never sent to the language model.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::agenthub::a2a_client::shared_http_client;

/// Default bound on one verification round-trip.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Claims extracted from a successfully verified bearer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    /// Stable identity of the caller (e.g. `"vishal"`).
    pub user_id: String,
    /// Authorization role (e.g. `"user"`, `"admin"`).
    pub role: String,
}

/// Verification failures.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// The token was examined and refused. Surfaced to the caller as 401.
    Unauthorized(String),
    /// The identity service could not be consulted at all.
    Upstream(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            AuthError::Upstream(msg) => write!(f, "auth service unavailable: {}", msg),
        }
    }
}

impl Error for AuthError {}

/// Trait seam for bearer verification.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `bearer` and return its claims.
    async fn verify(&self, bearer: &str) -> Result<AuthClaims, AuthError>;
}

#[derive(Deserialize)]
struct VerifyResponse {
    user_id: String,
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Verifier that POSTs the bearer to `<auth_service_url>/verify`.
pub struct HttpTokenVerifier {
    http: reqwest::Client,
    verify_url: String,
    timeout: Duration,
}

impl HttpTokenVerifier {
    pub fn new(auth_service_url: impl Into<String>) -> Self {
        let base = auth_service_url.into();
        Self {
            http: shared_http_client().clone(),
            verify_url: format!("{}/verify", base.trim_end_matches('/')),
            timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    /// Override the verification timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<AuthClaims, AuthError> {
        let response = self
            .http
            .post(&self.verify_url)
            .bearer_auth(bearer)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AuthError::Upstream(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AuthError::Unauthorized("token rejected".to_string()));
        }
        if !response.status().is_success() {
            return Err(AuthError::Upstream(format!(
                "HTTP {} from verification endpoint",
                response.status()
            )));
        }

        let parsed: VerifyResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Upstream(e.to_string()))?;

        Ok(AuthClaims {
            user_id: parsed.user_id,
            role: parsed.role,
        })
    }
}

/// Fixed token → claims mapping for development and tests.
///
/// ```rust
/// use agenthub::auth::{AuthClaims, StaticTokenVerifier, TokenVerifier};
///
/// # async {
/// let verifier = StaticTokenVerifier::new()
///     .with_token("tok-alice", AuthClaims { user_id: "alice".into(), role: "user".into() });
///
/// assert!(verifier.verify("tok-alice").await.is_ok());
/// assert!(verifier.verify("tok-bogus").await.is_err());
/// # };
/// ```
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, AuthClaims>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token (builder pattern).
    pub fn with_token(mut self, bearer: impl Into<String>, claims: AuthClaims) -> Self {
        self.tokens.insert(bearer.into(), claims);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<AuthClaims, AuthError> {
        self.tokens
            .get(bearer)
            .cloned()
            .ok_or_else(|| AuthError::Unauthorized("unknown token".to_string()))
    }
}
