//! Provider-agnostic language-model client used by the routing pipeline.
//!
//! The platform consults a language model in exactly two places: stage-2
//! route adjudication and multi-agent query decomposition. Both only need a
//! single system-prompt + user-prompt completion returning text, so the
//! trait is deliberately small. Implementations **must** be thread-safe
//! (`Send + Sync`) so they can be shared between concurrent requests.
//!
//! [`OpenAiCompatClient`] speaks the OpenAI-compatible
//! `/chat/completions` wire format, which most hosted and self-hosted
//! gateways accept; tests substitute a deterministic fixture.
//!
//! ```rust,no_run
//! use agenthub::llm_client::{LlmClient, OpenAiCompatClient};
//!
//! # async {
//! let client = OpenAiCompatClient::new(
//!     "https://api.openai.com/v1",
//!     "secret-key",
//!     "gpt-4o-mini",
//! );
//! let answer = client.complete("You are terse.", "Say hello.").await.unwrap();
//! println!("{}", answer);
//! # };
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::agenthub::a2a_client::shared_http_client;

/// Default bound on one completion round-trip.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(15);

/// Trait defining the minimal completion interface the router and
/// decomposer depend on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion and return the assistant text.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Identifier of the upstream model (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;
}

/// Error raised by the OpenAI-compatible transport.
#[derive(Debug, Clone)]
pub struct LlmError {
    message: String,
}

impl LlmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LLM call failed: {}", self.message)
    }
}

impl Error for LlmError {}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Client for any endpoint exposing the OpenAI-compatible chat surface.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatClient {
    /// Create a client against `base_url` (without the trailing
    /// `/chat/completions`).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: shared_http_client().clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: DEFAULT_LLM_TIMEOUT,
        }
    }

    /// Override the per-call timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Box::new(LlmError::new(e.to_string())) as Box<dyn Error + Send + Sync>)?;

        if !response.status().is_success() {
            return Err(Box::new(LlmError::new(format!(
                "HTTP {} from {}",
                response.status(),
                url
            ))));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Box::new(LlmError::new(e.to_string())) as Box<dyn Error + Send + Sync>)?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                Box::new(LlmError::new("empty completion")) as Box<dyn Error + Send + Sync>
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
