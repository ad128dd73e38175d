//! Typed client for invoking remote agents over the A2A protocol.
//!
//! Each remote agent publishes an agent card; the card names the invocation
//! endpoint. Invoking an agent POSTs the sub-query plus a correlation id to
//! that endpoint with the caller's verified bearer in the `Authorization`
//! header. The bearer travels to exactly one destination per call — it is
//! never forwarded anywhere else and never cached between requests.
//!
//! Failures never surface as `Err`: an [`InvocationOutcome`] always comes
//! back, with `success = false` and an error message on timeout, non-2xx
//! status, or a malformed body. The orchestrator records the outcome either
//! way and degrades the combined response instead of failing the request.
//!
//! # Card cache
//!
//! Cards are cached by URL with a TTL (default 5 minutes). A stale entry is
//! served immediately while a background task refreshes it
//! (stale-while-revalidate); only one refresh per URL runs at a time.

use lazy_static::lazy_static;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agenthub::agent_card::{fetch_card, AgentCard, CardInvalid};

/// Default bound on one A2A invocation.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on fetching an agent card.
pub const DEFAULT_CARD_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Default freshness window for cached cards.
pub const DEFAULT_CARD_TTL: Duration = Duration::from_secs(300);

lazy_static! {
    /// Process-wide pooled HTTP client shared by every outbound call
    /// (A2A invocations, card fetches, LLM and auth round-trips).
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::Client::builder()
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build shared HTTP client");
}

/// Borrow the shared pooled HTTP client.
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Result of one A2A invocation, successful or not.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    /// Agent response text; empty on failure.
    pub response: String,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
    /// Whether the agent produced a usable response.
    pub success: bool,
    /// Failure detail when `!success` (e.g. `"timeout"`).
    pub error_message: Option<String>,
}

impl InvocationOutcome {
    /// A successful outcome.
    pub fn ok(response: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            response: response.into(),
            duration_ms,
            success: true,
            error_message: None,
        }
    }

    /// A failed outcome with an error message.
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            response: String::new(),
            duration_ms,
            success: false,
            error_message: Some(error.into()),
        }
    }
}

#[derive(Deserialize)]
struct InvokeResponseBody {
    response: Option<String>,
    #[serde(alias = "text", alias = "output")]
    content: Option<String>,
}

#[derive(Clone)]
struct CachedCard {
    card: AgentCard,
    fetched_at: Instant,
    refreshing: bool,
}

/// HTTP client for the A2A protocol with a TTL'd card cache.
pub struct A2aClient {
    http: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedCard>>>,
    card_ttl: Duration,
    card_fetch_timeout: Duration,
    invoke_timeout: Duration,
}

impl A2aClient {
    pub fn new() -> Self {
        Self {
            http: shared_http_client().clone(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            card_ttl: DEFAULT_CARD_TTL,
            card_fetch_timeout: DEFAULT_CARD_FETCH_TIMEOUT,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    /// Override the default invocation timeout (builder pattern).
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Override the card cache TTL (builder pattern).
    pub fn with_card_ttl(mut self, ttl: Duration) -> Self {
        self.card_ttl = ttl;
        self
    }

    /// Default invocation timeout, used when no per-agent override exists.
    pub fn invoke_timeout(&self) -> Duration {
        self.invoke_timeout
    }

    /// Fetch the card for `url`, serving from cache when possible.
    ///
    /// Fresh entries are returned directly. Stale entries are returned as-is
    /// while one background refresh per URL updates the cache — the request
    /// path never blocks on a refresh.
    pub async fn agent_card(&self, url: &str) -> Result<AgentCard, CardInvalid> {
        {
            let mut cache = self.cache.write().await;
            if let Some(entry) = cache.get_mut(url) {
                if entry.fetched_at.elapsed() < self.card_ttl {
                    debug!("card cache hit for {}", url);
                    return Ok(entry.card.clone());
                }
                if !entry.refreshing {
                    entry.refreshing = true;
                    self.spawn_refresh(url.to_string());
                }
                debug!("card cache stale for {}; serving stale copy", url);
                return Ok(entry.card.clone());
            }
        }

        debug!("card cache miss for {}", url);
        let card = fetch_card(&self.http, url, self.card_fetch_timeout).await?;
        let mut cache = self.cache.write().await;
        cache.insert(
            url.to_string(),
            CachedCard {
                card: card.clone(),
                fetched_at: Instant::now(),
                refreshing: false,
            },
        );
        Ok(card)
    }

    fn spawn_refresh(&self, url: String) {
        let http = self.http.clone();
        let cache = self.cache.clone();
        let fetch_timeout = self.card_fetch_timeout;
        tokio::spawn(async move {
            let fetched = fetch_card(&http, &url, fetch_timeout).await;
            let mut cache = cache.write().await;
            match fetched {
                Ok(card) => {
                    cache.insert(
                        url.clone(),
                        CachedCard {
                            card,
                            fetched_at: Instant::now(),
                            refreshing: false,
                        },
                    );
                    debug!("card cache refreshed for {}", url);
                }
                Err(e) => {
                    // Keep serving the stale copy; clear the flag so a later
                    // request can retry.
                    if let Some(entry) = cache.get_mut(&url) {
                        entry.refreshing = false;
                    }
                    warn!("card refresh failed for {}: {}", url, e);
                }
            }
        });
    }

    /// Invoke the agent behind `card_url` with `sub_query`.
    ///
    /// The call is bounded by `timeout` (callers pass
    /// `min(per-agent, remaining request deadline)`). The bearer goes into
    /// the `Authorization` header of this one request and nowhere else.
    pub async fn invoke(
        &self,
        card_url: &str,
        sub_query: &str,
        bearer: &str,
        timeout: Duration,
    ) -> InvocationOutcome {
        let started = Instant::now();

        let card = match self.agent_card(card_url).await {
            Ok(card) => card,
            Err(e) => {
                return InvocationOutcome::failed(
                    format!("card fetch failed: {}", e),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let endpoint = match card.invoke_endpoint() {
            Some(ep) => ep.to_string(),
            None => {
                return InvocationOutcome::failed(
                    "card has no invoke endpoint",
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        let body = json!({
            "query": sub_query,
            "correlation_id": correlation_id,
        });

        let request = self
            .http
            .post(&endpoint)
            .bearer_auth(bearer)
            .json(&body)
            .timeout(timeout)
            .send();

        let response = match tokio::time::timeout(timeout, request).await {
            Err(_) => {
                return InvocationOutcome::failed("timeout", started.elapsed().as_millis() as u64);
            }
            Ok(Err(e)) if e.is_timeout() => {
                return InvocationOutcome::failed("timeout", started.elapsed().as_millis() as u64);
            }
            Ok(Err(e)) => {
                return InvocationOutcome::failed(
                    format!("request failed: {}", e),
                    started.elapsed().as_millis() as u64,
                );
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(e) => {
                return InvocationOutcome::failed(
                    format!("body read failed: {}", e),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if !status.is_success() {
            return InvocationOutcome::failed(format!("HTTP {}", status), duration_ms);
        }

        // Accept `{"response": "..."}` (the A2A contract) but fall back to
        // the raw body for agents that answer with plain text.
        let text = serde_json::from_str::<InvokeResponseBody>(&raw)
            .ok()
            .and_then(|b| b.response.or(b.content))
            .unwrap_or(raw);

        InvocationOutcome::ok(text, duration_ms)
    }
}

impl Default for A2aClient {
    fn default() -> Self {
        Self::new()
    }
}
