//! End-to-end request handling.
//!
//! One [`Orchestrator::handle`] call is the whole platform in miniature:
//!
//! ```text
//! handle(query, bearer, session_id?)
//!   ├─ verify bearer (external identity service)
//!   ├─ resolve or create the user's session
//!   ├─ record the user message            ◄─ always before any dispatch
//!   ├─ route (stage 1 + stage 2)
//!   ├─ decompose into per-agent sub-queries
//!   ├─ dispatch all selected agents in parallel
//!   ├─ record every invocation outcome
//!   ├─ combine responses (stage-1 score order)
//!   └─ record the assistant message, return
//! ```
//!
//! Individual agent failures are not fatal: the combined response carries
//! the successful agents' content plus a fixed annotation for the rest.
//! Only a complete set-failure or a session-write failure turns into an
//! error status.
//!
//! The bearer is request-scoped. It flows to the verifier and to each
//! dispatched agent and nowhere else — not into session state, not into
//! any model prompt, and never into the combined response.

use futures_util::future::join_all;
use log::{error, info, warn};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::agenthub::a2a_client::InvocationOutcome;
use crate::agenthub::auth::{AuthError, TokenVerifier};
use crate::agenthub::decomposer::QueryDecomposer;
use crate::agenthub::dispatch::Dispatcher;
use crate::agenthub::registry::AgentRegistry;
use crate::agenthub::router::QueryRouter;
use crate::agenthub::session_store::{
    MessageRole, SessionStatus, SessionStore, SessionStoreError,
};

/// Default ceiling on one end-to-end request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed reply when routing finds no agent at all.
pub const NO_AGENT_MESSAGE: &str =
    "No agent is currently available to handle this request. Please try again later.";

/// Result of one handled request.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    /// Combined response text.
    pub response: String,
    /// The session the exchange was recorded under.
    pub session_id: String,
}

/// Failures surfaced to the HTTP layer.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Bearer verification failed.
    Unauthorized(String),
    /// Unknown (or foreign) session.
    NotFound(String),
    /// The request itself is unusable (empty query, completed session).
    BadRequest(String),
    /// Conversation state could not be written.
    SessionWrite(String),
    /// Every dispatched agent timed out.
    UpstreamTimeout(String),
    /// Everything else.
    Internal(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            OrchestratorError::NotFound(msg) => write!(f, "not found: {}", msg),
            OrchestratorError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            OrchestratorError::SessionWrite(msg) => write!(f, "session write failed: {}", msg),
            OrchestratorError::UpstreamTimeout(msg) => write!(f, "upstream timeout: {}", msg),
            OrchestratorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

struct DispatchResult {
    agent_name: String,
    sub_query: String,
    outcome: InvocationOutcome,
}

/// The request pipeline. Cheap to share behind an `Arc`.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionStore>,
    router: Arc<QueryRouter>,
    decomposer: Arc<QueryDecomposer>,
    dispatcher: Arc<Dispatcher>,
    verifier: Arc<dyn TokenVerifier>,
    request_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionStore>,
        router: Arc<QueryRouter>,
        decomposer: Arc<QueryDecomposer>,
        dispatcher: Arc<Dispatcher>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            registry,
            sessions,
            router,
            decomposer,
            dispatcher,
            verifier,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the end-to-end request ceiling (builder pattern).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The registry this orchestrator routes over.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The session store this orchestrator records into.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// The token verifier guarding this orchestrator.
    pub fn verifier(&self) -> &Arc<dyn TokenVerifier> {
        &self.verifier
    }

    /// Handle one request end to end.
    pub async fn handle(
        &self,
        query: &str,
        bearer: &str,
        session_id: Option<&str>,
    ) -> Result<InvokeOutcome, OrchestratorError> {
        let started = Instant::now();

        if query.trim().is_empty() {
            return Err(OrchestratorError::BadRequest("query must not be empty".into()));
        }

        // 1. Authentication.
        let claims = self.verifier.verify(bearer).await.map_err(|e| match e {
            AuthError::Unauthorized(msg) => OrchestratorError::Unauthorized(msg),
            AuthError::Upstream(msg) => OrchestratorError::Internal(msg),
        })?;

        // 2. Session resolution; the user message is recorded before any
        //    routing or dispatch work happens.
        let session_id = self.resolve_session(&claims.user_id, session_id)?;
        self.sessions
            .append_message(&session_id, MessageRole::User, query)
            .map_err(|e| OrchestratorError::SessionWrite(e.to_string()))?;

        // 3. Routing, biased toward the session's previous agent.
        let last_agent = self
            .sessions
            .get_session(&session_id)
            .ok()
            .and_then(|s| s.context)
            .and_then(|c| c.last_agent_called);
        let route = self
            .router
            .route(query, last_agent.as_deref(), None)
            .await;

        if route.selected.is_empty() {
            self.sessions
                .append_message(&session_id, MessageRole::Assistant, NO_AGENT_MESSAGE)
                .map_err(|e| OrchestratorError::SessionWrite(e.to_string()))?;
            return Ok(InvokeOutcome {
                response: NO_AGENT_MESSAGE.to_string(),
                session_id,
            });
        }

        info!(
            "routing '{}' -> [{}]",
            truncate_for_log(query),
            route
                .selected
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        // 4. Decomposition (user id only; the bearer never reaches the model).
        let sub_queries = self
            .decomposer
            .decompose(query, &route.selected, &claims.user_id)
            .await;

        // 5. Parallel dispatch. Each task is bounded by
        //    min(per-agent timeout, remaining request budget), so joining
        //    them all still respects the request ceiling.
        let mut tasks = Vec::new();
        for record in &route.selected {
            let sub_query = match sub_queries.get(&record.name) {
                Some(sub_query) => sub_query.clone(),
                None => continue,
            };
            let dispatcher = self.dispatcher.clone();
            let record = record.clone();
            let bearer = bearer.to_string();
            let remaining = self.request_timeout.saturating_sub(started.elapsed());
            tasks.push(tokio::spawn(async move {
                let outcome = dispatcher
                    .dispatch(&record, &sub_query, &bearer, remaining)
                    .await;
                DispatchResult {
                    agent_name: record.name,
                    sub_query,
                    outcome,
                }
            }));
        }

        let mut results: Vec<DispatchResult> = Vec::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("dispatch task panicked: {}", e),
            }
        }

        // 6. Record every invocation. A recording failure is logged but the
        //    already-produced responses are still combined.
        for result in &results {
            let outcome = &result.outcome;
            let recorded = self.sessions.record_invocation(
                &session_id,
                &result.agent_name,
                &result.sub_query,
                if outcome.success {
                    Some(outcome.response.as_str())
                } else {
                    None
                },
                outcome.success,
                outcome.error_message.as_deref(),
                outcome.duration_ms,
            );
            if let Err(e) = recorded {
                warn!(
                    "failed to record invocation of '{}': {}",
                    result.agent_name, e
                );
            }
        }

        // Keep the stage-1 order for combination.
        results.sort_by_key(|result| {
            route
                .selected
                .iter()
                .position(|r| r.name == result.agent_name)
                .unwrap_or(usize::MAX)
        });

        // 7. Combination.
        if results.iter().all(|r| !r.outcome.success) {
            let all_timeouts = results
                .iter()
                .all(|r| r.outcome.error_message.as_deref() == Some("timeout"));
            let failed: Vec<&str> = results.iter().map(|r| r.agent_name.as_str()).collect();
            let msg = format!("no agent produced a response ({})", failed.join(", "));
            return if all_timeouts && !results.is_empty() {
                Err(OrchestratorError::UpstreamTimeout(msg))
            } else {
                Err(OrchestratorError::Internal(msg))
            };
        }

        let combined = combine_responses(&results);

        // 8. The assistant message is written only once combination
        //    succeeded; a write failure here is a request failure.
        self.sessions
            .append_message(&session_id, MessageRole::Assistant, &combined)
            .map_err(|e| OrchestratorError::SessionWrite(e.to_string()))?;

        Ok(InvokeOutcome {
            response: combined,
            session_id,
        })
    }

    /// Validate a supplied session or find/create one for the user.
    fn resolve_session(
        &self,
        user_id: &str,
        supplied: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        if let Some(id) = supplied {
            let snapshot = self.sessions.get_session(id).map_err(|e| match e {
                SessionStoreError::NotFound(id) => OrchestratorError::NotFound(id),
                SessionStoreError::Storage(msg) => OrchestratorError::Internal(msg),
            })?;
            // A foreign session reads as absent; do not reveal that it exists.
            if snapshot.meta.user_id != user_id {
                return Err(OrchestratorError::NotFound(id.to_string()));
            }
            if snapshot.meta.status == SessionStatus::Completed {
                return Err(OrchestratorError::BadRequest(format!(
                    "session {} is completed",
                    id
                )));
            }
            return Ok(id.to_string());
        }

        match self.sessions.active_session_for_user(user_id) {
            Ok(Some(id)) => {
                info!("resuming session {} for {}", id, user_id);
                Ok(id)
            }
            Ok(None) => self
                .sessions
                .create_session(user_id)
                .map_err(|e| OrchestratorError::Internal(e.to_string())),
            Err(e) => Err(OrchestratorError::Internal(e.to_string())),
        }
    }
}

/// Fixed, detail-free annotation for a failed agent. Internal error text
/// (which may contain URLs or upstream detail) never reaches the caller.
fn failure_annotation(agent_name: &str) -> String {
    format!("_{} was unable to respond._", agent_name)
}

/// Combine dispatch results into the final response text.
///
/// A single result passes through verbatim; multiple results become one
/// titled section per agent, in the order given (stage-1 score order).
fn combine_responses(results: &[DispatchResult]) -> String {
    if results.len() == 1 {
        let result = &results[0];
        return if result.outcome.success {
            result.outcome.response.clone()
        } else {
            failure_annotation(&result.agent_name)
        };
    }

    results
        .iter()
        .map(|result| {
            let body = if result.outcome.success {
                result.outcome.response.clone()
            } else {
                failure_annotation(&result.agent_name)
            };
            format!("## {}\n{}", result.agent_name, body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_for_log(query: &str) -> String {
    const MAX: usize = 80;
    if query.len() <= MAX {
        query.to_string()
    } else {
        let cut = query
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(MAX);
        format!("{}…", &query[..cut])
    }
}
