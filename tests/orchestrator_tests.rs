use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agenthub::a2a_client::A2aClient;
use agenthub::agent_card::CardValidator;
use agenthub::agent_record::ConstructorRef;
use agenthub::auth::{AuthClaims, StaticTokenVerifier, TokenVerifier};
use agenthub::capability::{Capability, CapabilityIndex};
use agenthub::decomposer::QueryDecomposer;
use agenthub::dispatch::{ConstructorRegistry, Dispatcher, LocalAgent};
use agenthub::llm_client::LlmClient;
use agenthub::orchestrator::{Orchestrator, OrchestratorError, NO_AGENT_MESSAGE};
use agenthub::registry::AgentRegistry;
use agenthub::registry_store::RegistryStore;
use agenthub::router::QueryRouter;
use agenthub::session_store::{MessageRole, SessionStatus, SessionStore};

struct FixedLlm {
    reply: String,
}

#[async_trait]
impl LlmClient for FixedLlm {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(self.reply.clone())
    }

    fn model_name(&self) -> &str {
        "fixed"
    }
}

struct EchoAgent {
    prefix: &'static str,
}

#[async_trait]
impl LocalAgent for EchoAgent {
    async fn handle(&self, sub_query: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(format!("{} response for: {}", self.prefix, sub_query))
    }
}

struct SleepyAgent;

#[async_trait]
impl LocalAgent for SleepyAgent {
    async fn handle(&self, _sub_query: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok("finally".to_string())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionStore>,
}

/// Build a full pipeline with deterministic fixtures.
///
/// `router_reply` is what the stage-2 model returns; `decomposer_reply` is
/// what the decomposition model returns.
async fn harness(
    registry_path: &Path,
    router_reply: &str,
    decomposer_reply: &str,
    activity_window: ChronoDuration,
) -> Harness {
    let index = Arc::new(CapabilityIndex::new(0.1, 10));
    let registry = Arc::new(
        AgentRegistry::open(
            RegistryStore::new(registry_path),
            index.clone(),
            CardValidator::new(),
        )
        .await
        .unwrap(),
    );
    let sessions = Arc::new(SessionStore::open_in_memory(activity_window, 30).unwrap());

    let constructors = Arc::new(ConstructorRegistry::new());
    constructors
        .register("agents::tickets::build", |_| {
            Ok(Arc::new(EchoAgent { prefix: "tickets" }) as Arc<dyn LocalAgent>)
        })
        .await;
    constructors
        .register("agents::oxygen::build", |_| {
            Ok(Arc::new(EchoAgent { prefix: "oxygen" }) as Arc<dyn LocalAgent>)
        })
        .await;
    constructors
        .register("agents::sleepy::build", |_| Ok(Arc::new(SleepyAgent) as Arc<dyn LocalAgent>))
        .await;

    let dispatcher = Arc::new(
        Dispatcher::new(Arc::new(A2aClient::new()), constructors)
            .with_default_timeout(Duration::from_millis(300)),
    );

    let router_llm: Arc<dyn LlmClient> = Arc::new(FixedLlm {
        reply: router_reply.to_string(),
    });
    let decomposer_llm: Arc<dyn LlmClient> = Arc::new(FixedLlm {
        reply: decomposer_reply.to_string(),
    });
    let router = Arc::new(QueryRouter::new(
        index,
        registry.clone(),
        Some(router_llm),
    ));
    let decomposer = Arc::new(QueryDecomposer::new(Some(decomposer_llm)));

    let verifier: Arc<dyn TokenVerifier> = Arc::new(
        StaticTokenVerifier::new()
            .with_token(
                "tok-vishal",
                AuthClaims {
                    user_id: "vishal".into(),
                    role: "user".into(),
                },
            )
            .with_token(
                "tok-alice",
                AuthClaims {
                    user_id: "alice".into(),
                    role: "user".into(),
                },
            ),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        sessions.clone(),
        router,
        decomposer,
        dispatcher,
        verifier,
    ));

    Harness {
        orchestrator,
        registry,
        sessions,
    }
}

async fn register_standard_agents(registry: &AgentRegistry) {
    registry
        .register_local(
            "TicketsAgent",
            "IT ticket lookups",
            Capability::new().with_domains(vec!["tickets", "IT"]),
            ConstructorRef::new("agents::tickets", "build"),
            vec![],
        )
        .await
        .unwrap();
    registry
        .register_local(
            "OxygenAgent",
            "Learning and courses",
            Capability::new().with_domains(vec!["learning", "courses", "exams"]),
            ConstructorRef::new("agents::oxygen", "build"),
            vec![],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn single_domain_routing_returns_the_agent_response_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let outcome = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();

    // Injection resolved "my" before the agent saw the query; single-agent
    // responses pass through unmodified.
    assert_eq!(
        outcome.response,
        "tickets response for: show vishal's tickets"
    );

    let snapshot = h.sessions.get_session(&outcome.session_id).unwrap();
    assert_eq!(snapshot.invocations.len(), 1);
    assert_eq!(snapshot.invocations[0].agent_name, "TicketsAgent");
    assert_eq!(snapshot.invocations[0].query, "show vishal's tickets");
    assert!(snapshot.invocations[0].success);
}

#[tokio::test]
async fn multi_domain_routing_combines_sections_in_score_order() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent", "OxygenAgent"]"#,
        r#"{"TicketsAgent": "show vishal's tickets", "OxygenAgent": "show vishal's pending exams"}"#,
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let outcome = h
        .orchestrator
        .handle(
            "show my tickets and my pending exams",
            "tok-vishal",
            None,
        )
        .await
        .unwrap();

    assert!(outcome.response.contains("## TicketsAgent"));
    assert!(outcome.response.contains("## OxygenAgent"));
    assert!(outcome
        .response
        .contains("tickets response for: show vishal's tickets"));
    assert!(outcome
        .response
        .contains("oxygen response for: show vishal's pending exams"));

    let snapshot = h.sessions.get_session(&outcome.session_id).unwrap();
    assert_eq!(snapshot.invocations.len(), 2);
    assert!(snapshot.invocations.iter().all(|i| i.success));
}

#[tokio::test]
async fn empty_registry_yields_the_fixed_no_agent_message() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["anything"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;

    let outcome = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();

    assert_eq!(outcome.response, NO_AGENT_MESSAGE);
    let snapshot = h.sessions.get_session(&outcome.session_id).unwrap();
    // Both the user message and the canned assistant reply are recorded.
    assert_eq!(snapshot.history.len(), 2);
    assert_eq!(snapshot.history[1].content, NO_AGENT_MESSAGE);
    assert!(snapshot.invocations.is_empty());
}

#[tokio::test]
async fn partial_failure_keeps_the_request_successful() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent", "SleepyAgent"]"#,
        r#"{"TicketsAgent": "show vishal's tickets", "SleepyAgent": "take your time"}"#,
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;
    h.registry
        .register_local(
            "SleepyAgent",
            "Slow but thorough",
            Capability::new().with_domains(vec!["tickets"]),
            ConstructorRef::new("agents::sleepy", "build"),
            vec![],
        )
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();

    // The fast agent's content is present; the timed-out agent gets a
    // fixed annotation, not its internal error.
    assert!(outcome.response.contains("tickets response for"));
    assert!(outcome
        .response
        .contains("_SleepyAgent was unable to respond._"));

    let snapshot = h.sessions.get_session(&outcome.session_id).unwrap();
    let sleepy = snapshot
        .invocations
        .iter()
        .find(|i| i.agent_name == "SleepyAgent")
        .unwrap();
    assert!(!sleepy.success);
    assert_eq!(sleepy.error_message.as_deref(), Some("timeout"));

    let tickets = snapshot
        .invocations
        .iter()
        .find(|i| i.agent_name == "TicketsAgent")
        .unwrap();
    assert!(tickets.success);
}

#[tokio::test]
async fn complete_timeout_failure_maps_to_upstream_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["SleepyAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;
    h.registry
        .register_local(
            "SleepyAgent",
            "Slow but thorough",
            Capability::new().with_domains(vec!["tickets"]),
            ConstructorRef::new("agents::sleepy", "build"),
            vec![],
        )
        .await
        .unwrap();

    let result = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::UpstreamTimeout(_))
    ));
}

#[tokio::test]
async fn user_message_precedes_the_assistant_message() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let outcome = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();

    let snapshot = h.sessions.get_session(&outcome.session_id).unwrap();
    assert_eq!(snapshot.history.len(), 2);
    assert_eq!(snapshot.history[0].role, MessageRole::User);
    assert_eq!(snapshot.history[0].content, "show my tickets");
    assert_eq!(snapshot.history[1].role, MessageRole::Assistant);
    // Exactly one assistant message per request.
    assert_eq!(
        snapshot
            .history
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .count(),
        1
    );
}

#[tokio::test]
async fn consecutive_requests_resume_the_same_session() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let first = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .handle("any updates on my tickets?", "tok-vishal", None)
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);
    let snapshot = h.sessions.get_session(&first.session_id).unwrap();
    assert_eq!(snapshot.history.len(), 4);

    // The routing context remembers the last agent dispatched.
    assert_eq!(
        snapshot.context.unwrap().last_agent_called.as_deref(),
        Some("TicketsAgent")
    );
}

#[tokio::test]
async fn requests_outside_the_activity_window_start_a_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::milliseconds(50),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let first = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = h
        .orchestrator
        .handle("show my tickets again", "tok-vishal", None)
        .await
        .unwrap();
    assert_ne!(first.session_id, second.session_id);

    // Old history is preserved and still queryable.
    assert_eq!(h.sessions.get_session(&first.session_id).unwrap().history.len(), 2);
}

#[tokio::test]
async fn invalid_bearer_is_unauthorized() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let result = h
        .orchestrator
        .handle("show my tickets", "tok-bogus", None)
        .await;
    assert!(matches!(result, Err(OrchestratorError::Unauthorized(_))));
}

#[tokio::test]
async fn foreign_sessions_read_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let vishal = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();

    let stolen = h
        .orchestrator
        .handle("show my tickets", "tok-alice", Some(&vishal.session_id))
        .await;
    assert!(matches!(stolen, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn completed_sessions_cannot_be_written_to() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;
    register_standard_agents(&h.registry).await;

    let outcome = h
        .orchestrator
        .handle("show my tickets", "tok-vishal", None)
        .await
        .unwrap();
    h.sessions
        .set_status(&outcome.session_id, SessionStatus::Completed)
        .unwrap();

    let result = h
        .orchestrator
        .handle("more please", "tok-vishal", Some(&outcome.session_id))
        .await;
    assert!(matches!(result, Err(OrchestratorError::BadRequest(_))));
}

#[tokio::test]
async fn empty_query_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir.path().join("registry.json"),
        r#"["TicketsAgent"]"#,
        "{}",
        ChronoDuration::hours(24),
    )
    .await;

    let result = h.orchestrator.handle("   ", "tok-vishal", None).await;
    assert!(matches!(result, Err(OrchestratorError::BadRequest(_))));
}
