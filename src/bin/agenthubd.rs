//! `agenthubd` — the orchestration daemon.
//!
//! Wires the stores, the routing pipeline, and the HTTP surface together
//! from environment configuration and serves until interrupted.
//!
//! Exit codes: `0` normal shutdown, `1` configuration error, `2`
//! persistent-store load failure unrecoverable even from backup.

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use agenthub::a2a_client::A2aClient;
use agenthub::agent_card::CardValidator;
use agenthub::auth::{HttpTokenVerifier, TokenVerifier};
use agenthub::capability::CapabilityIndex;
use agenthub::config::HubConfig;
use agenthub::decomposer::QueryDecomposer;
use agenthub::dispatch::{ConstructorRegistry, Dispatcher};
use agenthub::http_api::{build_router, AppState};
use agenthub::llm_client::{LlmClient, OpenAiCompatClient};
use agenthub::orchestrator::Orchestrator;
use agenthub::registry::AgentRegistry;
use agenthub::registry_store::RegistryStore;
use agenthub::router::QueryRouter;
use agenthub::session_store::SessionStore;

/// Completed sessions are swept once they are this old.
const COMPLETED_SESSION_TTL_DAYS: i64 = 7;
/// How often the cleanup loop runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match HubConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    std::process::exit(run(config).await);
}

async fn run(config: HubConfig) -> i32 {
    let verifier: Arc<dyn TokenVerifier> = match &config.auth_service_url {
        Some(url) => Arc::new(HttpTokenVerifier::new(url)),
        None => {
            error!("AUTH_SERVICE_URL must be set");
            return 1;
        }
    };

    let index = Arc::new(CapabilityIndex::new(config.stage1_threshold, config.stage1_k));
    let validator = if config.allow_insecure_cards {
        warn!("ALLOW_INSECURE_CARDS is set; plain-text card URLs are accepted");
        CardValidator::new().allow_insecure_transport()
    } else {
        CardValidator::new()
    };

    let store = RegistryStore::new(&config.registry_path);
    let registry = match AgentRegistry::open(store, index.clone(), validator).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("cannot load the agent registry: {}", e);
            return 2;
        }
    };

    let sessions = match SessionStore::open(
        &config.session_db_path,
        chrono::Duration::hours(config.activity_window_hours),
        config.hard_expiry_days,
    ) {
        Ok(sessions) => Arc::new(sessions),
        Err(e) => {
            error!("cannot open the session database: {}", e);
            return 2;
        }
    };

    let llm: Option<Arc<dyn LlmClient>> = match (&config.llm_base_url, &config.llm_api_key) {
        (Some(url), Some(key)) => Some(Arc::new(OpenAiCompatClient::new(
            url,
            key,
            &config.llm_model,
        ))),
        _ => {
            warn!("no LLM configured; routing degrades to stage-1 top 1 and injection-only decomposition");
            None
        }
    };

    let a2a = Arc::new(A2aClient::new().with_invoke_timeout(config.agent_invoke_timeout));
    let constructors = Arc::new(ConstructorRegistry::new());
    let dispatcher = Arc::new(
        Dispatcher::new(a2a, constructors).with_per_agent_limit(config.per_agent_concurrency),
    );
    let router = Arc::new(QueryRouter::new(index, registry.clone(), llm.clone()));
    let decomposer = Arc::new(QueryDecomposer::new(llm));

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        sessions.clone(),
        router,
        decomposer,
        dispatcher,
        verifier.clone(),
    ));

    // Periodic session cleanup.
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = sessions.cleanup(COMPLETED_SESSION_TTL_DAYS) {
                    warn!("session cleanup failed: {}", e);
                }
            }
        });
    }

    let state = AppState {
        orchestrator,
        registry,
        sessions,
        verifier,
        admin_role: config.admin_role.clone(),
    };
    let app = build_router(state);

    let listener = match TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {}: {}", config.bind_addr, e);
            return 1;
        }
    };
    info!("agenthubd listening on {}", config.bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    match served {
        Ok(()) => {
            info!("shutting down");
            0
        }
        Err(e) => {
            error!("server error: {}", e);
            1
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
}
