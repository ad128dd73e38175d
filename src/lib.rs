// src/lib.rs

// Import the top-level `agenthub` module.
pub mod agenthub;

// Re-export every subsystem at the crate root so callers write
// `agenthub::registry::AgentRegistry` rather than navigating the full
// hierarchy.
pub use agenthub::{
    a2a_client, agent_card, agent_record, auth, capability, config, decomposer, dispatch,
    http_api, llm_client, orchestrator, registry, registry_store, router, session_store,
};

// Re-exporting key items for easier external access.
pub use agenthub::agent_record::{AgentKind, AgentRecord, RemoteStatus};
pub use agenthub::capability::{Capability, CapabilityIndex};
pub use agenthub::orchestrator::Orchestrator;
pub use agenthub::registry::AgentRegistry;
pub use agenthub::session_store::SessionStore;
