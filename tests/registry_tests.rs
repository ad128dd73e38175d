use std::path::Path;
use std::sync::Arc;

use agenthub::agent_card::{AgentCard, CardValidator};
use agenthub::agent_record::{AgentKind, ConstructorRef, RemoteStatus};
use agenthub::capability::{Capability, CapabilityIndex};
use agenthub::registry::{
    AgentRegistry, CapabilityOverride, RegistryError, RemoteRegistration,
};
use agenthub::registry_store::RegistryStore;

async fn open_registry(path: &Path) -> Arc<AgentRegistry> {
    let index = Arc::new(CapabilityIndex::new(0.1, 10));
    let store = RegistryStore::new(path);
    Arc::new(
        AgentRegistry::open(store, index, CardValidator::new())
            .await
            .unwrap(),
    )
}

async fn register_tickets_agent(registry: &AgentRegistry) {
    registry
        .register_local(
            "TicketsAgent",
            "Handles IT tickets",
            Capability::new().with_domains(vec!["tickets", "IT"]),
            ConstructorRef::new("agents::tickets", "build"),
            vec!["it".to_string()],
        )
        .await
        .unwrap();
}

fn valid_card() -> AgentCard {
    serde_json::from_value(serde_json::json!({
        "name": "acme-tickets",
        "description": "Ticket lookup for Acme",
        "capabilities": { "tools": [
            { "name": "get_ticket", "description": "Fetch a ticket by id" },
            { "name": "list_tickets", "description": "List open tickets" }
        ]},
        "endpoints": { "invoke": "https://acme.example/invoke" },
        "tags": ["tickets"]
    }))
    .unwrap()
}

fn remote_params(url: &str) -> RemoteRegistration {
    serde_json::from_value::<RemoteRegistration>(serde_json::json!({
        "agent_card_url": url,
        "provider": { "name": "Acme" },
    }))
    .unwrap()
}

#[tokio::test]
async fn register_get_update_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    register_tickets_agent(&registry).await;

    let record = registry.get("TicketsAgent").await.unwrap();
    assert_eq!(record.kind, AgentKind::Local);
    assert!(record.enabled);
    assert_eq!(record.capabilities.domains, vec!["tickets", "IT"]);

    let updated = Capability::new().with_domains(vec!["tickets", "support"]);
    registry
        .update_capabilities("TicketsAgent", updated)
        .await
        .unwrap();
    let record = registry.get("TicketsAgent").await.unwrap();
    assert_eq!(record.capabilities.domains, vec!["tickets", "support"]);

    registry.delete("TicketsAgent").await.unwrap();
    assert!(matches!(
        registry.get("TicketsAgent").await,
        Err(RegistryError::NotFound(_))
    ));
    assert!(registry.list(false, None).await.is_empty());
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    register_tickets_agent(&registry).await;
    let second = registry
        .register_local(
            "TicketsAgent",
            "Impostor",
            Capability::new(),
            ConstructorRef::new("agents::other", "build"),
            vec![],
        )
        .await;
    assert!(matches!(second, Err(RegistryError::DuplicateName(_))));
}

#[tokio::test]
async fn cold_start_reload_yields_identical_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");

    {
        let registry = open_registry(&path).await;
        register_tickets_agent(&registry).await;
        registry.set_enabled("TicketsAgent", false).await.unwrap();
    }

    // Fresh process: same store path, new registry.
    let reloaded = open_registry(&path).await;
    let record = reloaded.get("TicketsAgent").await.unwrap();
    assert!(!record.enabled);
    assert!(record.tags.contains("it"));
    assert_eq!(record.capabilities.domains, vec!["tickets", "IT"]);
    assert_eq!(record.constructor_ref.as_ref().unwrap().symbol_name, "build");
}

#[tokio::test]
async fn list_filters_by_enabled_and_tags() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    register_tickets_agent(&registry).await;
    registry
        .register_local(
            "FinOpsAgent",
            "Cloud costs",
            Capability::new().with_domains(vec!["finops"]),
            ConstructorRef::new("agents::finops", "build"),
            vec!["finance".to_string()],
        )
        .await
        .unwrap();
    registry.set_enabled("FinOpsAgent", false).await.unwrap();

    let enabled = registry.list(true, None).await;
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].name, "TicketsAgent");

    let tagged = registry
        .list(false, Some(&["finance".to_string()]))
        .await;
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].name, "FinOpsAgent");
}

#[tokio::test]
async fn set_enabled_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    register_tickets_agent(&registry).await;
    registry.set_enabled("TicketsAgent", true).await.unwrap();
    registry.set_enabled("TicketsAgent", true).await.unwrap();
    assert!(registry.get("TicketsAgent").await.unwrap().enabled);
}

#[tokio::test]
async fn remote_registration_from_card_starts_pending() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    let outcome = registry
        .register_remote_card(
            valid_card(),
            remote_params("https://acme.example/.well-known/agent-card.json"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.agent_name, "acme-tickets");
    assert_eq!(outcome.status, RemoteStatus::Pending);
    assert_eq!(outcome.registration_id.len(), 16);

    let record = registry.get("acme-tickets").await.unwrap();
    assert_eq!(record.kind, AgentKind::Remote);
    assert_eq!(record.status, Some(RemoteStatus::Pending));
    // Pending remotes are excluded from the enabled/routable view.
    assert!(!record.is_routable());

    // Auto-extraction: card tag becomes a domain, verbs become operations.
    assert!(record.capabilities.domains.contains(&"tickets".to_string()));
    assert!(record.capabilities.operations.contains(&"get".to_string()));
    assert!(record.capabilities.operations.contains(&"list".to_string()));
    assert!(record.capabilities.entities.contains(&"ticket".to_string()));
}

#[tokio::test]
async fn capability_override_wins_per_field() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    let mut params = remote_params("https://acme.example/card.json");
    params.capabilities_override = Some(CapabilityOverride {
        domains: Some(vec!["support".to_string()]),
        priority: Some(7),
        ..Default::default()
    });

    registry
        .register_remote_card(valid_card(), params)
        .await
        .unwrap();

    let record = registry.get("acme-tickets").await.unwrap();
    assert_eq!(record.capabilities.domains, vec!["support"]);
    assert_eq!(record.capabilities.priority, 7);
    // Fields without an override keep the auto-extracted values.
    assert!(record.capabilities.operations.contains(&"get".to_string()));
}

#[tokio::test]
async fn malicious_pattern_forces_rejected_status() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    let card: AgentCard = serde_json::from_value(serde_json::json!({
        "name": "evil-agent",
        "description": "Looks helpful",
        "capabilities": { "tools": [
            { "name": "drop_table_users", "description": "drops users" }
        ]},
        "endpoints": { "invoke": "https://evil.example/invoke" }
    }))
    .unwrap();

    let result = registry
        .register_remote_card(card, remote_params("https://evil.example/card.json"))
        .await;

    match result {
        Err(RegistryError::Card(card)) => assert_eq!(card.reason_code(), "MaliciousPattern"),
        other => panic!("expected MaliciousPattern, got {:?}", other.is_ok()),
    }

    // The record is kept for audit, rejected and unroutable.
    let record = registry.get("evil-agent").await.unwrap();
    assert_eq!(record.status, Some(RemoteStatus::Rejected));
    assert!(!record.is_routable());
}

#[tokio::test]
async fn status_state_machine_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    registry
        .register_remote_card(valid_card(), remote_params("https://acme.example/card.json"))
        .await
        .unwrap();

    // pending -> approved
    registry
        .set_status("acme-tickets", RemoteStatus::Approved)
        .await
        .unwrap();
    assert!(registry.get("acme-tickets").await.unwrap().is_routable());

    // approved -> approved is an idempotent no-op.
    registry
        .set_status("acme-tickets", RemoteStatus::Approved)
        .await
        .unwrap();

    // approved <-> suspended
    registry
        .set_status("acme-tickets", RemoteStatus::Suspended)
        .await
        .unwrap();
    assert!(!registry.get("acme-tickets").await.unwrap().is_routable());
    registry
        .set_status("acme-tickets", RemoteStatus::Approved)
        .await
        .unwrap();

    // approved -> rejected is outside the machine.
    let illegal = registry
        .set_status("acme-tickets", RemoteStatus::Rejected)
        .await;
    assert!(matches!(
        illegal,
        Err(RegistryError::IllegalTransition { .. })
    ));
}

#[tokio::test]
async fn set_status_on_local_agent_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    register_tickets_agent(&registry).await;
    let result = registry
        .set_status("TicketsAgent", RemoteStatus::Approved)
        .await;
    assert!(matches!(result, Err(RegistryError::RemoteOnly(_))));
}

#[tokio::test]
async fn preview_does_not_persist() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    let preview = registry.preview_card(valid_card()).await.unwrap();
    assert_eq!(preview.name, "acme-tickets");
    assert_eq!(preview.invoke_endpoint, "https://acme.example/invoke");
    assert!(!preview.capabilities.entities.is_empty());

    assert!(matches!(
        registry.get("acme-tickets").await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn stats_count_by_kind_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open_registry(&dir.path().join("registry.json")).await;

    register_tickets_agent(&registry).await;
    registry
        .register_remote_card(valid_card(), remote_params("https://acme.example/card.json"))
        .await
        .unwrap();

    let stats = registry.stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.local, 1);
    assert_eq!(stats.remote, 1);
    assert_eq!(stats.pending, 1);
}
