use agenthub::agent_record::{AgentRecord, ConstructorRef};
use agenthub::capability::{Capability, CapabilityIndex};

fn agent(name: &str, capability: Capability) -> AgentRecord {
    AgentRecord::new_local(
        name,
        format!("{} test agent", name),
        capability,
        ConstructorRef::new("agents::test", "build"),
    )
}

fn standard_registry() -> Vec<AgentRecord> {
    vec![
        agent(
            "TicketsAgent",
            Capability::new()
                .with_domains(vec!["tickets", "IT"])
                .with_entities(vec!["ticket", "incident"])
                .with_keywords(vec!["helpdesk"])
                .with_operations(vec!["show", "create"]),
        ),
        agent(
            "FinOpsAgent",
            Capability::new()
                .with_domains(vec!["finops", "costs"])
                .with_entities(vec!["invoice", "budget"]),
        ),
        agent(
            "OxygenAgent",
            Capability::new()
                .with_domains(vec!["learning", "courses"])
                .with_entities(vec!["exam", "course"]),
        ),
    ]
}

#[tokio::test]
async fn domain_match_scores_at_least_point_four() {
    let index = CapabilityIndex::new(0.1, 10);
    index.refresh(&standard_registry()).await;

    let ranking = index.score("show my tickets", None).await;
    assert_eq!(ranking[0].name, "TicketsAgent");
    assert!(ranking[0].score >= 0.4);
}

#[tokio::test]
async fn each_category_contributes_at_most_once() {
    let index = CapabilityIndex::new(0.1, 10);
    index
        .refresh(&[agent(
            "MultiDomain",
            Capability::new().with_domains(vec!["tickets", "incidents"]),
        )])
        .await;

    // Both domains match; the domain weight must still count once.
    let ranking = index.score("tickets and incidents report", None).await;
    assert_eq!(ranking.len(), 1);
    assert!((ranking[0].score - 0.4).abs() < f32::EPSILON);
}

#[tokio::test]
async fn all_four_categories_sum() {
    let index = CapabilityIndex::new(0.1, 10);
    index
        .refresh(&[agent(
            "Everything",
            Capability::new()
                .with_domains(vec!["tickets"])
                .with_entities(vec!["incident"])
                .with_keywords(vec!["helpdesk"])
                .with_operations(vec!["show"]),
        )])
        .await;

    let ranking = index
        .score("show the helpdesk incident in tickets", None)
        .await;
    assert!((ranking[0].score - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn whole_word_matching_rejects_substrings() {
    let index = CapabilityIndex::new(0.1, 10);
    index
        .refresh(&[agent(
            "TicketsAgent",
            Capability::new().with_domains(vec!["tickets"]),
        )])
        .await;

    assert!(index.score("show me stickets", None).await.is_empty());
    assert!(index.score("ticketsmith services", None).await.is_empty());
    assert!(!index.score("my tickets, please", None).await.is_empty());
}

#[tokio::test]
async fn matching_is_case_insensitive() {
    let index = CapabilityIndex::new(0.1, 10);
    index.refresh(&standard_registry()).await;

    let ranking = index.score("SHOW MY TICKETS", None).await;
    assert_eq!(ranking[0].name, "TicketsAgent");
}

#[tokio::test]
async fn below_threshold_is_not_a_candidate() {
    let index = CapabilityIndex::new(0.2, 10);
    index
        .refresh(&[agent(
            "OpsOnly",
            Capability::new().with_operations(vec!["show"]),
        )])
        .await;

    // Operation-only match scores 0.1, below the 0.2 threshold.
    assert!(index.score("show everything", None).await.is_empty());
}

#[tokio::test]
async fn ordering_is_deterministic_across_calls() {
    let index = CapabilityIndex::new(0.1, 10);
    index.refresh(&standard_registry()).await;

    let query = "show my tickets and my pending exams";
    let first = index.score(query, None).await;
    for _ in 0..20 {
        let again = index.score(query, None).await;
        assert_eq!(first, again);
    }
}

#[tokio::test]
async fn ties_break_by_priority_then_name() {
    let index = CapabilityIndex::new(0.1, 10);
    index
        .refresh(&[
            agent("Beta", Capability::new().with_domains(vec!["tickets"])),
            agent("Alpha", Capability::new().with_domains(vec!["tickets"])),
            agent(
                "Gamma",
                Capability::new()
                    .with_domains(vec!["tickets"])
                    .with_priority(5),
            ),
        ])
        .await;

    let ranking = index.score("tickets", None).await;
    let names: Vec<&str> = ranking.iter().map(|c| c.name.as_str()).collect();
    // Same score: higher priority first, then lexical name.
    assert_eq!(names, vec!["Gamma", "Alpha", "Beta"]);
}

#[tokio::test]
async fn shortlist_is_truncated() {
    let index = CapabilityIndex::new(0.1, 2);
    index
        .refresh(
            &(0..5)
                .map(|i| {
                    agent(
                        &format!("Agent{}", i),
                        Capability::new().with_domains(vec!["tickets"]),
                    )
                })
                .collect::<Vec<_>>(),
        )
        .await;

    assert_eq!(index.score("tickets", None).await.len(), 2);
}

#[tokio::test]
async fn disabled_agents_never_enter_the_snapshot() {
    let mut records = standard_registry();
    records[0].enabled = false;

    let index = CapabilityIndex::new(0.1, 10);
    index.refresh(&records).await;

    let ranking = index.score("show my tickets", None).await;
    assert!(ranking.iter().all(|c| c.name != "TicketsAgent"));
}

#[tokio::test]
async fn tag_filter_applies_before_truncation() {
    let index = CapabilityIndex::new(0.1, 1);
    index
        .refresh(&[
            agent(
                "Loud",
                Capability::new()
                    .with_domains(vec!["tickets"])
                    .with_priority(10),
            ),
            agent("Quiet", Capability::new().with_domains(vec!["tickets"]))
                .with_tags(vec!["internal"]),
        ])
        .await;

    // Without the filter the higher-priority agent wins the single slot...
    let unfiltered = index.score("tickets", None).await;
    assert_eq!(unfiltered[0].name, "Loud");

    // ...but the tag filter must still surface the tagged agent.
    let tags = vec!["internal".to_string()];
    let filtered = index.score("tickets", Some(&tags)).await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "Quiet");
}

#[tokio::test]
async fn refresh_replaces_the_snapshot_atomically() {
    let index = CapabilityIndex::new(0.1, 10);
    index.refresh(&standard_registry()).await;
    assert_eq!(index.score("show my tickets", None).await.len(), 1);

    index.refresh(&[]).await;
    assert!(index.score("show my tickets", None).await.is_empty());
}

#[tokio::test]
async fn multi_word_terms_match_as_phrases() {
    let index = CapabilityIndex::new(0.1, 10);
    index
        .refresh(&[agent(
            "CostsAgent",
            Capability::new().with_domains(vec!["cloud costs"]),
        )])
        .await;

    assert!(!index.score("break down my cloud costs", None).await.is_empty());
    assert!(index.score("cloudy costs today", None).await.is_empty());
}

#[test]
fn sanitize_clamps_negative_priority() {
    let capability = Capability::new().with_priority(-3).sanitized();
    assert_eq!(capability.priority, 0);
}
