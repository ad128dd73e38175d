use serde_json::json;

use agenthub::agent_card::{extract_capability, AgentCard, CardInvalid, CardValidator};

fn card(value: serde_json::Value) -> AgentCard {
    serde_json::from_value(value).unwrap()
}

fn valid_card() -> AgentCard {
    card(json!({
        "name": "acme-tickets",
        "description": "Ticket lookup for Acme",
        "capabilities": { "tools": [
            { "name": "get_ticket", "description": "Fetch a ticket by id" },
            { "name": "list_tickets", "description": "List open tickets" },
            { "name": "billing_lookup", "description": "Check billing records" }
        ]},
        "endpoints": { "invoke": "https://acme.example/invoke" },
        "tags": ["Tickets", "support"],
        "authentication": { "scheme": "bearer" }
    }))
}

#[test]
fn a_valid_card_passes_validation() {
    assert!(CardValidator::new().validate(&valid_card()).is_ok());
}

#[test]
fn missing_required_fields_are_bad_schema() {
    let validator = CardValidator::new();

    let no_name = card(json!({
        "description": "d",
        "capabilities": { "tools": [{ "name": "t", "description": "d" }]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(matches!(
        validator.validate(&no_name),
        Err(CardInvalid::BadSchema(_))
    ));

    let no_tools = card(json!({
        "name": "a",
        "description": "d",
        "capabilities": { "tools": [] },
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(matches!(
        validator.validate(&no_tools),
        Err(CardInvalid::BadSchema(_))
    ));

    let no_endpoint = card(json!({
        "name": "a",
        "description": "d",
        "capabilities": { "tools": [{ "name": "t", "description": "d" }]}
    }));
    assert!(matches!(
        validator.validate(&no_endpoint),
        Err(CardInvalid::BadSchema(_))
    ));

    let empty_tool_description = card(json!({
        "name": "a",
        "description": "d",
        "capabilities": { "tools": [{ "name": "t", "description": "" }]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(matches!(
        validator.validate(&empty_tool_description),
        Err(CardInvalid::BadSchema(_))
    ));
}

#[test]
fn malicious_patterns_match_names_and_descriptions_case_insensitively() {
    let validator = CardValidator::new();

    let bad_name = card(json!({
        "name": "evil",
        "description": "d",
        "capabilities": { "tools": [
            { "name": "drop_table_users", "description": "drops users" }
        ]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(matches!(
        validator.validate(&bad_name),
        Err(CardInvalid::MaliciousPattern(_))
    ));

    let bad_description = card(json!({
        "name": "evil",
        "description": "d",
        "capabilities": { "tools": [
            { "name": "cleanup", "description": "runs RM -RF on the host" }
        ]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(matches!(
        validator.validate(&bad_description),
        Err(CardInvalid::MaliciousPattern(_))
    ));
}

#[test]
fn custom_pattern_list_replaces_the_default() {
    let validator = CardValidator::new().with_patterns(vec!["forbidden_word"]);

    // The default list no longer applies...
    let default_hit = card(json!({
        "name": "a",
        "description": "d",
        "capabilities": { "tools": [
            { "name": "drop_table_users", "description": "drops users" }
        ]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(validator.validate(&default_hit).is_ok());

    // ...but the custom one does.
    let custom_hit = card(json!({
        "name": "a",
        "description": "d",
        "capabilities": { "tools": [
            { "name": "uses_Forbidden_Word", "description": "d" }
        ]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(matches!(
        validator.validate(&custom_hit),
        Err(CardInvalid::MaliciousPattern(_))
    ));
}

#[test]
fn transport_rule_requires_https_unless_overridden() {
    let strict = CardValidator::new();
    assert!(strict.check_url("https://acme.example/card.json").is_ok());
    assert!(matches!(
        strict.check_url("http://acme.example/card.json"),
        Err(CardInvalid::InsecureTransport(_))
    ));

    let dev = CardValidator::new().allow_insecure_transport();
    assert!(dev.check_url("http://localhost:9000/card.json").is_ok());
    assert!(matches!(
        dev.check_url("ftp://acme.example/card.json"),
        Err(CardInvalid::BadSchema(_))
    ));
}

#[test]
fn extraction_derives_operations_entities_keywords_and_domains() {
    let capability = extract_capability(&valid_card());

    // Leading verbs become operations.
    assert_eq!(capability.operations, vec!["get", "list"]);

    // Card tags become domains (lowercased), plus the category-like prefix
    // of a non-verb tool name.
    assert!(capability.domains.contains(&"tickets".to_string()));
    assert!(capability.domains.contains(&"support".to_string()));
    assert!(capability.domains.contains(&"billing".to_string()));

    // Noun tokens become entities and keywords.
    assert!(capability.entities.contains(&"ticket".to_string()));
    assert!(capability.entities.contains(&"tickets".to_string()));
    assert!(capability.keywords.contains("lookup"));

    // An authentication section marks the agent as auth-requiring.
    assert!(capability.requires_auth);
}

#[test]
fn extraction_without_authentication_section_is_open() {
    let open_card = card(json!({
        "name": "open",
        "description": "d",
        "capabilities": { "tools": [{ "name": "get_weather", "description": "d" }]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(!extract_capability(&open_card).requires_auth);
}

#[test]
fn input_schema_accepts_both_casings() {
    let camel = card(json!({
        "name": "a",
        "description": "d",
        "capabilities": { "tools": [
            { "name": "t", "description": "d", "inputSchema": { "type": "object" } }
        ]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(camel.capabilities.tools[0].input_schema.is_some());

    let snake = card(json!({
        "name": "a",
        "description": "d",
        "capabilities": { "tools": [
            { "name": "t", "description": "d", "input_schema": { "type": "object" } }
        ]},
        "endpoints": { "invoke": "https://x/invoke" }
    }));
    assert!(snake.capabilities.tools[0].input_schema.is_some());
}
