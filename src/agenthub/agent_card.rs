//! Agent-card parsing, validation, and capability auto-extraction.
//!
//! Every remote agent publishes a machine-readable card at a stable URL
//! describing its name, tools, invocation endpoint, and auth requirements.
//! Registration fetches that card, validates it, and derives a default
//! [`Capability`] so third-party agents become routable without hand-written
//! metadata.
//!
//! # Validation rules
//!
//! 1. The URL must be reachable and return a 2xx with a parseable JSON body.
//! 2. The card must carry `name`, `description`, a non-empty tool list
//!    (each tool with `name` and `description`), and an invoke endpoint.
//! 3. The card URL must use TLS unless the development override is set.
//! 4. No tool name or description may contain a malicious pattern
//!    (case-insensitive substring over a configurable list; identifier
//!    separators count as spaces, so `drop_table_users` matches
//!    `drop table`). A match forces the registration into the `rejected`
//!    state.
//! 5. The invoke endpoint is probed best-effort; an unreachable endpoint is
//!    logged but never causes rejection.
//!
//! # Example
//!
//! ```rust
//! use agenthub::agent_card::{AgentCard, CardValidator};
//!
//! let card: AgentCard = serde_json::from_str(r#"{
//!     "name": "acme-tickets",
//!     "description": "Ticket lookup for Acme",
//!     "capabilities": { "tools": [
//!         { "name": "get_ticket", "description": "Fetch a ticket by id" }
//!     ]},
//!     "endpoints": { "invoke": "https://acme.example/invoke" }
//! }"#).unwrap();
//!
//! let validator = CardValidator::new();
//! assert!(validator.validate(&card).is_ok());
//! ```

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::agenthub::capability::Capability;

lazy_static! {
    /// Default deny-list applied to tool names and descriptions.
    static ref DEFAULT_MALICIOUS_PATTERNS: Vec<&'static str> = vec![
        "drop table",
        "rm -rf",
        "privilege_escalation",
        "exec",
        "eval",
        "sudo",
        "delete_database",
    ];
}

/// Verb tokens recognized as operations during auto-extraction.
const LEADING_VERBS: [&str; 7] = [
    "get", "list", "create", "update", "delete", "search", "analyze",
];

/// One tool advertised by a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardTool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool input; opaque to the platform.
    #[serde(
        default,
        rename = "inputSchema",
        alias = "input_schema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<serde_json::Value>,
}

/// The `capabilities` section of a card.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardCapabilities {
    #[serde(default)]
    pub tools: Vec<CardTool>,
}

/// The `endpoints` section of a card.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardEndpoints {
    /// Invocation endpoint accepting `{query, correlation_id}` + bearer.
    #[serde(default)]
    pub invoke: Option<String>,
}

/// A parsed agent card.
///
/// Unknown fields are ignored so cards may carry provider-specific
/// extensions; the `authentication` section is kept opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCard {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: CardCapabilities,
    #[serde(default)]
    pub endpoints: CardEndpoints,
    /// Declared auth requirements, passed through unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<serde_json::Value>,
    /// Free-form labels; feeds domain auto-extraction.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AgentCard {
    /// The invoke endpoint, when present.
    pub fn invoke_endpoint(&self) -> Option<&str> {
        self.endpoints.invoke.as_deref()
    }
}

/// Why a card was refused.
#[derive(Debug, Clone)]
pub enum CardInvalid {
    /// Fetching the card failed (network error or non-2xx).
    Unreachable(String),
    /// The card parses but misses required structure.
    BadSchema(String),
    /// A tool name or description matched the deny-list.
    MaliciousPattern(String),
    /// The card URL does not use TLS and no override is active.
    InsecureTransport(String),
}

impl CardInvalid {
    /// Stable reason code used in HTTP error bodies.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CardInvalid::Unreachable(_) => "Unreachable",
            CardInvalid::BadSchema(_) => "BadSchema",
            CardInvalid::MaliciousPattern(_) => "MaliciousPattern",
            CardInvalid::InsecureTransport(_) => "InsecureTransport",
        }
    }
}

impl fmt::Display for CardInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardInvalid::Unreachable(msg) => write!(f, "agent card unreachable: {}", msg),
            CardInvalid::BadSchema(msg) => write!(f, "agent card schema invalid: {}", msg),
            CardInvalid::MaliciousPattern(what) => {
                write!(f, "agent card contains a disallowed pattern: {}", what)
            }
            CardInvalid::InsecureTransport(url) => {
                write!(f, "agent card URL must use https: {}", url)
            }
        }
    }
}

impl Error for CardInvalid {}

/// Structural and safety validation of agent cards.
#[derive(Debug, Clone)]
pub struct CardValidator {
    malicious_patterns: Vec<String>,
    require_tls: bool,
}

impl CardValidator {
    /// Validator with the default deny-list and TLS required.
    pub fn new() -> Self {
        Self {
            malicious_patterns: DEFAULT_MALICIOUS_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            require_tls: true,
        }
    }

    /// Replace the deny-list (builder pattern).
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.malicious_patterns = patterns.into_iter().map(|p| p.into().to_lowercase()).collect();
        self
    }

    /// Permit plain-text card URLs (development only).
    pub fn allow_insecure_transport(mut self) -> Self {
        self.require_tls = false;
        self
    }

    /// Enforce the transport rule on a card URL.
    pub fn check_url(&self, url: &str) -> Result<(), CardInvalid> {
        if self.require_tls && !url.starts_with("https://") {
            return Err(CardInvalid::InsecureTransport(url.to_string()));
        }
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(CardInvalid::BadSchema(format!(
                "not an http(s) URL: {}",
                url
            )));
        }
        Ok(())
    }

    /// Enforce structure (rule 2) and the deny-list (rule 4).
    pub fn validate(&self, card: &AgentCard) -> Result<(), CardInvalid> {
        if card.name.trim().is_empty() {
            return Err(CardInvalid::BadSchema("missing name".to_string()));
        }
        if card.description.trim().is_empty() {
            return Err(CardInvalid::BadSchema("missing description".to_string()));
        }
        if card.capabilities.tools.is_empty() {
            return Err(CardInvalid::BadSchema("no tools declared".to_string()));
        }
        for tool in &card.capabilities.tools {
            if tool.name.trim().is_empty() || tool.description.trim().is_empty() {
                return Err(CardInvalid::BadSchema(format!(
                    "tool entries need name and description (offending tool: {:?})",
                    tool.name
                )));
            }
        }
        match card.invoke_endpoint() {
            Some(ep) if !ep.trim().is_empty() => {}
            _ => return Err(CardInvalid::BadSchema("missing invoke endpoint".to_string())),
        }

        self.scan_for_malicious(card)
    }

    /// Deny-list scan over every tool name and description.
    ///
    /// Both sides are normalized before matching: lowercased, with `_`,
    /// `-`, `.`, and whitespace runs collapsed to single spaces. A pattern
    /// written as `drop table` therefore also catches identifiers like
    /// `drop_table_users` or `Drop-Table`.
    pub fn scan_for_malicious(&self, card: &AgentCard) -> Result<(), CardInvalid> {
        for tool in &card.capabilities.tools {
            let name = normalize_for_scan(&tool.name);
            let description = normalize_for_scan(&tool.description);
            for pattern in &self.malicious_patterns {
                let pattern = normalize_for_scan(pattern);
                if pattern.is_empty() {
                    continue;
                }
                if name.contains(&pattern) || description.contains(&pattern) {
                    return Err(CardInvalid::MaliciousPattern(format!(
                        "tool '{}' matches pattern '{}'",
                        tool.name, pattern
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for CardValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch and parse a card with a bounded timeout.
pub async fn fetch_card(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<AgentCard, CardInvalid> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| CardInvalid::Unreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(CardInvalid::Unreachable(format!(
            "HTTP {} from {}",
            response.status(),
            url
        )));
    }

    response
        .json::<AgentCard>()
        .await
        .map_err(|e| CardInvalid::BadSchema(e.to_string()))
}

/// Derive a default [`Capability`] from a validated card.
///
/// Heuristics: tool-name tokens become entities and keywords; leading verb
/// tokens become operations; card tags and category-like tool prefixes
/// become domains.
pub fn extract_capability(card: &AgentCard) -> Capability {
    let mut domains: Vec<String> = Vec::new();
    let mut operations: Vec<String> = Vec::new();
    let mut entities: Vec<String> = Vec::new();
    let mut keywords: BTreeSet<String> = BTreeSet::new();
    let mut seen_domains: BTreeSet<String> = BTreeSet::new();
    let mut seen_operations: BTreeSet<String> = BTreeSet::new();
    let mut seen_entities: BTreeSet<String> = BTreeSet::new();

    for tag in &card.tags {
        let tag = tag.to_lowercase();
        if !tag.is_empty() && seen_domains.insert(tag.clone()) {
            domains.push(tag);
        }
    }

    for tool in &card.capabilities.tools {
        let tokens = split_identifier(&tool.name);
        if tokens.is_empty() {
            continue;
        }

        let leading_verb = LEADING_VERBS.contains(&tokens[0].as_str());
        if leading_verb && seen_operations.insert(tokens[0].clone()) {
            operations.push(tokens[0].clone());
        }

        // A multi-token name whose first token is not a verb reads like a
        // category prefix (`billing_lookup` → domain "billing").
        if !leading_verb && tokens.len() >= 2 && seen_domains.insert(tokens[0].clone()) {
            domains.push(tokens[0].clone());
        }

        let noun_tokens = if leading_verb { &tokens[1..] } else { &tokens[..] };
        for token in noun_tokens {
            keywords.insert(token.clone());
            if seen_entities.insert(token.clone()) {
                entities.push(token.clone());
            }
        }
    }

    Capability {
        domains,
        operations,
        entities,
        keywords,
        examples: Vec::new(),
        requires_auth: card.authentication.is_some(),
        priority: 0,
    }
}

/// Lowercase `text` and collapse identifier separators (`_`, `-`, `.`)
/// and whitespace runs to single spaces, so deny-list phrases match
/// snake_case and kebab-case identifiers alike.
fn normalize_for_scan(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a tool identifier on separators and lowercase the tokens.
///
/// `"get_ticket-status.v2"` → `["get", "ticket", "status", "v2"]`.
fn split_identifier(name: &str) -> Vec<String> {
    name.split(|c: char| c == '_' || c == '-' || c == '.' || c == '/' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
