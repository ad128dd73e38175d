//! Capability metadata and the in-memory scoring index.
//!
//! Every agent in the catalog advertises a [`Capability`]: the domains it
//! serves, the entities it understands, the keywords it reacts to, and the
//! operations it can perform. The [`CapabilityIndex`] holds an immutable
//! snapshot of the routable agents and scores incoming queries against that
//! metadata in a single O(n·m) pass — this is the cheap first stage of
//! routing, before any language model is consulted.
//!
//! # Scoring contract
//!
//! For each agent, the query (lowercased) is matched against the four
//! capability lists. A list contributes its weight at most once:
//!
//! | Category   | Weight |
//! |------------|--------|
//! | domains    | 0.4    |
//! | entities   | 0.3    |
//! | keywords   | 0.2    |
//! | operations | 0.1    |
//!
//! A term matches only when it appears as a whole word (or whole phrase) in
//! the query — `tickets` matches `"show my tickets"` but not
//! `"stickets"`. Agents scoring at or above the threshold are sorted by
//! `(score desc, priority desc, name asc)` and truncated to the configured
//! shortlist size.
//!
//! # Snapshot semantics
//!
//! The index is refreshed on every registry mutation. Refreshing swaps an
//! `Arc` snapshot under a write lock; a routing call clones the `Arc` once
//! and scores against a consistent view even while a refresh is in flight.
//!
//! # Example
//!
//! ```rust
//! use agenthub::capability::Capability;
//!
//! let cap = Capability::new()
//!     .with_domains(vec!["tickets", "IT"])
//!     .with_entities(vec!["ticket", "incident"])
//!     .with_keywords(vec!["helpdesk"])
//!     .with_operations(vec!["get", "create"]);
//!
//! assert_eq!(cap.domains, vec!["tickets", "IT"]);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::agenthub::agent_record::AgentRecord;

/// Score contribution when a `domains` entry matches the query.
pub const DOMAIN_WEIGHT: f32 = 0.4;
/// Score contribution when an `entities` entry matches the query.
pub const ENTITY_WEIGHT: f32 = 0.3;
/// Score contribution when a `keywords` entry matches the query.
pub const KEYWORD_WEIGHT: f32 = 0.2;
/// Score contribution when an `operations` entry matches the query.
pub const OPERATION_WEIGHT: f32 = 0.1;

/// Default minimum score for an agent to become a routing candidate.
pub const DEFAULT_THRESHOLD: f32 = 0.1;
/// Default shortlist size handed to the second routing stage.
pub const DEFAULT_STAGE1_K: usize = 10;

/// Structured routing metadata advertised by an agent.
///
/// All list entries are matched case-insensitively. `keywords` is kept as a
/// sorted set so serialization is stable; the other lists preserve caller
/// order (the order of `domains` is meaningful to humans reading a record,
/// not to the scorer).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    /// Broad subject areas this agent serves (e.g. `"tickets"`, `"finops"`).
    #[serde(default)]
    pub domains: Vec<String>,

    /// Verbs the agent can perform (e.g. `"get"`, `"create"`, `"analyze"`).
    #[serde(default)]
    pub operations: Vec<String>,

    /// Nouns the agent understands (e.g. `"ticket"`, `"invoice"`).
    #[serde(default)]
    pub entities: Vec<String>,

    /// Free-form trigger words, deduplicated and sorted.
    #[serde(default)]
    pub keywords: BTreeSet<String>,

    /// Example queries shown to the stage-2 adjudicator.
    #[serde(default)]
    pub examples: Vec<String>,

    /// Whether invoking this agent requires an authenticated caller.
    #[serde(default)]
    pub requires_auth: bool,

    /// Tie-break priority; never negative once sanitized.
    #[serde(default)]
    pub priority: i32,
}

impl Capability {
    /// Create an empty capability description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the domain list (builder pattern).
    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the operation list (builder pattern).
    pub fn with_operations<I, S>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations = operations.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the entity list (builder pattern).
    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the keyword set (builder pattern).
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the example list (builder pattern).
    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples = examples.into_iter().map(Into::into).collect();
        self
    }

    /// Set the auth requirement flag (builder pattern).
    pub fn with_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    /// Set the tie-break priority (builder pattern).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Clamp the priority into its valid range.
    ///
    /// Applied on every registration and capability update so that a
    /// negative priority can never be persisted.
    pub fn sanitized(mut self) -> Self {
        if self.priority < 0 {
            self.priority = 0;
        }
        self
    }
}

/// One entry in the stage-1 ranking returned by [`CapabilityIndex::score`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredAgent {
    /// Catalog name of the agent.
    pub name: String,
    /// Weighted capability-match score.
    pub score: f32,
    /// Priority carried along for tie-break transparency.
    pub priority: i32,
}

/// Pre-lowered view of one routable agent, built once per refresh.
#[derive(Debug, Clone)]
struct IndexedAgent {
    name: String,
    priority: i32,
    tags: BTreeSet<String>,
    domains: Vec<String>,
    entities: Vec<String>,
    keywords: Vec<String>,
    operations: Vec<String>,
}

impl IndexedAgent {
    fn from_record(record: &AgentRecord) -> Self {
        let lower = |items: &[String]| -> Vec<String> {
            items.iter().map(|s| s.to_lowercase()).collect()
        };
        Self {
            name: record.name.clone(),
            priority: record.capabilities.priority,
            tags: record.tags.iter().map(|t| t.to_lowercase()).collect(),
            domains: lower(&record.capabilities.domains),
            entities: lower(&record.capabilities.entities),
            keywords: record
                .capabilities
                .keywords
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            operations: lower(&record.capabilities.operations),
        }
    }

    /// Weighted score of this agent against the lowercased query.
    fn score(&self, query: &str) -> f32 {
        let mut score = 0.0;
        if self.domains.iter().any(|t| contains_word(query, t)) {
            score += DOMAIN_WEIGHT;
        }
        if self.entities.iter().any(|t| contains_word(query, t)) {
            score += ENTITY_WEIGHT;
        }
        if self.keywords.iter().any(|t| contains_word(query, t)) {
            score += KEYWORD_WEIGHT;
        }
        if self.operations.iter().any(|t| contains_word(query, t)) {
            score += OPERATION_WEIGHT;
        }
        score
    }
}

/// Immutable scoring snapshot; replaced wholesale on refresh.
#[derive(Debug, Default)]
pub struct CapabilitySnapshot {
    agents: Vec<IndexedAgent>,
}

impl CapabilitySnapshot {
    /// Number of routable agents in this snapshot.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the snapshot holds no agents at all.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Whole-word (whitespace/punctuation-bounded) substring match.
///
/// Both arguments must already be lowercase. Multi-word terms are matched
/// as phrases: `"drop table"` matches `"please drop table users"`.
fn contains_word(haystack: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    let bytes = haystack.as_bytes();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(term) {
        let start = from + pos;
        let end = start + term.len();
        let left_ok = start == 0 || !is_word_byte(bytes[start - 1]);
        let right_ok = end == bytes.len() || !is_word_byte(bytes[end]);
        if left_ok && right_ok {
            return true;
        }
        // Advance one full character so the next slice stays on a boundary.
        let step = haystack[start..]
            .chars()
            .next()
            .map(|c| c.len_utf8())
            .unwrap_or(1);
        from = start + step;
    }
    false
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// The stage-1 routing index.
///
/// Holds a copy-on-write [`CapabilitySnapshot`] of the routable agents and
/// the shortlist parameters. Readers never block writers for longer than an
/// `Arc` clone; writers replace the snapshot atomically.
///
/// # Example
///
/// ```rust,no_run
/// # use agenthub::capability::CapabilityIndex;
/// # async {
/// let index = CapabilityIndex::new(0.1, 10);
/// let ranking = index.score("show my tickets", None).await;
/// for hit in ranking {
///     println!("{} scored {}", hit.name, hit.score);
/// }
/// # };
/// ```
pub struct CapabilityIndex {
    snapshot: RwLock<Arc<CapabilitySnapshot>>,
    threshold: f32,
    stage1_k: usize,
}

impl CapabilityIndex {
    /// Create an index with the given candidate threshold and shortlist size.
    pub fn new(threshold: f32, stage1_k: usize) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CapabilitySnapshot::default())),
            threshold,
            stage1_k,
        }
    }

    /// Shortlist size handed to stage 2.
    pub fn stage1_k(&self) -> usize {
        self.stage1_k
    }

    /// Minimum score for candidacy.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Rebuild the snapshot from the routable subset of `records`.
    ///
    /// Records that are disabled, or remote records that are not approved,
    /// are excluded here — the router can therefore never select them no
    /// matter how well they would score.
    pub async fn refresh(&self, records: &[AgentRecord]) {
        let agents: Vec<IndexedAgent> = records
            .iter()
            .filter(|r| r.is_routable())
            .map(IndexedAgent::from_record)
            .collect();
        let mut guard = self.snapshot.write().await;
        *guard = Arc::new(CapabilitySnapshot { agents });
    }

    /// Clone the current snapshot for the duration of one routing call.
    pub async fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Score `query` against the current snapshot.
    ///
    /// Returns candidates with score ≥ threshold, ordered by
    /// `(score desc, priority desc, name asc)` and truncated to the
    /// shortlist size. When `tag_filter` is given, only agents carrying at
    /// least one of the tags participate (filtering happens before
    /// truncation so a tag filter can never be starved by higher-scoring
    /// agents outside the filter).
    pub async fn score(&self, query: &str, tag_filter: Option<&[String]>) -> Vec<ScoredAgent> {
        let snapshot = self.snapshot().await;
        let normalized = query.to_lowercase();
        let wanted_tags: Option<Vec<String>> =
            tag_filter.map(|tags| tags.iter().map(|t| t.to_lowercase()).collect());

        let mut candidates: Vec<ScoredAgent> = snapshot
            .agents
            .iter()
            .filter(|agent| match &wanted_tags {
                Some(tags) => tags.iter().any(|t| agent.tags.contains(t)),
                None => true,
            })
            .filter_map(|agent| {
                let score = agent.score(&normalized);
                if score >= self.threshold {
                    Some(ScoredAgent {
                        name: agent.name.clone(),
                        score,
                        priority: agent.priority,
                    })
                } else {
                    None
                }
            })
            .collect();

        sort_ranking(&mut candidates);
        candidates.truncate(self.stage1_k);
        candidates
    }
}

/// Order a ranking by `(score desc, priority desc, name asc)`.
///
/// Exposed to the router, which re-sorts after applying its context bias.
pub fn sort_ranking(candidates: &mut [ScoredAgent]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.priority.cmp(&a.priority))
            .then(a.name.cmp(&b.name))
    });
}
