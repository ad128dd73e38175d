//! Splitting a query into per-agent sub-queries.
//!
//! When routing selects a single agent, the sub-query is the original query
//! with first-person references resolved to the authenticated user — a pure
//! string transformation, no model involved. When several agents are
//! selected, a language model maps each agent to a standalone sub-query;
//! anything the model gets wrong (extra agents, missing agents, unparseable
//! output) degrades to the injected form of the original query.
//!
//! The caller's bearer token is never part of any prompt — only the user id
//! and the query text reach the model.
//!
//! # User-context injection
//!
//! Whole-word, case-insensitive replacement using simple string scanning
//! (no regex): `my` → `<user>'s`, `I` and `me` → `<user>`. Words containing
//! these sequences are untouched (`mystery`, `immediate`, `meze`).
//!
//! ```rust
//! use agenthub::decomposer::inject_user_context;
//!
//! assert_eq!(
//!     inject_user_context("show my tickets", "vishal"),
//!     "show vishal's tickets"
//! );
//! assert_eq!(
//!     inject_user_context("solve my mystery", "vishal"),
//!     "solve vishal's mystery"
//! );
//! ```

use log::warn;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agenthub::agent_record::AgentRecord;
use crate::agenthub::llm_client::LlmClient;

/// Replace whole-word first-person references with the user's identity.
///
/// Matching is case-insensitive and word-bounded; replacements are
/// `my` → `<user_id>'s`, `i` → `<user_id>`, `me` → `<user_id>`.
pub fn inject_user_context(query: &str, user_id: &str) -> String {
    let mut out = String::with_capacity(query.len() + user_id.len());
    let possessive = format!("{}'s", user_id);

    for word in split_preserving(query) {
        match word.to_lowercase().as_str() {
            "my" => out.push_str(&possessive),
            "i" | "me" => out.push_str(user_id),
            _ => out.push_str(word),
        }
    }
    out
}

/// Iterate over alternating word / non-word runs of `text`, preserving
/// every byte. Words are maximal alphanumeric-or-apostrophe runs so that
/// contractions like `I'm` stay a single token.
fn split_preserving(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut in_word = None::<bool>;

    for (i, c) in text.char_indices() {
        let word_char = c.is_alphanumeric() || c == '\'';
        match in_word {
            None => in_word = Some(word_char),
            Some(prev) if prev != word_char => {
                pieces.push(&text[start..i]);
                start = i;
                in_word = Some(word_char);
            }
            _ => {}
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Splits a routed query into agent-specific sub-queries.
pub struct QueryDecomposer {
    llm: Option<Arc<dyn LlmClient>>,
    llm_timeout: Duration,
}

impl QueryDecomposer {
    /// Decomposer that consults `llm` for multi-agent splits.
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            llm,
            llm_timeout: crate::agenthub::llm_client::DEFAULT_LLM_TIMEOUT,
        }
    }

    /// Override the model-call timeout (builder pattern).
    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    /// Produce a `agent name → sub-query` map covering every selected agent.
    ///
    /// Single selection never calls the model. Multi-agent selection asks
    /// the model for a JSON object; keys outside the selection are dropped
    /// and missing keys fall back to the injected original query.
    pub async fn decompose(
        &self,
        query: &str,
        selected: &[AgentRecord],
        user_id: &str,
    ) -> HashMap<String, String> {
        let injected = inject_user_context(query, user_id);

        if selected.len() <= 1 {
            return selected
                .iter()
                .map(|record| (record.name.clone(), injected.clone()))
                .collect();
        }

        let mut sub_queries: HashMap<String, String> = HashMap::new();

        if let Some(llm) = &self.llm {
            let prompt = build_decompose_prompt(query, selected, user_id);
            let completion =
                tokio::time::timeout(self.llm_timeout, llm.complete(DECOMPOSE_SYSTEM, &prompt))
                    .await;
            match completion {
                Ok(Ok(raw)) => {
                    if let Some(parsed) = parse_decomposition(&raw) {
                        for (name, sub_query) in parsed {
                            // Keys outside the selected set are dropped.
                            if selected.iter().any(|r| r.name == name) {
                                sub_queries.insert(name, sub_query);
                            }
                        }
                    } else {
                        warn!("decomposition output was not a JSON object; using injected query");
                    }
                }
                Ok(Err(e)) => warn!("decomposition call failed: {}", e),
                Err(_) => warn!("decomposition call timed out"),
            }
        }

        // Every selected agent gets a sub-query; the injected original is
        // the fallback for anything the model failed to cover.
        for record in selected {
            sub_queries
                .entry(record.name.clone())
                .or_insert_with(|| injected.clone());
        }
        sub_queries
    }
}

const DECOMPOSE_SYSTEM: &str = "You split a user query into standalone sub-queries, one per \
agent. Respond with ONLY a JSON object mapping agent names to sub-queries. Resolve every \
first-person reference (my, I, me) to the supplied user id. Do not add agents that are not \
listed.";

fn build_decompose_prompt(query: &str, selected: &[AgentRecord], user_id: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("User id: {}\n\nAgents:\n", user_id));
    for record in selected {
        prompt.push_str(&format!("- {}: {}\n", record.name, record.description));
    }
    prompt.push_str(&format!(
        "\nQuery: {}\n\nReturn a JSON object with exactly these keys: {}.",
        query,
        selected
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ));
    prompt
}

/// Parse the model's JSON object, tolerating surrounding prose or fences.
fn parse_decomposition(raw: &str) -> Option<HashMap<String, String>> {
    let json = extract_json_object(raw)?;
    let value: Value = serde_json::from_str(json).ok()?;
    let object = value.as_object()?;
    let mut map = HashMap::new();
    for (key, val) in object {
        if let Some(s) = val.as_str() {
            map.insert(key.clone(), s.to_string());
        }
    }
    Some(map)
}

/// Slice out the first balanced `{...}` in `raw`.
pub(crate) fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
