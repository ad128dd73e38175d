//! Two-stage agent selection.
//!
//! Stage 1 is the deterministic capability ranking from the
//! [`CapabilityIndex`](crate::capability::CapabilityIndex): cheap, O(n), and
//! reproducible — identical query plus identical catalog snapshot always
//! yields the identical ordering. Stage 2 hands the shortlist to a language
//! model which returns the subset that should actually handle the query.
//!
//! The model is advisory, never authoritative:
//!
//! - names outside the stage-1 shortlist are discarded,
//! - an empty or unparseable reply falls back to the stage-1 top 1,
//! - a single-candidate shortlist (or a shortlist size of 1) skips the
//!   model entirely.
//!
//! # Context bias
//!
//! Follow-up queries ("more details", "what about last week") tend to
//! belong to whichever agent answered last. When the session's
//! `last_agent_called` appears in the stage-1 shortlist, its score receives
//! a small additive bonus before stage 2, nudging the ranking without ever
//! introducing an agent that did not qualify on its own.
//!
//! [`QueryRouter::explain`] exposes the full decision — stage-1 scores, the
//! stage-2 prompt, and the final selection — for debugging.

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::agenthub::agent_record::AgentRecord;
use crate::agenthub::capability::{sort_ranking, CapabilityIndex, ScoredAgent};
use crate::agenthub::llm_client::LlmClient;
use crate::agenthub::registry::AgentRegistry;

/// Additive score bonus for the session's previous agent.
pub const DEFAULT_CONTEXT_BIAS: f32 = 0.15;

/// Result of one routing call.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Selected records, ordered by their stage-1 ranking.
    pub selected: Vec<AgentRecord>,
    /// The full stage-1 ranking the selection was drawn from.
    pub stage1: Vec<ScoredAgent>,
}

impl RouteOutcome {
    fn empty() -> Self {
        Self {
            selected: Vec::new(),
            stage1: Vec::new(),
        }
    }
}

/// Debug view of one routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RouteExplanation {
    pub stage1: Vec<ScoredAgent>,
    /// The prompt sent to stage 2, when stage 2 ran.
    pub stage2_prompt: Option<String>,
    pub selected: Vec<String>,
}

/// The two-stage selection engine.
pub struct QueryRouter {
    index: Arc<CapabilityIndex>,
    registry: Arc<AgentRegistry>,
    llm: Option<Arc<dyn LlmClient>>,
    context_bias: f32,
    llm_timeout: Duration,
}

impl QueryRouter {
    /// Router over `index` and `registry`, adjudicating with `llm` when one
    /// is provided. Without a model the router degrades to stage-1 top 1.
    pub fn new(
        index: Arc<CapabilityIndex>,
        registry: Arc<AgentRegistry>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        Self {
            index,
            registry,
            llm,
            context_bias: DEFAULT_CONTEXT_BIAS,
            llm_timeout: crate::agenthub::llm_client::DEFAULT_LLM_TIMEOUT,
        }
    }

    /// Override the context-bias bonus (builder pattern).
    pub fn with_context_bias(mut self, bias: f32) -> Self {
        self.context_bias = bias;
        self
    }

    /// Override the stage-2 model timeout (builder pattern).
    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    /// Select the agents that should handle `query`.
    ///
    /// `last_agent_called` is the session's previous agent (context bias);
    /// `tag_filter` restricts stage 1 to agents carrying one of the tags.
    pub async fn route(
        &self,
        query: &str,
        last_agent_called: Option<&str>,
        tag_filter: Option<&[String]>,
    ) -> RouteOutcome {
        let (stage1, _prompt, selected_names) =
            self.select(query, last_agent_called, tag_filter).await;
        if selected_names.is_empty() {
            return RouteOutcome::empty();
        }

        let records = self.registry.get_many(&selected_names).await;
        // The snapshot only holds routable agents, but the catalog may have
        // mutated between scoring and this lookup; re-check.
        let selected = records.into_iter().filter(|r| r.is_routable()).collect();
        RouteOutcome { selected, stage1 }
    }

    /// Routing with full visibility: stage-1 scores, the stage-2 prompt,
    /// and the final selection.
    pub async fn explain(
        &self,
        query: &str,
        last_agent_called: Option<&str>,
        tag_filter: Option<&[String]>,
    ) -> RouteExplanation {
        let (stage1, stage2_prompt, selected) =
            self.select(query, last_agent_called, tag_filter).await;
        RouteExplanation {
            stage1,
            stage2_prompt,
            selected,
        }
    }

    /// Core pipeline shared by [`route`](Self::route) and
    /// [`explain`](Self::explain). Returns the biased stage-1 ranking, the
    /// stage-2 prompt (when stage 2 ran), and the selected names in stage-1
    /// order.
    async fn select(
        &self,
        query: &str,
        last_agent_called: Option<&str>,
        tag_filter: Option<&[String]>,
    ) -> (Vec<ScoredAgent>, Option<String>, Vec<String>) {
        let mut stage1 = self.index.score(query, tag_filter).await;

        if let Some(last) = last_agent_called {
            if let Some(hit) = stage1.iter_mut().find(|c| c.name == last) {
                hit.score += self.context_bias;
                sort_ranking(&mut stage1);
                debug!("context bias applied to '{}'", last);
            }
        }

        if stage1.is_empty() {
            return (stage1, None, Vec::new());
        }
        if stage1.len() == 1 || self.index.stage1_k() == 1 {
            let selected = vec![stage1[0].name.clone()];
            return (stage1, None, selected);
        }

        let llm = match &self.llm {
            Some(llm) => llm,
            None => {
                // Degraded mode: deterministic top 1.
                let selected = vec![stage1[0].name.clone()];
                return (stage1, None, selected);
            }
        };

        let candidates = self
            .registry
            .get_many(&stage1.iter().map(|c| c.name.clone()).collect::<Vec<_>>())
            .await;
        let prompt = build_stage2_prompt(query, &candidates);

        let reply =
            match tokio::time::timeout(self.llm_timeout, llm.complete(STAGE2_SYSTEM, &prompt)).await
            {
                Ok(Ok(reply)) => Some(reply),
                Ok(Err(e)) => {
                    warn!("stage-2 adjudication failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!("stage-2 adjudication timed out");
                    None
                }
            };

        let mut selected: Vec<String> = reply
            .as_deref()
            .and_then(parse_agent_names)
            .unwrap_or_default();

        // Reject names outside the candidate set, keep stage-1 order.
        selected = stage1
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| selected.iter().any(|s| s == name))
            .collect();

        if selected.is_empty() {
            selected = vec![stage1[0].name.clone()];
        }

        (stage1, Some(prompt), selected)
    }
}

const STAGE2_SYSTEM: &str = "You route user queries to specialized agents. Given a query and a \
numbered list of candidate agents, reply with ONLY a JSON array of the agent names that should \
handle the query. Select every agent whose specialty the query touches, and no others.";

fn build_stage2_prompt(query: &str, candidates: &[AgentRecord]) -> String {
    let mut prompt = format!("Query: {}\n\nCandidates:\n", query);
    for (i, record) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. {} — {}\n   domains: {}\n",
            i + 1,
            record.name,
            record.description,
            record.capabilities.domains.join(", "),
        ));
        if !record.capabilities.examples.is_empty() {
            prompt.push_str(&format!(
                "   examples: {}\n",
                record.capabilities.examples.join(" | ")
            ));
        }
    }
    prompt.push_str("\nReply with a JSON array of agent names.");
    prompt
}

/// Parse the model reply into agent names.
///
/// Accepts a bare JSON array or an object with an `agents` array; anything
/// else yields `None` and the caller falls back to stage-1 top 1.
fn parse_agent_names(raw: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(raw.trim())
        .ok()
        .or_else(|| extract_json_array(raw).and_then(|s| serde_json::from_str(s).ok()))?;

    let array = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map.get("agents")?.as_array()?.clone(),
        _ => return None,
    };

    Some(
        array
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
    )
}

/// Slice out the first balanced `[...]` in `raw`.
fn extract_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
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
            '[' => depth += 1,
            ']' => {
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
