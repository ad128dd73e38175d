//! Catalog entry types for local and remote agents.
//!
//! An [`AgentRecord`] is the unit of persistence in the agent registry. Two
//! kinds exist:
//!
//! - **Local** — implemented in-process; the record carries a
//!   [`ConstructorRef`] naming the constructor that rebuilds the live agent
//!   after a cold start. The live instance itself is never serialized.
//! - **Remote** — hosted externally and addressed by its agent-card URL;
//!   the record carries provider information, an auth configuration, and an
//!   approval [`RemoteStatus`] driven by the admin state machine.
//!
//! # Status state machine (remote only)
//!
//! ```text
//! pending ──► approved ◄──► suspended
//!    │
//!    └─────► rejected
//! ```
//!
//! Setting a record to its current status is an idempotent no-op; any other
//! edge not drawn above is an illegal transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::agenthub::capability::Capability;

/// Whether an agent runs in-process or behind the A2A protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Reconstructed in-process from a [`ConstructorRef`].
    Local,
    /// Reached over HTTP via its agent-card URL.
    Remote,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Local => write!(f, "local"),
            AgentKind::Remote => write!(f, "remote"),
        }
    }
}

/// Approval lifecycle state of a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    /// Registered but not yet reviewed; never dispatched.
    Pending,
    /// Cleared for routing and dispatch.
    Approved,
    /// Temporarily withdrawn by an admin.
    Suspended,
    /// Permanently refused (e.g. a malicious card).
    Rejected,
}

impl RemoteStatus {
    /// Whether the admin state machine permits `self → to`.
    ///
    /// A self-transition is always permitted (and treated as a no-op by the
    /// registry).
    pub fn can_transition_to(self, to: RemoteStatus) -> bool {
        use RemoteStatus::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Suspended) | (Suspended, Approved)
        )
    }

    /// Lowercase form matching the serde rename, so logs and HTTP bodies agree.
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Pending => "pending",
            RemoteStatus::Approved => "approved",
            RemoteStatus::Suspended => "suspended",
            RemoteStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to the in-process constructor of a local agent.
///
/// The live agent (model, tools, prompt) is not serializable; this is what
/// the registry persists instead, and the dispatcher resolves it through the
/// process-global constructor registry on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructorRef {
    /// Module path of the constructor (e.g. `"agents::tickets"`).
    pub module_path: String,
    /// Constructor symbol within the module (e.g. `"build"`).
    pub symbol_name: String,
    /// Optional construction parameters, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, serde_json::Value>>,
}

impl ConstructorRef {
    /// Create a parameterless constructor reference.
    pub fn new(module_path: impl Into<String>, symbol_name: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            symbol_name: symbol_name.into(),
            params: None,
        }
    }

    /// Attach construction parameters (builder pattern).
    pub fn with_params(mut self, params: HashMap<String, serde_json::Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Stable lookup key into the constructor registry.
    pub fn registry_key(&self) -> String {
        format!("{}::{}", self.module_path, self.symbol_name)
    }
}

/// Publisher details for a remote agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Organization or developer name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// Authentication scheme a remote agent expects on inbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    Bearer,
    ApiKey,
    Oauth2,
    None,
}

impl Default for AuthScheme {
    fn default() -> Self {
        AuthScheme::Bearer
    }
}

/// How to authenticate against a remote agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentAuthConfig {
    /// Required scheme; defaults to bearer.
    #[serde(default)]
    pub scheme: AuthScheme,
    /// Token endpoint for `oauth2` schemes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    /// OAuth scopes, when applicable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// One catalog entry: everything the platform knows about an agent.
///
/// Records are shared by value; only the registry mutates persistent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique catalog key.
    pub name: String,
    /// Human-readable summary, surfaced to the stage-2 adjudicator.
    pub description: String,
    /// Local or remote.
    pub kind: AgentKind,
    /// Disabled records are invisible to routing.
    pub enabled: bool,
    /// Free-form grouping labels, matched case-insensitively by filters.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Record-level ordering hint (distinct from capability priority).
    #[serde(default)]
    pub priority: i32,
    /// Routing metadata.
    pub capabilities: Capability,
    /// When the record entered the catalog.
    pub registered_at: DateTime<Utc>,
    /// Arbitrary operator-defined annotations (e.g. `owner`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    // ---- Local-only ----
    /// Constructor reference; present iff `kind == Local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constructor_ref: Option<ConstructorRef>,

    // ---- Remote-only ----
    /// Agent-card URL; present iff `kind == Remote`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_card_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_config: Option<AgentAuthConfig>,
    /// Approval status; present iff `kind == Remote`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RemoteStatus>,
}

impl AgentRecord {
    /// Build a local record, enabled immediately.
    pub fn new_local(
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: Capability,
        constructor_ref: ConstructorRef,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: AgentKind::Local,
            enabled: true,
            tags: BTreeSet::new(),
            priority: 0,
            capabilities: capabilities.sanitized(),
            registered_at: Utc::now(),
            metadata: HashMap::new(),
            constructor_ref: Some(constructor_ref),
            agent_card_url: None,
            provider: None,
            auth_config: None,
            status: None,
        }
    }

    /// Build a remote record in the `pending` state.
    pub fn new_remote(
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: Capability,
        agent_card_url: impl Into<String>,
        provider: ProviderInfo,
        auth_config: AgentAuthConfig,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: AgentKind::Remote,
            enabled: true,
            tags: BTreeSet::new(),
            priority: 0,
            capabilities: capabilities.sanitized(),
            registered_at: Utc::now(),
            metadata: HashMap::new(),
            constructor_ref: None,
            agent_card_url: Some(agent_card_url.into()),
            provider: Some(provider),
            auth_config: Some(auth_config),
            status: Some(RemoteStatus::Pending),
        }
    }

    /// Attach tags (builder pattern).
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a metadata annotation (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the router may consider this record at all.
    ///
    /// Local records only need to be enabled (constructor resolution is
    /// checked at dispatch time); remote records additionally need admin
    /// approval.
    pub fn is_routable(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.kind {
            AgentKind::Local => true,
            AgentKind::Remote => self.status == Some(RemoteStatus::Approved),
        }
    }

    /// Whether this record carries at least one of `tags` (case-insensitive).
    pub fn matches_any_tag(&self, tags: &[String]) -> bool {
        let own: BTreeSet<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();
        tags.iter().any(|t| own.contains(&t.to_lowercase()))
    }
}
