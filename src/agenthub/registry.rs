//! The agent catalog: registration, lifecycle, and persistence glue.
//!
//! [`AgentRegistry`] owns the in-memory record map, writes every mutation
//! through the [`RegistryStore`](crate::registry_store::RegistryStore), and
//! refreshes the [`CapabilityIndex`](crate::capability::CapabilityIndex)
//! so routing always sees the post-mutation catalog.
//!
//! # Failure model
//!
//! A store failure rolls the in-memory map back to its pre-mutation state,
//! attempts a backup restore, and surfaces `PersistFailed` — the registry
//! never diverges from disk.
//!
//! # Remote registration
//!
//! ```text
//! register_remote(url)
//!   ├─ transport check (https unless dev override)
//!   ├─ fetch card (bounded, 10 s)
//!   ├─ structural validation
//!   ├─ malicious-pattern scan ──► match: persist status=rejected, fail
//!   ├─ capability auto-extraction (+ caller override per field)
//!   ├─ best-effort endpoint probe (never rejects)
//!   └─ persist status=pending
//! ```

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::agenthub::a2a_client::shared_http_client;
use crate::agenthub::agent_card::{
    extract_capability, fetch_card, AgentCard, CardInvalid, CardValidator,
};
use crate::agenthub::agent_record::{
    AgentAuthConfig, AgentKind, AgentRecord, ConstructorRef, ProviderInfo, RemoteStatus,
};
use crate::agenthub::capability::{Capability, CapabilityIndex};
use crate::agenthub::registry_store::{RegistryDocument, RegistryStore, StoreError};

/// Default bound on fetching an agent card during registration.
pub const DEFAULT_CARD_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures surfaced by registry operations.
#[derive(Debug)]
pub enum RegistryError {
    /// An agent with that name already exists.
    DuplicateName(String),
    /// No agent with that name.
    NotFound(String),
    /// The requested status change is outside the state machine.
    IllegalTransition {
        name: String,
        from: RemoteStatus,
        to: RemoteStatus,
    },
    /// A status change was requested on a local record.
    RemoteOnly(String),
    /// The agent card was refused.
    Card(CardInvalid),
    /// The catalog could not be written; the mutation was rolled back.
    PersistFailed(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateName(name) => {
                write!(f, "agent '{}' is already registered", name)
            }
            RegistryError::NotFound(name) => write!(f, "agent '{}' not found", name),
            RegistryError::IllegalTransition { name, from, to } => {
                write!(f, "agent '{}': illegal transition {} -> {}", name, from, to)
            }
            RegistryError::RemoteOnly(name) => {
                write!(f, "agent '{}' is local; status applies to remote agents", name)
            }
            RegistryError::Card(e) => write!(f, "{}", e),
            RegistryError::PersistFailed(msg) => write!(f, "catalog write failed: {}", msg),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RegistryError::Card(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CardInvalid> for RegistryError {
    fn from(e: CardInvalid) -> Self {
        RegistryError::Card(e)
    }
}

/// Per-field override applied on top of auto-extracted capabilities.
///
/// Only fields the caller supplies win; everything else keeps the
/// auto-extracted value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityOverride {
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub operations: Option<Vec<String>>,
    #[serde(default)]
    pub entities: Option<Vec<String>>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub examples: Option<Vec<String>>,
    #[serde(default)]
    pub requires_auth: Option<bool>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl CapabilityOverride {
    /// Merge this override onto `base`.
    pub fn apply(&self, mut base: Capability) -> Capability {
        if let Some(domains) = &self.domains {
            base.domains = domains.clone();
        }
        if let Some(operations) = &self.operations {
            base.operations = operations.clone();
        }
        if let Some(entities) = &self.entities {
            base.entities = entities.clone();
        }
        if let Some(keywords) = &self.keywords {
            base.keywords = keywords.iter().cloned().collect();
        }
        if let Some(examples) = &self.examples {
            base.examples = examples.clone();
        }
        if let Some(requires_auth) = self.requires_auth {
            base.requires_auth = requires_auth;
        }
        if let Some(priority) = self.priority {
            base.priority = priority;
        }
        base.sanitized()
    }
}

/// Caller-supplied parameters of a remote registration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRegistration {
    pub agent_card_url: String,
    #[serde(default)]
    pub capabilities_override: Option<CapabilityOverride>,
    pub provider: ProviderInfo,
    #[serde(default)]
    pub auth_config: AgentAuthConfig,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Authenticated registrant, recorded as the record's owner. Set by the
    /// HTTP layer, never taken from the request body.
    #[serde(skip)]
    pub owner: Option<String>,
}

/// What a successful remote registration returns.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteRegistrationOutcome {
    pub agent_name: String,
    pub registration_id: String,
    pub status: RemoteStatus,
}

/// Non-persisting preview of what a remote registration would produce.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryPreview {
    pub name: String,
    pub description: String,
    pub capabilities: Capability,
    pub invoke_endpoint: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Aggregate catalog counts for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub local: usize,
    pub remote: usize,
    pub enabled: usize,
    pub pending: usize,
    pub approved: usize,
    pub suspended: usize,
    pub rejected: usize,
}

/// The catalog of agents, persisted as one document.
pub struct AgentRegistry {
    store: RegistryStore,
    index: Arc<CapabilityIndex>,
    validator: CardValidator,
    http: reqwest::Client,
    card_fetch_timeout: Duration,
    records: RwLock<HashMap<String, AgentRecord>>,
}

impl AgentRegistry {
    /// Open the registry, loading any persisted catalog.
    ///
    /// A corrupt document (live *and* backup unusable) starts the registry
    /// empty and logs prominently; the error is not fatal because an empty
    /// catalog is still serviceable. I/O and schema-version failures
    /// propagate — the process should refuse to start on those.
    pub async fn open(
        store: RegistryStore,
        index: Arc<CapabilityIndex>,
        validator: CardValidator,
    ) -> Result<Self, StoreError> {
        let document = match store.load() {
            Ok(document) => document,
            Err(StoreError::Corrupt(msg)) => {
                error!(
                    "registry document and backup are both unusable ({}); starting with an empty catalog",
                    msg
                );
                RegistryDocument::empty()
            }
            Err(e) => return Err(e),
        };

        info!("registry loaded with {} agents", document.agents.len());
        let registry = Self {
            store,
            index,
            validator,
            http: shared_http_client().clone(),
            card_fetch_timeout: DEFAULT_CARD_FETCH_TIMEOUT,
            records: RwLock::new(document.agents),
        };
        registry.refresh_index().await;
        Ok(registry)
    }

    /// Override the card-fetch timeout (builder pattern).
    pub fn with_card_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.card_fetch_timeout = timeout;
        self
    }

    /// Register a local agent; enabled immediately.
    pub async fn register_local(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: Capability,
        constructor_ref: ConstructorRef,
        tags: Vec<String>,
    ) -> Result<AgentRecord, RegistryError> {
        let record = AgentRecord::new_local(name.into(), description.into(), capabilities, constructor_ref)
            .with_tags(tags);
        self.insert_record(record.clone()).await?;
        info!("registered local agent '{}'", record.name);
        Ok(record)
    }

    /// Insert a fully built record, failing on a duplicate name.
    ///
    /// Lower-level entry point used by registration paths that decorate the
    /// record (e.g. owner metadata) before it is persisted.
    pub async fn insert_record(&self, record: AgentRecord) -> Result<(), RegistryError> {
        let name = record.name.clone();
        let prior = {
            let mut records = self.records.write().await;
            if records.contains_key(&name) {
                return Err(RegistryError::DuplicateName(name));
            }
            let prior = records.clone();
            records.insert(name, record);
            prior
        };
        self.persist_or_rollback(prior).await
    }

    /// Register a remote agent from its card URL.
    ///
    /// Fetches and validates the card, auto-extracts capabilities, probes
    /// the invoke endpoint best-effort, and persists the record as
    /// `pending`.
    pub async fn register_remote(
        &self,
        registration: RemoteRegistration,
    ) -> Result<RemoteRegistrationOutcome, RegistryError> {
        self.validator.check_url(&registration.agent_card_url)?;
        let card = fetch_card(
            &self.http,
            &registration.agent_card_url,
            self.card_fetch_timeout,
        )
        .await?;

        // Rule 5: endpoint probe downgrades but never rejects.
        if let Some(endpoint) = card.invoke_endpoint() {
            let probe = self
                .http
                .head(endpoint)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            if let Err(e) = probe {
                warn!(
                    "invoke endpoint {} not reachable during registration: {}",
                    endpoint, e
                );
            }
        }

        self.register_remote_card(card, registration).await
    }

    /// Registration core shared by [`register_remote`](Self::register_remote)
    /// and deployments that obtain cards out-of-band.
    pub async fn register_remote_card(
        &self,
        card: AgentCard,
        registration: RemoteRegistration,
    ) -> Result<RemoteRegistrationOutcome, RegistryError> {
        let name = card.name.trim().to_string();

        let malicious = match self.validator.validate(&card) {
            Ok(()) => None,
            Err(e @ CardInvalid::MaliciousPattern(_)) => Some(e),
            Err(e) => return Err(e.into()),
        };

        {
            let records = self.records.read().await;
            if records.contains_key(&name) {
                return Err(RegistryError::DuplicateName(name));
            }
        }

        let capability = match &registration.capabilities_override {
            Some(overrides) => overrides.apply(extract_capability(&card)),
            None => extract_capability(&card),
        };

        let registration_id = registration_fingerprint(&registration.agent_card_url, &name);
        let mut record = AgentRecord::new_remote(
            name.clone(),
            card.description.trim().to_string(),
            capability,
            registration.agent_card_url.clone(),
            registration.provider.clone(),
            registration.auth_config.clone(),
        )
        .with_tags(registration.tags.clone())
        .with_metadata("registration_id", registration_id.clone());

        if let Some(owner) = &registration.owner {
            record = record.with_metadata("owner", owner.clone());
        }

        if let Some(reason) = &malicious {
            record.status = Some(RemoteStatus::Rejected);
            record.enabled = false;
            record = record.with_metadata("rejection_reason", reason.to_string());
        }

        let prior = {
            let mut records = self.records.write().await;
            if records.contains_key(&name) {
                return Err(RegistryError::DuplicateName(name));
            }
            let prior = records.clone();
            records.insert(name.clone(), record.clone());
            prior
        };
        self.persist_or_rollback(prior).await?;

        match malicious {
            Some(reason) => {
                warn!(
                    "remote agent '{}' rejected during registration: {}",
                    name, reason
                );
                Err(reason.into())
            }
            None => {
                info!("registered remote agent '{}' as pending", name);
                Ok(RemoteRegistrationOutcome {
                    agent_name: name,
                    registration_id,
                    status: RemoteStatus::Pending,
                })
            }
        }
    }

    /// Fetch + validate a card and preview the would-be registration
    /// without persisting anything.
    pub async fn discover(&self, agent_card_url: &str) -> Result<DiscoveryPreview, RegistryError> {
        self.validator.check_url(agent_card_url)?;
        let card = fetch_card(&self.http, agent_card_url, self.card_fetch_timeout).await?;
        self.preview_card(card).await
    }

    /// Preview core shared by [`discover`](Self::discover) and tests.
    pub async fn preview_card(&self, card: AgentCard) -> Result<DiscoveryPreview, RegistryError> {
        self.validator.validate(&card)?;
        let mut warnings = Vec::new();
        {
            let records = self.records.read().await;
            if records.contains_key(card.name.trim()) {
                warnings.push(format!(
                    "an agent named '{}' already exists; registration would fail",
                    card.name.trim()
                ));
            }
        }
        let invoke_endpoint = card.invoke_endpoint().unwrap_or_default().to_string();
        Ok(DiscoveryPreview {
            name: card.name.trim().to_string(),
            description: card.description.trim().to_string(),
            capabilities: extract_capability(&card),
            invoke_endpoint,
            warnings,
        })
    }

    /// List records, optionally restricted to enabled ones and/or by tags.
    /// Always sorted by name.
    pub async fn list(
        &self,
        enabled_only: bool,
        tags: Option<&[String]>,
    ) -> Vec<AgentRecord> {
        let records = self.records.read().await;
        let mut listed: Vec<AgentRecord> = records
            .values()
            .filter(|r| !enabled_only || r.enabled)
            .filter(|r| match tags {
                Some(tags) if !tags.is_empty() => r.matches_any_tag(tags),
                _ => true,
            })
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }

    /// Fetch one record by name.
    pub async fn get(&self, name: &str) -> Result<AgentRecord, RegistryError> {
        let records = self.records.read().await;
        records
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Fetch several records, preserving the order of `names` and skipping
    /// unknown entries.
    pub async fn get_many(&self, names: &[String]) -> Vec<AgentRecord> {
        let records = self.records.read().await;
        names
            .iter()
            .filter_map(|name| records.get(name).cloned())
            .collect()
    }

    /// Replace an agent's capabilities wholesale.
    pub async fn update_capabilities(
        &self,
        name: &str,
        capabilities: Capability,
    ) -> Result<(), RegistryError> {
        let prior = {
            let mut records = self.records.write().await;
            if !records.contains_key(name) {
                return Err(RegistryError::NotFound(name.to_string()));
            }
            let prior = records.clone();
            if let Some(record) = records.get_mut(name) {
                record.capabilities = capabilities.sanitized();
            }
            prior
        };
        self.persist_or_rollback(prior).await
    }

    /// Enable or disable an agent. Setting the current value is a no-op.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let prior = {
            let mut records = self.records.write().await;
            let current = records
                .get(name)
                .map(|r| r.enabled)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if current == enabled {
                return Ok(());
            }
            let prior = records.clone();
            if let Some(record) = records.get_mut(name) {
                record.enabled = enabled;
            }
            prior
        };
        self.persist_or_rollback(prior).await?;
        info!("agent '{}' enabled={}", name, enabled);
        Ok(())
    }

    /// Drive the remote approval state machine. Setting the current status
    /// is a no-op; transitions outside the machine fail.
    pub async fn set_status(&self, name: &str, to: RemoteStatus) -> Result<(), RegistryError> {
        let prior = {
            let mut records = self.records.write().await;
            let record = records
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if record.kind != AgentKind::Remote {
                return Err(RegistryError::RemoteOnly(name.to_string()));
            }
            let from = record.status.unwrap_or(RemoteStatus::Pending);
            if from == to {
                return Ok(());
            }
            if !from.can_transition_to(to) {
                return Err(RegistryError::IllegalTransition {
                    name: name.to_string(),
                    from,
                    to,
                });
            }
            let prior = records.clone();
            if let Some(record) = records.get_mut(name) {
                record.status = Some(to);
            }
            prior
        };
        self.persist_or_rollback(prior).await?;
        info!("agent '{}' status -> {}", name, to);
        Ok(())
    }

    /// Remove an agent from the catalog.
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let prior = {
            let mut records = self.records.write().await;
            if !records.contains_key(name) {
                return Err(RegistryError::NotFound(name.to_string()));
            }
            let prior = records.clone();
            records.remove(name);
            prior
        };
        self.persist_or_rollback(prior).await?;
        info!("deleted agent '{}'", name);
        Ok(())
    }

    /// Aggregate counts over the catalog.
    pub async fn stats(&self) -> RegistryStats {
        let records = self.records.read().await;
        let mut stats = RegistryStats {
            total: records.len(),
            local: 0,
            remote: 0,
            enabled: 0,
            pending: 0,
            approved: 0,
            suspended: 0,
            rejected: 0,
        };
        for record in records.values() {
            match record.kind {
                AgentKind::Local => stats.local += 1,
                AgentKind::Remote => stats.remote += 1,
            }
            if record.enabled {
                stats.enabled += 1;
            }
            match record.status {
                Some(RemoteStatus::Pending) => stats.pending += 1,
                Some(RemoteStatus::Approved) => stats.approved += 1,
                Some(RemoteStatus::Suspended) => stats.suspended += 1,
                Some(RemoteStatus::Rejected) => stats.rejected += 1,
                None => {}
            }
        }
        stats
    }

    /// Whether the backing store is usable (health probe).
    pub fn store_healthy(&self) -> bool {
        match self.store.load() {
            Ok(_) => true,
            Err(StoreError::Io(_)) => false,
            // A corrupt document is degraded but the service still runs.
            Err(_) => true,
        }
    }

    /// Rebuild the routing index from the current catalog.
    pub async fn refresh_index(&self) {
        let records: Vec<AgentRecord> = {
            let guard = self.records.read().await;
            guard.values().cloned().collect()
        };
        self.index.refresh(&records).await;
    }

    async fn persist_or_rollback(
        &self,
        prior: HashMap<String, AgentRecord>,
    ) -> Result<(), RegistryError> {
        let document = {
            let records = self.records.read().await;
            RegistryDocument {
                version: crate::agenthub::registry_store::SCHEMA_VERSION.to_string(),
                last_updated: Utc::now(),
                agents: records.clone(),
            }
        };

        match self.store.save(&document) {
            Ok(()) => {
                self.refresh_index().await;
                Ok(())
            }
            Err(e) => {
                error!("catalog write failed ({}); rolling back", e);
                {
                    let mut records = self.records.write().await;
                    *records = prior;
                }
                if let Err(restore_err) = self.store.restore_from_backup() {
                    warn!("backup restore after failed save also failed: {}", restore_err);
                }
                self.refresh_index().await;
                Err(RegistryError::PersistFailed(e.to_string()))
            }
        }
    }
}

/// Short, stable fingerprint identifying one registration.
fn registration_fingerprint(card_url: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(card_url.as_bytes());
    hasher.update(b"\0");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Tag set helper used by HTTP-layer filters.
pub fn parse_tag_filter(raw: Option<&str>) -> Option<Vec<String>> {
    raw.map(|s| {
        s.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
    })
    .filter(|tags: &Vec<String>| !tags.is_empty())
}

/// Deduplicate a caller-supplied tag list, preserving case.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tags.into_iter()
        .filter(|t| seen.insert(t.to_lowercase()))
        .collect()
}
