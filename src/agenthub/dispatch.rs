//! Dispatch polymorphism over local and remote agents.
//!
//! The orchestrator only ever talks to an [`AgentInvoker`]: something that
//! takes a sub-query and a bearer and produces an [`InvocationOutcome`].
//! Two implementations exist:
//!
//! - **Remote** — delegates to the [`A2aClient`] using the record's
//!   agent-card URL.
//! - **Local** — calls a [`LocalAgent`] instance in-process. Live instances
//!   are not serializable, so the catalog persists a [`ConstructorRef`] and
//!   the [`ConstructorRegistry`] rebuilds (and caches) the instance on
//!   demand.
//!
//! The [`Dispatcher`] wraps invoker resolution with the shared resource
//! policy: a per-agent concurrency cap with a bounded queue wait, a
//! per-agent timeout, and the remaining request deadline.
//!
//! # Example: registering a local agent constructor
//!
//! ```rust
//! use agenthub::dispatch::{ConstructorRegistry, LocalAgent};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct EchoAgent;
//!
//! #[async_trait]
//! impl LocalAgent for EchoAgent {
//!     async fn handle(
//!         &self,
//!         sub_query: &str,
//!     ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
//!         Ok(format!("echo: {}", sub_query))
//!     }
//! }
//!
//! # async {
//! let registry = ConstructorRegistry::new();
//! registry
//!     .register("agents::echo::build", |_| {
//!         Ok(Arc::new(EchoAgent) as Arc<dyn LocalAgent>)
//!     })
//!     .await;
//! # };
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};

use crate::agenthub::a2a_client::{A2aClient, InvocationOutcome};
use crate::agenthub::agent_record::{AgentKind, AgentRecord, ConstructorRef};

/// Default per-agent concurrent-dispatch cap.
pub const DEFAULT_PER_AGENT_CONCURRENCY: usize = 16;
/// Default bounded wait for a dispatch slot before failing fast.
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Metadata key carrying a per-agent invocation timeout override (ms).
pub const TIMEOUT_OVERRIDE_KEY: &str = "invoke_timeout_ms";

/// Anything that can execute one sub-query on behalf of one agent.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Execute `sub_query`, bounded by `timeout`.
    ///
    /// Implementations report failure through the outcome, never through a
    /// panic or an `Err` — the orchestrator records every outcome.
    async fn invoke(&self, sub_query: &str, bearer: &str, timeout: Duration) -> InvocationOutcome;
}

/// An in-process agent implementation.
#[async_trait]
pub trait LocalAgent: Send + Sync {
    /// Answer one sub-query.
    async fn handle(&self, sub_query: &str) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Constructor callback that produces a live [`LocalAgent`].
pub type LocalAgentConstructor =
    Arc<dyn Fn(&ConstructorRef) -> Result<Arc<dyn LocalAgent>, DispatchError> + Send + Sync>;

/// Dispatch-time failures.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// No constructor is registered under the record's constructor key.
    UnknownConstructor(String),
    /// The constructor ran but refused to build an instance.
    ConstructionFailed(String),
    /// The record cannot be dispatched (missing card URL or constructor ref).
    NotDispatchable(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::UnknownConstructor(key) => {
                write!(f, "no constructor registered for '{}'", key)
            }
            DispatchError::ConstructionFailed(msg) => {
                write!(f, "agent construction failed: {}", msg)
            }
            DispatchError::NotDispatchable(name) => {
                write!(f, "agent '{}' is not dispatchable", name)
            }
        }
    }
}

impl Error for DispatchError {}

/// Process-global registry of named local-agent constructors.
///
/// Constructors are registered at startup under
/// `"<module_path>::<symbol_name>"` keys. Resolved instances are cached per
/// constructor reference (key + parameters) so repeated routing to the same
/// local agent reuses one live instance.
pub struct ConstructorRegistry {
    constructors: RwLock<HashMap<String, LocalAgentConstructor>>,
    instances: RwLock<HashMap<String, Arc<dyn LocalAgent>>>,
}

impl ConstructorRegistry {
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Register a constructor under `key` (e.g. `"agents::tickets::build"`).
    pub async fn register<F>(&self, key: impl Into<String>, constructor: F)
    where
        F: Fn(&ConstructorRef) -> Result<Arc<dyn LocalAgent>, DispatchError>
            + Send
            + Sync
            + 'static,
    {
        let mut constructors = self.constructors.write().await;
        constructors.insert(key.into(), Arc::new(constructor));
    }

    /// Whether a constructor exists for `constructor_ref`.
    pub async fn can_resolve(&self, constructor_ref: &ConstructorRef) -> bool {
        let constructors = self.constructors.read().await;
        constructors.contains_key(&constructor_ref.registry_key())
    }

    /// Resolve (or rebuild) the live instance for `constructor_ref`.
    pub async fn resolve(
        &self,
        constructor_ref: &ConstructorRef,
    ) -> Result<Arc<dyn LocalAgent>, DispatchError> {
        let cache_key = instance_cache_key(constructor_ref);

        {
            let instances = self.instances.read().await;
            if let Some(instance) = instances.get(&cache_key) {
                return Ok(instance.clone());
            }
        }

        let constructor = {
            let constructors = self.constructors.read().await;
            constructors
                .get(&constructor_ref.registry_key())
                .cloned()
                .ok_or_else(|| {
                    DispatchError::UnknownConstructor(constructor_ref.registry_key())
                })?
        };

        let instance = constructor(constructor_ref)?;
        let mut instances = self.instances.write().await;
        instances.insert(cache_key, instance.clone());
        Ok(instance)
    }

    /// Drop all cached instances (e.g. after a capability update).
    pub async fn invalidate_instances(&self) {
        let mut instances = self.instances.write().await;
        instances.clear();
    }
}

impl Default for ConstructorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache key covering the constructor identity and its parameters.
fn instance_cache_key(constructor_ref: &ConstructorRef) -> String {
    let params = constructor_ref
        .params
        .as_ref()
        .and_then(|p| serde_json::to_string(&p).ok())
        .unwrap_or_default();
    format!("{}|{}", constructor_ref.registry_key(), params)
}

struct LocalInvoker {
    agent: Arc<dyn LocalAgent>,
}

#[async_trait]
impl AgentInvoker for LocalInvoker {
    async fn invoke(&self, sub_query: &str, _bearer: &str, timeout: Duration) -> InvocationOutcome {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.agent.handle(sub_query)).await {
            Err(_) => InvocationOutcome::failed("timeout", started.elapsed().as_millis() as u64),
            Ok(Err(e)) => {
                InvocationOutcome::failed(e.to_string(), started.elapsed().as_millis() as u64)
            }
            Ok(Ok(response)) => {
                InvocationOutcome::ok(response, started.elapsed().as_millis() as u64)
            }
        }
    }
}

struct RemoteInvoker {
    client: Arc<A2aClient>,
    card_url: String,
}

#[async_trait]
impl AgentInvoker for RemoteInvoker {
    async fn invoke(&self, sub_query: &str, bearer: &str, timeout: Duration) -> InvocationOutcome {
        self.client
            .invoke(&self.card_url, sub_query, bearer, timeout)
            .await
    }
}

/// Resolves records to invokers and enforces the dispatch resource policy.
pub struct Dispatcher {
    a2a: Arc<A2aClient>,
    constructors: Arc<ConstructorRegistry>,
    per_agent_limit: usize,
    queue_wait: Duration,
    default_timeout: Duration,
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    pub fn new(a2a: Arc<A2aClient>, constructors: Arc<ConstructorRegistry>) -> Self {
        let default_timeout = a2a.invoke_timeout();
        Self {
            a2a,
            constructors,
            per_agent_limit: DEFAULT_PER_AGENT_CONCURRENCY,
            queue_wait: DEFAULT_QUEUE_WAIT,
            default_timeout,
            semaphores: RwLock::new(HashMap::new()),
        }
    }

    /// Override the per-agent concurrency cap (builder pattern).
    pub fn with_per_agent_limit(mut self, limit: usize) -> Self {
        self.per_agent_limit = limit.max(1);
        self
    }

    /// Override the bounded queue wait (builder pattern).
    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }

    /// Override the default per-agent timeout (builder pattern).
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Build the invoker for one record.
    pub async fn invoker_for(
        &self,
        record: &AgentRecord,
    ) -> Result<Arc<dyn AgentInvoker>, DispatchError> {
        match record.kind {
            AgentKind::Local => {
                let constructor_ref = record.constructor_ref.as_ref().ok_or_else(|| {
                    DispatchError::NotDispatchable(record.name.clone())
                })?;
                let agent = self.constructors.resolve(constructor_ref).await?;
                Ok(Arc::new(LocalInvoker { agent }))
            }
            AgentKind::Remote => {
                let card_url = record.agent_card_url.as_ref().ok_or_else(|| {
                    DispatchError::NotDispatchable(record.name.clone())
                })?;
                Ok(Arc::new(RemoteInvoker {
                    client: self.a2a.clone(),
                    card_url: card_url.clone(),
                }))
            }
        }
    }

    /// Per-agent timeout for `record`: the metadata override when present,
    /// otherwise the configured default.
    pub fn timeout_for(&self, record: &AgentRecord) -> Duration {
        record
            .metadata
            .get(TIMEOUT_OVERRIDE_KEY)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    /// Execute one dispatch under the resource policy.
    ///
    /// `remaining` is what was left of the request deadline when the caller
    /// handed the dispatch off; the effective timeout is
    /// `min(per-agent, remaining)`. Time spent waiting for a dispatch slot
    /// is charged against `remaining` before the invoke starts, so queueing
    /// can never extend the request past its deadline. An exhausted budget
    /// is recorded as a cancellation without touching the agent.
    pub async fn dispatch(
        &self,
        record: &AgentRecord,
        sub_query: &str,
        bearer: &str,
        remaining: Duration,
    ) -> InvocationOutcome {
        if remaining.is_zero() {
            return InvocationOutcome::failed("cancelled", 0);
        }
        let entered = Instant::now();

        let invoker = match self.invoker_for(record).await {
            Ok(invoker) => invoker,
            Err(e) => return InvocationOutcome::failed(e.to_string(), 0),
        };

        let semaphore = self.semaphore_for(&record.name).await;
        let permit = match tokio::time::timeout(self.queue_wait, semaphore.acquire_owned()).await {
            Err(_) => {
                return InvocationOutcome::failed(
                    format!("agent '{}' is at its concurrency limit", record.name),
                    self.queue_wait.as_millis() as u64,
                );
            }
            Ok(Err(_)) => {
                return InvocationOutcome::failed("dispatch slot unavailable", 0);
            }
            Ok(Ok(permit)) => permit,
        };

        // Re-derive the budget now that the queue wait (and invoker
        // resolution) has consumed part of it.
        let remaining = remaining.saturating_sub(entered.elapsed());
        if remaining.is_zero() {
            return InvocationOutcome::failed("cancelled", entered.elapsed().as_millis() as u64);
        }

        let effective = self.timeout_for(record).min(remaining);
        let outcome = invoker.invoke(sub_query, bearer, effective).await;
        drop(permit);
        outcome
    }

    async fn semaphore_for(&self, agent_name: &str) -> Arc<Semaphore> {
        {
            let semaphores = self.semaphores.read().await;
            if let Some(semaphore) = semaphores.get(agent_name) {
                return semaphore.clone();
            }
        }
        let mut semaphores = self.semaphores.write().await;
        semaphores
            .entry(agent_name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_agent_limit)))
            .clone()
    }
}
