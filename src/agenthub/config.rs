//! Process configuration from environment variables.
//!
//! All knobs are read once at startup into a plain [`HubConfig`]; nothing
//! re-reads the environment afterwards. Unset variables fall back to the
//! documented defaults, and an unparseable value is a startup error (the
//! daemon exits with code 1 rather than running with a silently wrong
//! setting).

use std::env;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// A configuration variable holds an unusable value.
#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value '{}' for {}: {}",
            self.value, self.var, self.reason
        )
    }
}

impl Error for ConfigError {}

/// Everything the daemon needs to run, resolved from the environment.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// `REGISTRY_CONFIG_PATH` — location of the registry document.
    pub registry_path: PathBuf,
    /// `SESSION_DB_PATH` — location of the session database.
    pub session_db_path: PathBuf,
    /// `BIND_ADDR` — listen address of the HTTP surface.
    pub bind_addr: SocketAddr,
    /// `AUTH_SERVICE_URL` — where bearers are verified.
    pub auth_service_url: Option<String>,
    /// `REGISTRY_SERVICE_URL` — external registry service, when split out.
    pub registry_service_url: Option<String>,
    /// `STAGE1_K` — shortlist size for stage-2 adjudication.
    pub stage1_k: usize,
    /// `STAGE1_THRESHOLD` — minimum stage-1 score for candidacy.
    pub stage1_threshold: f32,
    /// `AGENT_INVOKE_TIMEOUT_MS` — default A2A invocation bound.
    pub agent_invoke_timeout: Duration,
    /// `SESSION_ACTIVITY_WINDOW_HOURS` — session resumption window.
    pub activity_window_hours: i64,
    /// `SESSION_HARD_EXPIRY_DAYS` — cleanup threshold for any session.
    pub hard_expiry_days: i64,
    /// `PER_AGENT_CONCURRENCY` — concurrent dispatch cap per agent.
    pub per_agent_concurrency: usize,
    /// `ALLOW_INSECURE_CARDS` — permit plain-text card URLs (development).
    pub allow_insecure_cards: bool,
    /// `ADMIN_ROLE` — role required for approval transitions.
    pub admin_role: String,
    /// `LLM_BASE_URL` — OpenAI-compatible endpoint for routing calls.
    pub llm_base_url: Option<String>,
    /// `LLM_API_KEY` — key for the routing model.
    pub llm_api_key: Option<String>,
    /// `LLM_MODEL` — model identifier for routing calls.
    pub llm_model: String,
}

impl HubConfig {
    /// Resolve the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            registry_path: PathBuf::from(
                env::var("REGISTRY_CONFIG_PATH").unwrap_or_else(|_| "agent_registry.json".into()),
            ),
            session_db_path: PathBuf::from(
                env::var("SESSION_DB_PATH").unwrap_or_else(|_| "sessions.db".into()),
            ),
            bind_addr: parse_var("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            auth_service_url: env::var("AUTH_SERVICE_URL").ok(),
            registry_service_url: env::var("REGISTRY_SERVICE_URL").ok(),
            stage1_k: parse_var("STAGE1_K", 10usize)?,
            stage1_threshold: parse_var("STAGE1_THRESHOLD", 0.1f32)?,
            agent_invoke_timeout: Duration::from_millis(parse_var(
                "AGENT_INVOKE_TIMEOUT_MS",
                30_000u64,
            )?),
            activity_window_hours: parse_var("SESSION_ACTIVITY_WINDOW_HOURS", 24i64)?,
            hard_expiry_days: parse_var("SESSION_HARD_EXPIRY_DAYS", 30i64)?,
            per_agent_concurrency: parse_var("PER_AGENT_CONCURRENCY", 16usize)?,
            allow_insecure_cards: parse_var("ALLOW_INSECURE_CARDS", false)?,
            admin_role: env::var("ADMIN_ROLE").unwrap_or_else(|_| "admin".into()),
            llm_base_url: env::var("LLM_BASE_URL").ok(),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        })
    }
}

fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
