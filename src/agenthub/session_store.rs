//! Durable per-user conversation state on an embedded SQLite database.
//!
//! The store owns four tables: session metadata, the ordered conversation
//! history, per-agent invocation outcomes, and a one-row-per-session routing
//! context. Referential integrity is enforced by the schema — deleting a
//! session cascade-deletes its history, invocations, and context.
//!
//! # Ordering
//!
//! Messages within a session are totally ordered by a monotonically
//! assigned `seq`. Assignment happens inside the insert transaction, so two
//! concurrent appends to the same session can never collide.
//!
//! # Concurrency
//!
//! All operations go through one connection behind a mutex, which
//! serializes writes globally. That is a documented limitation of the
//! embedded backend — the store's interface is drawn so a client-server
//! database can replace SQLite without touching the orchestrator.
//!
//! # Session resumption
//!
//! A user resumes their most recent `active` session when its `updated_at`
//! is strictly inside the activity window (default 24 hours). Older
//! sessions stay queryable by id but are no longer offered for resumption.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Default window inside which an active session is resumed.
pub const DEFAULT_ACTIVITY_WINDOW_HOURS: i64 = 24;
/// Default age at which any session is removed by cleanup.
pub const DEFAULT_HARD_EXPIRY_DAYS: i64 = 30;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id  TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    status      TEXT NOT NULL,
    metadata    TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_user_status
    ON sessions(user_id, status, updated_at);

CREATE TABLE IF NOT EXISTS conversation_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_session_seq
    ON conversation_history(session_id, seq);

CREATE TABLE IF NOT EXISTS agent_invocations (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    agent_name    TEXT NOT NULL,
    query         TEXT NOT NULL,
    response      TEXT,
    success       INTEGER NOT NULL,
    error_message TEXT,
    duration_ms   INTEGER NOT NULL,
    timestamp     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_invocations_session ON agent_invocations(session_id);
CREATE INDEX IF NOT EXISTS idx_invocations_agent ON agent_invocations(agent_name);

CREATE TABLE IF NOT EXISTS session_context (
    session_id        TEXT PRIMARY KEY REFERENCES sessions(session_id) ON DELETE CASCADE,
    last_agent_called TEXT,
    last_query        TEXT,
    last_response     TEXT,
    updated_at        TEXT NOT NULL
);
";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// Session metadata row.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub metadata: Option<serde_json::Value>,
}

/// One conversation message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct StoredInvocation {
    pub agent_name: String,
    pub query: String,
    pub response: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

/// Routing context updated after every dispatch.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub last_agent_called: Option<String>,
    pub last_query: Option<String>,
    pub last_response: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Everything known about one session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub meta: SessionMeta,
    pub history: Vec<StoredMessage>,
    pub invocations: Vec<StoredInvocation>,
    pub context: Option<SessionContext>,
}

/// Failures surfaced by the session store.
#[derive(Debug)]
pub enum SessionStoreError {
    /// No session with the given id.
    NotFound(String),
    /// The underlying database refused an operation.
    Storage(String),
}

impl fmt::Display for SessionStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStoreError::NotFound(id) => write!(f, "session not found: {}", id),
            SessionStoreError::Storage(msg) => write!(f, "session store error: {}", msg),
        }
    }
}

impl Error for SessionStoreError {}

impl From<rusqlite::Error> for SessionStoreError {
    fn from(e: rusqlite::Error) -> Self {
        SessionStoreError::Storage(e.to_string())
    }
}

/// The session database. Exclusively owns its SQLite file.
pub struct SessionStore {
    conn: Mutex<Connection>,
    activity_window: ChronoDuration,
    hard_expiry_days: i64,
}

impl SessionStore {
    /// Open (or create) the database at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        activity_window: ChronoDuration,
        hard_expiry_days: i64,
    ) -> Result<Self, SessionStoreError> {
        let conn = Connection::open(path)?;
        Self::initialize(conn, activity_window, hard_expiry_days)
    }

    /// Open an in-memory database (tests and throwaway environments).
    pub fn open_in_memory(
        activity_window: ChronoDuration,
        hard_expiry_days: i64,
    ) -> Result<Self, SessionStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, activity_window, hard_expiry_days)
    }

    fn initialize(
        conn: Connection,
        activity_window: ChronoDuration,
        hard_expiry_days: i64,
    ) -> Result<Self, SessionStoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            activity_window,
            hard_expiry_days,
        })
    }

    /// Create a session for `user_id` and return its opaque id.
    pub fn create_session(&self, user_id: &str) -> Result<String, SessionStoreError> {
        let session_id = Uuid::new_v4().to_string();
        let now = fmt_timestamp(Utc::now());
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, user_id, created_at, updated_at, status)
             VALUES (?1, ?2, ?3, ?3, 'active')",
            params![session_id, user_id, now],
        )?;
        Ok(session_id)
    }

    /// Load session metadata, ordered history, invocations, and context.
    pub fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, SessionStoreError> {
        let conn = self.lock();

        let meta = conn
            .query_row(
                "SELECT session_id, user_id, created_at, updated_at, status, metadata
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;

        let meta = SessionMeta {
            session_id: meta.0,
            user_id: meta.1,
            created_at: parse_timestamp(&meta.2)?,
            updated_at: parse_timestamp(&meta.3)?,
            status: SessionStatus::parse(&meta.4)
                .ok_or_else(|| SessionStoreError::Storage(format!("bad status '{}'", meta.4)))?,
            metadata: meta
                .5
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| SessionStoreError::Storage(e.to_string()))?,
        };

        let mut history = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT seq, role, content, timestamp FROM conversation_history
                 WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for row in rows {
                let (seq, role, content, timestamp) = row?;
                history.push(StoredMessage {
                    seq,
                    role: MessageRole::parse(&role).ok_or_else(|| {
                        SessionStoreError::Storage(format!("bad role '{}'", role))
                    })?,
                    content,
                    timestamp: parse_timestamp(&timestamp)?,
                });
            }
        }

        let mut invocations = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT agent_name, query, response, success, error_message, duration_ms, timestamp
                 FROM agent_invocations WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;
            for row in rows {
                let (agent_name, query, response, success, error_message, duration_ms, timestamp) =
                    row?;
                invocations.push(StoredInvocation {
                    agent_name,
                    query,
                    response,
                    success: success != 0,
                    error_message,
                    duration_ms,
                    timestamp: parse_timestamp(&timestamp)?,
                });
            }
        }

        let context = conn
            .query_row(
                "SELECT last_agent_called, last_query, last_response, updated_at
                 FROM session_context WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let context = match context {
            Some((last_agent_called, last_query, last_response, updated_at)) => Some(SessionContext {
                last_agent_called,
                last_query,
                last_response,
                updated_at: parse_timestamp(&updated_at)?,
            }),
            None => None,
        };

        Ok(SessionSnapshot {
            meta,
            history,
            invocations,
            context,
        })
    }

    /// Append a message, assigning the next `seq` and bumping `updated_at`.
    pub fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<i64, SessionStoreError> {
        let now = fmt_timestamp(Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(SessionStoreError::NotFound(session_id.to_string()));
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_history WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO conversation_history (session_id, role, content, seq, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, role.as_str(), content, seq, now],
        )?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE session_id = ?1",
            params![session_id, now],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Record one agent invocation and update the routing context.
    #[allow(clippy::too_many_arguments)]
    pub fn record_invocation(
        &self,
        session_id: &str,
        agent_name: &str,
        query: &str,
        response: Option<&str>,
        success: bool,
        error_message: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), SessionStoreError> {
        let now = fmt_timestamp(Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO agent_invocations
                (session_id, agent_name, query, response, success, error_message, duration_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                agent_name,
                query,
                response,
                success as i64,
                error_message,
                duration_ms as i64,
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO session_context
                (session_id, last_agent_called, last_query, last_response, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                last_agent_called = excluded.last_agent_called,
                last_query = excluded.last_query,
                last_response = excluded.last_response,
                updated_at = excluded.updated_at",
            params![session_id, agent_name, query, response, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Change a session's lifecycle status.
    pub fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), SessionStoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET status = ?2 WHERE session_id = ?1",
            params![session_id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(SessionStoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Delete a session; history, invocations, and context cascade.
    pub fn delete(&self, session_id: &str) -> Result<(), SessionStoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        if changed == 0 {
            return Err(SessionStoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Most recent active session for `user_id` inside the activity window.
    pub fn active_session_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, SessionStoreError> {
        let cutoff = fmt_timestamp(Utc::now() - self.activity_window);
        let conn = self.lock();
        let session_id = conn
            .query_row(
                "SELECT session_id FROM sessions
                 WHERE user_id = ?1 AND status = 'active' AND updated_at > ?2
                 ORDER BY updated_at DESC LIMIT 1",
                params![user_id, cutoff],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(session_id)
    }

    /// Remove completed sessions older than `ttl_days` and any session older
    /// than the hard expiry. Returns `(completed_removed, expired_removed)`.
    pub fn cleanup(&self, ttl_days: i64) -> Result<(usize, usize), SessionStoreError> {
        let completed_cutoff = fmt_timestamp(Utc::now() - ChronoDuration::days(ttl_days));
        let hard_cutoff = fmt_timestamp(Utc::now() - ChronoDuration::days(self.hard_expiry_days));
        let conn = self.lock();
        let completed = conn.execute(
            "DELETE FROM sessions WHERE status = 'completed' AND updated_at < ?1",
            params![completed_cutoff],
        )?;
        let expired = conn.execute(
            "DELETE FROM sessions WHERE updated_at < ?1",
            params![hard_cutoff],
        )?;
        if completed > 0 || expired > 0 {
            info!(
                "session cleanup removed {} completed and {} expired sessions",
                completed, expired
            );
        }
        Ok((completed, expired))
    }

    /// Recent invocations of one agent across all sessions (operator view).
    pub fn invocations_for_agent(
        &self,
        agent_name: &str,
        limit: usize,
    ) -> Result<Vec<StoredInvocation>, SessionStoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT agent_name, query, response, success, error_message, duration_ms, timestamp
             FROM agent_invocations WHERE agent_name = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_name, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut invocations = Vec::new();
        for row in rows {
            let (agent_name, query, response, success, error_message, duration_ms, timestamp) =
                row?;
            invocations.push(StoredInvocation {
                agent_name,
                query,
                response,
                success: success != 0,
                error_message,
                duration_ms,
                timestamp: parse_timestamp(&timestamp)?,
            });
        }
        Ok(invocations)
    }

    /// Whether the database answers a trivial query (health probe).
    pub fn is_healthy(&self) -> bool {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed-precision RFC 3339 so stored strings compare correctly in SQL.
fn fmt_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SessionStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SessionStoreError::Storage(format!("bad timestamp '{}': {}", raw, e)))
}
