//! Durable, crash-safe storage for the agent catalog.
//!
//! The whole catalog is one logical JSON document: a schema version, a
//! `last_updated` timestamp, and a map from agent name to [`AgentRecord`].
//! Writes are atomic with respect to concurrent readers — a reader sees
//! either the old document or the new one, never a partial write.
//!
//! # Write protocol
//!
//! ```text
//! save(doc):
//!   1. serialize doc → <path>.tmp, fsync
//!   2. copy <path> → <path>.backup    (if a live file exists)
//!   3. rename <path>.tmp → <path>     (atomic on POSIX)
//! ```
//!
//! A crash at any point leaves at least one of {live, backup} intact and
//! parseable. [`RegistryStore::load`] promotes the backup automatically when
//! the live file is malformed.
//!
//! Writers are serialized by a process-local mutex; concurrent writers from
//! *other processes* are not supported.

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::agenthub::agent_record::AgentRecord;

/// Current on-disk schema version. Documents with a different major
/// component fail closed.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// The single persisted document holding the whole catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Schema version, `major.minor.patch`.
    pub version: String,
    /// When the document was last written.
    pub last_updated: DateTime<Utc>,
    /// Agent records keyed by their unique name.
    pub agents: HashMap<String, AgentRecord>,
}

impl RegistryDocument {
    /// A fresh, empty document at the current schema version.
    pub fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            last_updated: Utc::now(),
            agents: HashMap::new(),
        }
    }
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self::empty()
    }
}

/// Failures surfaced by the registry store.
#[derive(Debug)]
pub enum StoreError {
    /// The filesystem refused an operation (permissions, missing parent, ...).
    Io(String),
    /// Neither the live file nor the backup parses as a valid document.
    Corrupt(String),
    /// The document parses but was written by an incompatible schema.
    IncompatibleVersion(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "registry store I/O error: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "registry store corrupt: {}", msg),
            StoreError::IncompatibleVersion(v) => {
                write!(f, "registry schema version {} is not supported", v)
            }
        }
    }
}

impl Error for StoreError {}

/// File-backed store that exclusively owns the registry document.
pub struct RegistryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RegistryStore {
    /// Create a store rooted at `path`. No I/O happens until `load`/`save`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the live document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the sibling backup.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry.json".to_string());
        name.push_str(".backup");
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry.json".to_string());
        name.push_str(".tmp");
        self.path.with_file_name(name)
    }

    /// Load the catalog document.
    ///
    /// A missing live file is a normal first boot and yields an empty
    /// document. A malformed live file triggers backup promotion; when the
    /// backup is also unusable the caller gets [`StoreError::Corrupt`] and
    /// decides whether to start empty.
    pub fn load(&self) -> Result<RegistryDocument, StoreError> {
        if !self.path.exists() {
            return Ok(RegistryDocument::empty());
        }

        match read_document(&self.path) {
            Ok(doc) => Ok(doc),
            // Version mismatch fails closed: the document is intact, we just
            // must not reinterpret it (and must not clobber it with a
            // promoted backup).
            Err(live_err @ StoreError::IncompatibleVersion(_)) => Err(live_err),
            Err(live_err) => {
                warn!(
                    "registry document at {} unreadable ({}); trying backup",
                    self.path.display(),
                    live_err
                );
                let backup = self.backup_path();
                if !backup.exists() {
                    return Err(StoreError::Corrupt(format!(
                        "{} (no backup present)",
                        live_err
                    )));
                }
                match read_document(&backup) {
                    Ok(doc) => {
                        // Promote the backup so the next load is clean.
                        if let Err(e) = fs::copy(&backup, &self.path) {
                            error!(
                                "failed to promote backup {} over {}: {}",
                                backup.display(),
                                self.path.display(),
                                e
                            );
                        }
                        Ok(doc)
                    }
                    Err(backup_err) => Err(StoreError::Corrupt(format!(
                        "live: {}; backup: {}",
                        live_err, backup_err
                    ))),
                }
            }
        }
    }

    /// Atomically replace the catalog document.
    pub fn save(&self, doc: &RegistryDocument) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        let serialized =
            serde_json::to_string_pretty(doc).map_err(|e| StoreError::Io(e.to_string()))?;

        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::Io(e.to_string()))?;
            file.write_all(serialized.as_bytes())
                .map_err(|e| StoreError::Io(e.to_string()))?;
            file.sync_all().map_err(|e| StoreError::Io(e.to_string()))?;
        }

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path()).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    /// Copy the backup over the live file.
    pub fn restore_from_backup(&self) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let backup = self.backup_path();
        if !backup.exists() {
            return Err(StoreError::Io(format!(
                "no backup at {}",
                backup.display()
            )));
        }
        fs::copy(&backup, &self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Parse one document file and enforce schema compatibility.
fn read_document(path: &Path) -> Result<RegistryDocument, StoreError> {
    let raw = fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
    let doc: RegistryDocument =
        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let major = doc.version.split('.').next().unwrap_or("");
    let supported_major = SCHEMA_VERSION.split('.').next().unwrap_or("");
    if major != supported_major {
        return Err(StoreError::IncompatibleVersion(doc.version));
    }
    Ok(doc)
}
