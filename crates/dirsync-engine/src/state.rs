//! Persisted per-domain sync state.
//!
//! A [`SyncCursor`] remembers what the sink has acknowledged: the fingerprint
//! of every delivered record and the change watermark. It is only replaced by
//! [`SyncStateStore::commit`] after a fully acknowledged pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use dirsync_connector::error::{SyncError, SyncResult};

use crate::atomic::write_atomic;
use crate::domain::validate_domain_id;

/// Current cursor layout version.
pub const CURSOR_VERSION: u32 = 1;

/// Persisted sync position of one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    /// Layout version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// When the last committed run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_run_at: Option<DateTime<Utc>>,

    /// Highest server change timestamp seen by a committed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_watermark: Option<DateTime<Utc>>,

    /// Record key to fingerprint of the last delivered content.
    #[serde(default)]
    pub last_known_fingerprints: BTreeMap<String, String>,
}

fn default_version() -> u32 {
    CURSOR_VERSION
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self {
            version: CURSOR_VERSION,
            last_successful_run_at: None,
            high_watermark: None,
            last_known_fingerprints: BTreeMap::new(),
        }
    }
}

impl SyncCursor {
    /// Whether no run has been committed yet.
    pub fn is_initial(&self) -> bool {
        self.last_successful_run_at.is_none()
    }

    /// Fingerprint last delivered for `key`.
    pub fn fingerprint(&self, key: &str) -> Option<&str> {
        self.last_known_fingerprints.get(key).map(String::as_str)
    }

    /// Number of known records.
    pub fn len(&self) -> usize {
        self.last_known_fingerprints.len()
    }

    /// Whether no records are known.
    pub fn is_empty(&self) -> bool {
        self.last_known_fingerprints.is_empty()
    }

    fn check_version(&self, domain: &str) -> SyncResult<()> {
        if self.version > CURSOR_VERSION {
            return Err(SyncError::state(format!(
                "cursor for '{}' has version {}, newest supported is {}",
                domain, self.version, CURSOR_VERSION
            )));
        }
        Ok(())
    }
}

/// Durable storage for sync cursors.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Load the cursor of a domain; a default cursor if none was committed.
    async fn load(&self, domain: &str) -> SyncResult<SyncCursor>;

    /// Replace the cursor of a domain. All or nothing.
    async fn commit(&self, domain: &str, cursor: &SyncCursor) -> SyncResult<()>;
}

/// JSON file store: one `<domain>.json` per domain in a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at `dir`. The directory is created on first commit.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the cursor files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a domain's cursor file.
    pub fn path_for(&self, domain: &str) -> SyncResult<PathBuf> {
        validate_domain_id(domain)?;
        Ok(self.dir.join(format!("{}.json", domain)))
    }
}

#[async_trait]
impl SyncStateStore for FileStateStore {
    async fn load(&self, domain: &str) -> SyncResult<SyncCursor> {
        let path = self.path_for(domain)?;

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(domain = %domain, path = %path.display(), "No cursor file, starting fresh");
                return Ok(SyncCursor::default());
            }
            Err(e) => {
                return Err(SyncError::state_with_source(
                    format!("failed to read cursor file {}", path.display()),
                    e,
                ))
            }
        };

        let cursor: SyncCursor = serde_json::from_slice(&contents).map_err(|e| {
            SyncError::state_with_source(
                format!("cursor file {} is corrupt", path.display()),
                e,
            )
        })?;
        cursor.check_version(domain)?;

        debug!(
            domain = %domain,
            records = cursor.len(),
            watermark = ?cursor.high_watermark,
            "Loaded cursor"
        );
        Ok(cursor)
    }

    async fn commit(&self, domain: &str, cursor: &SyncCursor) -> SyncResult<()> {
        let path = self.path_for(domain)?;
        let contents = serde_json::to_vec_pretty(cursor)
            .map_err(|e| SyncError::state_with_source("failed to encode cursor", e))?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &contents))
            .await
            .map_err(|e| SyncError::state_with_source("cursor write task failed", e))?
            .map_err(|e| {
                SyncError::state_with_source(
                    format!("failed to write cursor file {}", path.display()),
                    e,
                )
            })?;

        info!(
            domain = %domain,
            records = cursor.len(),
            path = %path.display(),
            "Committed cursor"
        );
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    cursors: RwLock<HashMap<String, SyncCursor>>,
    commits: AtomicUsize,
    fail_commits: AtomicBool,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail (simulates a crash before commit).
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Seed or replace a domain's cursor.
    pub async fn insert(&self, domain: &str, cursor: SyncCursor) {
        self.cursors.write().await.insert(domain.to_string(), cursor);
    }
}

#[async_trait]
impl SyncStateStore for MemoryStateStore {
    async fn load(&self, domain: &str) -> SyncResult<SyncCursor> {
        validate_domain_id(domain)?;
        let cursor = self
            .cursors
            .read()
            .await
            .get(domain)
            .cloned()
            .unwrap_or_default();
        cursor.check_version(domain)?;
        Ok(cursor)
    }

    async fn commit(&self, domain: &str, cursor: &SyncCursor) -> SyncResult<()> {
        validate_domain_id(domain)?;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SyncError::state(format!(
                "commit for '{}' rejected by test store",
                domain
            )));
        }
        self.cursors
            .write()
            .await
            .insert(domain.to_string(), cursor.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
