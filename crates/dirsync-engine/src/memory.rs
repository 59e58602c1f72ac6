//! In-memory directory and sink.
//!
//! Deterministic doubles for exercising the reconciler without a directory
//! server: paging, fault injection and connection accounting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use dirsync_connector::config::ConnectionConfig;
use dirsync_connector::error::{SyncError, SyncResult};
use dirsync_connector::operation::{
    parse_generalized_time, ChangeEvent, DirectoryEntry, MalformedEntry, NormalizedRecord, Page,
    ResumeToken, SearchRequest,
};
use dirsync_connector::traits::{DirectoryClient, DirectoryConnection, ServerInfo, Sink};

/// Directory contents shared between the client and its connections.
#[derive(Debug, Default)]
struct DirectoryData {
    entries: Vec<DirectoryEntry>,
    malformed: Vec<MalformedEntry>,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU32,
    closes: AtomicU32,
    fetches: AtomicU32,
    fetch_failures: AtomicU32,
    reject_bind: AtomicBool,
}

/// In-memory [`DirectoryClient`].
///
/// Searches return the entries below the base DN. Filters are not evaluated
/// except for a `(<attr>>=<GeneralizedTime>)` clause on the change
/// attribute, which is applied to `when_changed`.
#[derive(Debug, Clone)]
pub struct InMemoryDirectory {
    data: Arc<RwLock<DirectoryData>>,
    counters: Arc<Counters>,
    max_page_size: Option<u32>,
    naming_context: Option<String>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(DirectoryData::default())),
            counters: Arc::new(Counters::default()),
            max_page_size: None,
            naming_context: None,
        }
    }

    /// Report `dn` as the rootDSE default naming context.
    #[must_use]
    pub fn with_naming_context(mut self, dn: impl Into<String>) -> Self {
        self.naming_context = Some(dn.into());
        self
    }

    /// Cap page sizes like a server-side MaxPageSize limit.
    #[must_use]
    pub fn with_max_page_size(mut self, max: u32) -> Self {
        self.max_page_size = Some(max);
        self
    }

    /// Replace all entries.
    pub async fn set_entries(&self, entries: Vec<DirectoryEntry>) {
        self.data.write().await.entries = entries;
    }

    /// Add an entry.
    pub async fn add(&self, entry: DirectoryEntry) {
        self.data.write().await.entries.push(entry);
    }

    /// Remove every entry with the given DN (case-insensitive).
    pub async fn remove(&self, dn: &str) {
        self.data
            .write()
            .await
            .entries
            .retain(|e| !e.distinguished_name.eq_ignore_ascii_case(dn));
    }

    /// Return an undecodable entry with the first page.
    pub async fn add_malformed(&self, dn: impl Into<String>, message: impl Into<String>) {
        self.data.write().await.malformed.push(MalformedEntry {
            dn: dn.into(),
            message: message.into(),
        });
    }

    /// Fail the next `count` page fetches with a transient error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.counters.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Reject binds with an authentication error.
    pub fn reject_bind(&self, reject: bool) {
        self.counters.reject_bind.store(reject, Ordering::SeqCst);
    }

    /// Connections opened so far.
    pub fn connect_count(&self) -> u32 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    pub fn close_count(&self) -> u32 {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Page fetch calls so far, including failed ones.
    pub fn fetch_count(&self) -> u32 {
        self.counters.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    fn display_name(&self) -> &str {
        "in-memory"
    }

    async fn connect(&self, config: &ConnectionConfig) -> SyncResult<Box<dyn DirectoryConnection>> {
        config.validate()?;
        if self.counters.reject_bind.load(Ordering::SeqCst) {
            return Err(SyncError::Authentication {
                principal: config.credentials.principal.clone(),
            });
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryConnection {
            directory: self.clone(),
            closed: false,
        }))
    }
}

/// Connection handed out by [`InMemoryDirectory`].
#[derive(Debug)]
pub struct InMemoryConnection {
    directory: InMemoryDirectory,
    closed: bool,
}

#[async_trait]
impl DirectoryConnection for InMemoryConnection {
    async fn fetch_page(
        &mut self,
        request: &SearchRequest,
        resume: Option<&ResumeToken>,
    ) -> SyncResult<Page> {
        if self.closed {
            return Err(SyncError::connectivity("connection already closed"));
        }

        let counters = &self.directory.counters;
        counters.fetches.fetch_add(1, Ordering::SeqCst);
        let pending = counters.fetch_failures.load(Ordering::SeqCst);
        if pending > 0 {
            counters.fetch_failures.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::transient_read("injected fetch failure"));
        }

        let offset = match resume {
            None => 0,
            Some(token) => decode_offset(token)?,
        };

        let since = changed_since(&request.filter, &request.change_attribute);
        let data = self.directory.data.read().await;
        let matching: Vec<&DirectoryEntry> = data
            .entries
            .iter()
            .filter(|e| in_scope(&e.distinguished_name, &request.base_dn))
            .filter(|e| match since {
                Some(since) => e.when_changed.is_some_and(|changed| changed >= since),
                None => true,
            })
            .collect();

        let size = match self.directory.max_page_size {
            Some(max) => request.page_size.min(max),
            None => request.page_size,
        }
        .max(1) as usize;

        let end = (offset + size).min(matching.len());
        let entries = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| (*e).clone())
            .collect();
        let next = (end < matching.len()).then(|| encode_offset(end));

        let mut page = Page::new(entries, next);
        if offset == 0 {
            page.malformed = data.malformed.clone();
        }
        Ok(page)
    }

    async fn server_info(&mut self) -> SyncResult<ServerInfo> {
        Ok(ServerInfo {
            dns_host_name: Some("in-memory".to_string()),
            default_naming_context: self.directory.naming_context.clone(),
            highest_committed_usn: None,
            supported_ldap_versions: vec!["3".to_string()],
        })
    }

    async fn close(&mut self) -> SyncResult<()> {
        if !self.closed {
            self.closed = true;
            self.directory.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn encode_offset(offset: usize) -> ResumeToken {
    ResumeToken((offset as u64).to_be_bytes().to_vec())
}

fn decode_offset(token: &ResumeToken) -> SyncResult<usize> {
    let bytes: [u8; 8] = token
        .0
        .as_slice()
        .try_into()
        .map_err(|_| SyncError::protocol("invalid paging cookie"))?;
    Ok(u64::from_be_bytes(bytes) as usize)
}

/// Whether `dn` is `base` or below it. An empty base holds nothing but the
/// rootDSE.
fn in_scope(dn: &str, base: &str) -> bool {
    let base = base.trim().to_ascii_lowercase();
    if base.is_empty() {
        return false;
    }
    let dn = dn.to_ascii_lowercase();
    dn == base || dn.ends_with(&format!(",{}", base))
}

/// Extract the lower bound of a `(<attribute>>=<GeneralizedTime>)` clause.
fn changed_since(filter: &str, attribute: &str) -> Option<DateTime<Utc>> {
    let needle = format!("({}>=", attribute.to_ascii_lowercase());
    let lower = filter.to_ascii_lowercase();
    let start = lower.find(&needle)? + needle.len();
    let end = start + filter[start..].find(')')?;
    parse_generalized_time(&filter[start..end])
}

/// In-memory [`Sink`] recording every delivered event.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: RwLock<BTreeMap<String, NormalizedRecord>>,
    log: RwLock<Vec<ChangeEvent>>,
    batches: AtomicU32,
    failures: AtomicU32,
    always_fail: AtomicBool,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` batch deliveries.
    pub fn fail_next_batches(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Fail every batch delivery.
    pub fn fail_always(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Current stored records.
    pub async fn records(&self) -> BTreeMap<String, NormalizedRecord> {
        self.records.read().await.clone()
    }

    /// Every acknowledged event in delivery order.
    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.log.read().await.clone()
    }

    /// Forget the event log (records are kept).
    pub async fn clear_events(&self) {
        self.log.write().await.clear();
    }

    /// Delivery attempts, including failed ones.
    pub fn batch_attempts(&self) -> u32 {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, key: &str, record: &NormalizedRecord) -> SyncResult<()> {
        self.records
            .write()
            .await
            .insert(key.to_string(), record.clone());
        self.log
            .write()
            .await
            .push(ChangeEvent::upsert(record.clone()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.records.write().await.remove(key);
        self.log.write().await.push(ChangeEvent::delete(key));
        Ok(())
    }

    async fn deliver(&self, batch: &[ChangeEvent]) -> SyncResult<()> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(SyncError::sink_delivery("sink unavailable"));
        }
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::sink_delivery("injected delivery failure"));
        }

        for event in batch {
            match event {
                ChangeEvent::Upsert { key, record } => self.upsert(key, record).await?,
                ChangeEvent::Delete { key } => self.delete(key).await?,
            }
        }
        Ok(())
    }
}
