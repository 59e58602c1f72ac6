//! Common test utilities for reconciler tests.
//!
//! Everything runs against the in-memory directory, sink and state store.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

use dirsync_connector::config::{ConnectionConfig, Credentials};
use dirsync_connector::operation::{ChangeEvent, DirectoryEntry, SearchRequest};
use dirsync_connector::resilience::RetryConfig;
use dirsync_engine::prelude::*;

static INIT: Once = Once::new();

/// Initialize tracing once per test binary; honours `RUST_LOG`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    });
}

/// Timestamp on the given day of March 2024.
pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
}

/// A user entry below `OU=Staff`.
pub fn user(cn: &str, day: u32) -> DirectoryEntry {
    DirectoryEntry::new(format!("CN={},OU=Staff,DC=example,DC=com", cn))
        .with_object_class("top")
        .with_object_class("person")
        .with_object_class("user")
        .with_attribute("sAMAccountName", cn.to_lowercase())
        .with_attribute("mail", format!("{}@example.com", cn.to_lowercase()))
        .with_attribute("userAccountControl", "512")
        .with_when_changed(at(day))
}

/// Record key of [`user`].
pub fn key(cn: &str) -> String {
    format!("cn={},ou=staff,dc=example,dc=com", cn.to_lowercase())
}

/// Domain definition pointing at the in-memory directory.
pub fn domain(id: &str) -> DomainConfig {
    DomainConfig::new(
        id,
        ConnectionConfig::new("memory.example.com", Credentials::new("svc-sync", "secret")),
        SearchRequest::new("DC=example,DC=com", "(objectClass=user)", 2),
    )
}

/// Retries with millisecond backoff.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::default()
        .with_max_retries(max_retries)
        .with_backoff(1, 2)
        .without_jitter()
}

/// Default options with fast retries.
pub fn options() -> ReconcileOptions {
    ReconcileOptions::default()
        .with_sink_retry(fast_retry(2))
        .with_page_retry(fast_retry(2))
}

/// `upsert <key>` / `delete <key>` for readable assertions.
pub fn describe(events: &[ChangeEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            ChangeEvent::Upsert { key, .. } => format!("upsert {}", key),
            ChangeEvent::Delete { key } => format!("delete {}", key),
        })
        .collect()
}

/// Directory, sink and state for one domain.
pub struct Harness {
    pub directory: InMemoryDirectory,
    pub sink: Arc<MemorySink>,
    pub state: Arc<MemoryStateStore>,
    pub domain: DomainConfig,
}

impl Harness {
    pub fn new() -> Self {
        init_test_logging();
        Self {
            directory: InMemoryDirectory::new(),
            sink: Arc::new(MemorySink::new()),
            state: Arc::new(MemoryStateStore::new()),
            domain: domain("corp"),
        }
    }

    pub fn reconciler(&self, options: ReconcileOptions) -> Reconciler {
        Reconciler::new(
            Arc::new(self.directory.clone()),
            self.sink.clone(),
            self.state.clone(),
        )
        .with_options(options)
    }

    pub async fn run(&self, mode: RunMode) -> RunSummary {
        self.run_with(mode, options()).await
    }

    pub async fn run_with(&self, mode: RunMode, options: ReconcileOptions) -> RunSummary {
        self.reconciler(options)
            .run(&self.domain, mode, &CancellationToken::new())
            .await
    }

    /// Events delivered since the last call.
    pub async fn take_events(&self) -> Vec<String> {
        let events = describe(&self.sink.events().await);
        self.sink.clear_events().await;
        events
    }

    pub async fn cursor(&self) -> SyncCursor {
        self.state.load(&self.domain.id).await.unwrap()
    }

    pub async fn cursor_keys(&self) -> Vec<String> {
        self.cursor()
            .await
            .last_known_fingerprints
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
