//! # Directory Sync Engine
//!
//! Reads a directory page by page, normalizes entries into fingerprinted
//! records, diffs them against the last committed cursor and delivers the
//! resulting change events to a sink.
//!
//! ## Modules
//!
//! - [`normalize`] - Entry to record mapping and fingerprints
//! - [`state`] - Durable per-domain cursors
//! - [`reconcile`] - The run state machine
//! - [`runner`] - Concurrent multi-domain runs
//! - [`summary`] - Run reports
//! - [`memory`] - In-memory directory and sink
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dirsync_engine::prelude::*;
//!
//! let reconciler = Reconciler::new(client, sink, Arc::new(FileStateStore::new("state")));
//! let summary = reconciler.run(&domain, RunMode::Full, &CancellationToken::new()).await;
//! println!("{}", summary.describe());
//! ```

pub mod atomic;
pub mod domain;
pub mod memory;
pub mod normalize;
pub mod reconcile;
pub mod runner;
pub mod state;
pub mod summary;

pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::domain::{validate_domain_id, DomainConfig};
    pub use crate::memory::{InMemoryDirectory, MemorySink};
    pub use crate::normalize::{EntryNormalizer, FieldMapping, NormalizerConfig};
    pub use crate::reconcile::{ReconcileOptions, Reconciler};
    pub use crate::runner::{SyncJob, SyncRunner};
    pub use crate::state::{FileStateStore, MemoryStateStore, SyncCursor, SyncStateStore};
    pub use crate::summary::{RunMode, RunPhase, RunStatus, RunSummary, SkipRecord};
    pub use crate::CancellationToken;
}
