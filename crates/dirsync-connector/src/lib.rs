//! # Directory Connector Framework
//!
//! Core abstractions for reading identity data out of LDAP directories and
//! handing normalized changes to a downstream sink.
//!
//! ## Architecture
//!
//! - [`DirectoryClient`] - Opens bound, read-only connections
//! - [`DirectoryConnection`] - Paged, restartable search over one connection
//! - [`Sink`] - Idempotent upsert/delete consumer of [`ChangeEvent`]s
//!
//! ## Crate Organization
//!
//! - [`error`] - Error taxonomy with transient/permanent classification
//! - [`config`] - Connection, encryption and credential settings
//! - [`operation`] - Entries, search requests, pages, records, change events
//! - [`traits`] - Client, connection and sink traits
//! - [`resilience`] - Retry with exponential backoff
//!
//! [`DirectoryClient`]: traits::DirectoryClient
//! [`DirectoryConnection`]: traits::DirectoryConnection
//! [`Sink`]: traits::Sink
//! [`ChangeEvent`]: operation::ChangeEvent

pub mod config;
pub mod error;
pub mod operation;
pub mod resilience;
pub mod traits;

/// Prelude module for convenient imports.
///
/// ```
/// use dirsync_connector::prelude::*;
/// ```
pub mod prelude {
    // Error handling
    pub use crate::error::{SyncError, SyncResult};

    // Configuration
    pub use crate::config::{ConnectionConfig, ConnectionSettings, Credentials, EncryptionMode};

    // Operations
    pub use crate::operation::{
        AttributeValue, ChangeEvent, DirectoryEntry, FieldValue, MalformedEntry,
        NormalizedRecord, Page, RecordKind, ResumeToken, SearchRequest,
    };

    // Traits
    pub use crate::traits::{DirectoryClient, DirectoryConnection, ServerInfo, Sink};

    // Resilience
    pub use crate::resilience::{Retried, RetryConfig, RetryExecutor};
}

// Re-export async_trait for client and sink implementors
pub use async_trait::async_trait;
