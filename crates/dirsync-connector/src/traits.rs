//! Directory sync traits
//!
//! The seams between the reconciler and the outside world: a read-only
//! directory client and the sink that consumes change events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::error::SyncResult;
use crate::operation::{ChangeEvent, NormalizedRecord, Page, ResumeToken, SearchRequest};

/// Factory for bound, read-only directory connections.
///
/// A client is shared between concurrently running sync domains and must be
/// safe for concurrent use; the connections it hands out are not shared.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Get the display name for this client.
    fn display_name(&self) -> &str;

    /// Open and bind a new connection.
    ///
    /// # Errors
    /// * `Authentication` if the server rejects the credentials
    /// * `Connectivity` if the server is unreachable or the attempt times out
    /// * `Configuration` if `config` is invalid
    async fn connect(&self, config: &ConnectionConfig)
        -> SyncResult<Box<dyn DirectoryConnection>>;
}

/// A bound connection owned by exactly one sync run.
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Fetch one page of a search.
    ///
    /// Pass `None` for the first page and the previous page's `next` token
    /// afterwards. The same token may be passed again to retry a failed
    /// fetch.
    ///
    /// # Errors
    /// * `TransientRead` for failures worth retrying
    /// * `Protocol` when the response cannot be interpreted
    async fn fetch_page(
        &mut self,
        request: &SearchRequest,
        resume: Option<&ResumeToken>,
    ) -> SyncResult<Page>;

    /// Read server metadata (rootDSE).
    async fn server_info(&mut self) -> SyncResult<ServerInfo> {
        Ok(ServerInfo::default())
    }

    /// Release the connection. Must be safe to call more than once.
    async fn close(&mut self) -> SyncResult<()>;
}

/// Information read from the directory's rootDSE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// DNS hostname of the domain controller.
    pub dns_host_name: Option<String>,
    /// Default naming context (base DN).
    pub default_naming_context: Option<String>,
    /// Highest committed USN.
    pub highest_committed_usn: Option<String>,
    /// Supported LDAP versions.
    pub supported_ldap_versions: Vec<String>,
}

/// Downstream consumer of change events.
///
/// Both operations must be idempotent: the reconciler redelivers a batch
/// after a partial failure and a whole pass after a failed commit.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Get the display name for this sink.
    fn name(&self) -> &str;

    /// Create or replace the record stored under `key`.
    async fn upsert(&self, key: &str, record: &NormalizedRecord) -> SyncResult<()>;

    /// Remove the record stored under `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> SyncResult<()>;

    /// Apply a batch in order. Returns once every event is acknowledged.
    async fn deliver(&self, batch: &[ChangeEvent]) -> SyncResult<()> {
        for event in batch {
            match event {
                ChangeEvent::Upsert { key, record } => self.upsert(key, record).await?,
                ChangeEvent::Delete { key } => self.delete(key).await?,
            }
        }
        Ok(())
    }
}
