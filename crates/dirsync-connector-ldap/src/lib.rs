//! # LDAP Directory Client
//!
//! Read-only access to LDAP v3 servers and Microsoft Active Directory for
//! directory synchronization.
//!
//! ## Features
//!
//! - Simple bind over plain LDAP, implicit TLS, StartTLS or verified LDAPS
//! - RFC 2696 paged subtree searches, resumable from any page
//! - Binary attributes (`objectGUID`, `objectSid`) preserved as raw bytes
//! - rootDSE probe for connectivity checks
//!
//! ## Example
//!
//! ```ignore
//! use dirsync_connector::prelude::*;
//! use dirsync_connector_ldap::{LdapConfig, LdapDirectoryClient};
//!
//! let config = LdapConfig::new(
//!     "dc01.example.com",
//!     "DC=example,DC=com",
//!     Credentials::new("svc-sync@example.com", "secret"),
//! )
//! .with_encryption(EncryptionMode::StartTls);
//!
//! let client = LdapDirectoryClient::new();
//! let mut conn = client.connect(&config.connection).await?;
//! let page = conn.fetch_page(&config.search_request(), None).await?;
//! conn.close().await?;
//! ```

pub mod config;
pub mod connector;

pub use config::{base_dn_for_domain, LdapConfig, MAX_PAGE_SIZE};
pub use connector::{LdapConnection, LdapDirectoryClient};
