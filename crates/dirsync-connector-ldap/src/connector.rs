//! LDAP directory client
//!
//! Read-only [`DirectoryClient`] on top of `ldap3`, using the RFC 2696 paged
//! results control so a search can be resumed page by page.

use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, PagedResults};
use ldap3::result::LdapError;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, ResultEntry, Scope, SearchEntry, SearchResult};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use dirsync_connector::config::{ConnectionConfig, EncryptionMode};
use dirsync_connector::error::{SyncError, SyncResult};
use dirsync_connector::operation::{
    parse_generalized_time, AttributeValue, DirectoryEntry, MalformedEntry, Page, ResumeToken,
    SearchRequest,
};
use dirsync_connector::traits::{DirectoryClient, DirectoryConnection, ServerInfo};

/// LDAP result codes the client distinguishes.
mod rc {
    pub const SUCCESS: u32 = 0;
    pub const TIME_LIMIT_EXCEEDED: u32 = 3;
    pub const SIZE_LIMIT_EXCEEDED: u32 = 4;
    pub const REFERRAL: u32 = 10;
    pub const INVALID_CREDENTIALS: u32 = 49;
    pub const BUSY: u32 = 51;
    pub const UNAVAILABLE: u32 = 52;
}

/// Directory client for LDAP v3 servers and Active Directory.
#[derive(Debug, Clone)]
pub struct LdapDirectoryClient {
    display_name: String,
}

impl Default for LdapDirectoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LdapDirectoryClient {
    /// Create a new client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            display_name: "LDAP".to_string(),
        }
    }

    fn conn_settings(config: &ConnectionConfig) -> LdapConnSettings {
        let settings =
            LdapConnSettings::new().set_conn_timeout(config.settings.connection_timeout());

        match config.encryption {
            EncryptionMode::None => settings,
            // Implicit TLS without certificate verification.
            EncryptionMode::Simple => settings.set_no_tls_verify(true),
            EncryptionMode::StartTls => settings.set_starttls(true),
            EncryptionMode::Ldaps => settings,
        }
    }
}

#[async_trait]
impl DirectoryClient for LdapDirectoryClient {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    #[instrument(skip(self, config), fields(host = %config.host, encryption = %config.encryption))]
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> SyncResult<Box<dyn DirectoryConnection>> {
        config.validate()?;

        let url = config.url();
        debug!(url = %url, "Connecting to LDAP server");

        let (conn, mut ldap) = LdapConnAsync::with_settings(Self::conn_settings(config), &url)
            .await
            .map_err(|e| {
                SyncError::connectivity_with_source(
                    format!("failed to connect to LDAP server at {}", url),
                    e,
                )
            })?;

        // The driver owns the socket; it stops once every Ldap handle is gone.
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let principal = &config.credentials.principal;
        debug!(principal = %principal, "Performing LDAP bind");

        let result = ldap
            .with_timeout(config.settings.connection_timeout())
            .simple_bind(principal, &config.credentials.secret)
            .await
            .map_err(|e| {
                SyncError::connectivity_with_source(format!("LDAP bind failed for {}", principal), e)
            })?;

        match result.rc {
            rc::SUCCESS => {}
            rc::INVALID_CREDENTIALS => {
                return Err(SyncError::Authentication {
                    principal: principal.clone(),
                })
            }
            rc::BUSY | rc::UNAVAILABLE => {
                return Err(SyncError::connectivity(format!(
                    "LDAP server unavailable during bind (code {}): {}",
                    result.rc, result.text
                )))
            }
            code => {
                return Err(SyncError::protocol(format!(
                    "LDAP bind failed with code {}: {}",
                    code, result.text
                )))
            }
        }

        info!(host = %config.host, "LDAP connection established");

        Ok(Box::new(LdapConnection {
            ldap,
            read_timeout: config.settings.read_timeout(),
            closed: false,
        }))
    }
}

/// A bound LDAP connection serving one sync run.
pub struct LdapConnection {
    ldap: Ldap,
    read_timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("read_timeout", &self.read_timeout)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    #[instrument(skip(self, request, resume), fields(base_dn = %request.base_dn, resumed = resume.is_some()))]
    async fn fetch_page(
        &mut self,
        request: &SearchRequest,
        resume: Option<&ResumeToken>,
    ) -> SyncResult<Page> {
        if self.closed {
            return Err(SyncError::connectivity("connection already closed"));
        }

        let control = PagedResults {
            size: i32::try_from(request.page_size).unwrap_or(i32::MAX),
            cookie: resume.map(|token| token.0.clone()).unwrap_or_default(),
        };
        let attributes: Vec<&str> = request.attributes.iter().map(String::as_str).collect();

        let SearchResult(raw_entries, result) = self
            .ldap
            .with_timeout(self.read_timeout)
            .with_controls(control)
            .search(&request.base_dn, Scope::Subtree, &request.filter, attributes)
            .await
            .map_err(map_ldap_error)?;

        check_search_result(result.rc, &result.text)?;

        let next = result.ctrls.iter().find_map(|ctrl| match ctrl {
            Control(Some(ControlType::PagedResults), raw) => {
                let paged: PagedResults = raw.parse();
                Some(ResumeToken(paged.cookie))
            }
            _ => None,
        });
        // An empty cookie (or no paging control at all) ends the search.
        let next = next.filter(|token| !token.is_empty());

        let mut page = Page::new(Vec::with_capacity(raw_entries.len()), next);
        for raw in raw_entries {
            if raw.is_ref() {
                debug!("Ignoring search continuation reference");
                continue;
            }
            match convert_entry(raw, &request.change_attribute) {
                Ok(entry) => page.entries.push(entry),
                Err(malformed) => {
                    warn!(dn = %malformed.dn, error = %malformed.message, "Malformed entry");
                    page.malformed.push(malformed);
                }
            }
        }

        debug!(
            entries = page.entries.len(),
            malformed = page.malformed.len(),
            has_more = page.has_more(),
            "Fetched page"
        );
        Ok(page)
    }

    async fn server_info(&mut self) -> SyncResult<ServerInfo> {
        let SearchResult(entries, result) = self
            .ldap
            .with_timeout(self.read_timeout)
            .search(
                "",
                Scope::Base,
                "(objectClass=*)",
                vec![
                    "dnsHostName",
                    "defaultNamingContext",
                    "highestCommittedUSN",
                    "supportedLDAPVersion",
                ],
            )
            .await
            .map_err(map_ldap_error)?;

        check_search_result(result.rc, &result.text)?;

        let entry = entries
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .ok_or_else(|| SyncError::protocol("rootDSE returned no entry"))?;

        let first = |name: &str| {
            entry
                .attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.first().cloned())
        };

        Ok(ServerInfo {
            dns_host_name: first("dnsHostName"),
            default_naming_context: first("defaultNamingContext"),
            highest_committed_usn: first("highestCommittedUSN"),
            supported_ldap_versions: entry
                .attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("supportedLDAPVersion"))
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
        })
    }

    async fn close(&mut self) -> SyncResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.ldap.unbind().await {
            warn!(error = %e, "Error during LDAP unbind");
        }
        debug!("LDAP connection closed");
        Ok(())
    }
}

/// Map an `ldap3` error to the sync error taxonomy.
fn map_ldap_error(error: LdapError) -> SyncError {
    match error {
        LdapError::Io { .. } | LdapError::Timeout { .. } => {
            SyncError::transient_read_with_source("LDAP search interrupted", error)
        }
        LdapError::LdapResult { result } => {
            match check_search_result(result.rc, &result.text) {
                Err(e) => e,
                Ok(()) => SyncError::protocol(format!(
                    "unexpected LDAP result code {}: {}",
                    result.rc, result.text
                )),
            }
        }
        other => SyncError::protocol(format!("LDAP search failed: {}", other)),
    }
}

/// Classify the result code of a search response.
///
/// `sizeLimitExceeded` is accepted: the server returned a short page and the
/// paging cookie decides whether more follow.
fn check_search_result(code: u32, text: &str) -> SyncResult<()> {
    match code {
        rc::SUCCESS | rc::SIZE_LIMIT_EXCEEDED => Ok(()),
        rc::TIME_LIMIT_EXCEEDED | rc::BUSY | rc::UNAVAILABLE => Err(SyncError::transient_read(
            format!("LDAP search failed with code {}: {}", code, text),
        )),
        rc::REFERRAL => Err(SyncError::protocol(format!(
            "server returned a referral, which is not followed: {}",
            text
        ))),
        _ => Err(SyncError::protocol(format!(
            "LDAP search failed with code {}: {}",
            code, text
        ))),
    }
}

/// Decode one search result into a [`DirectoryEntry`].
fn convert_entry(raw: ResultEntry, change_attribute: &str) -> Result<DirectoryEntry, MalformedEntry> {
    entry_from_search(SearchEntry::construct(raw), change_attribute)
}

fn entry_from_search(
    entry: SearchEntry,
    change_attribute: &str,
) -> Result<DirectoryEntry, MalformedEntry> {
    if entry.dn.trim().is_empty() {
        return Err(MalformedEntry {
            dn: String::new(),
            message: "entry has no distinguished name".to_string(),
        });
    }

    let mut attributes: BTreeMap<String, Vec<AttributeValue>> = BTreeMap::new();
    let mut object_classes = Vec::new();
    let mut when_changed = None;

    for (name, values) in entry.attrs {
        if name.eq_ignore_ascii_case("objectClass") {
            object_classes.extend(values.iter().cloned());
        }
        if name.eq_ignore_ascii_case(change_attribute) {
            if let Some(raw) = values.first() {
                when_changed = Some(parse_generalized_time(raw).ok_or_else(|| MalformedEntry {
                    dn: entry.dn.clone(),
                    message: format!("{} value '{}' is not a GeneralizedTime", name, raw),
                })?);
            }
        }
        attributes
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(AttributeValue::Text));
    }

    // Non-UTF-8 values (objectGUID, objectSid, thumbnailPhoto) arrive here.
    for (name, values) in entry.bin_attrs {
        attributes
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(AttributeValue::Binary));
    }

    Ok(DirectoryEntry {
        distinguished_name: entry.dn,
        object_classes,
        attributes,
        when_changed,
    })
}
