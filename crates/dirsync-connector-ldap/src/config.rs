//! LDAP sync source configuration
//!
//! Where to connect, what to search and how to page for one sync domain.

use serde::{Deserialize, Serialize};

use dirsync_connector::config::{ConnectionConfig, Credentials, EncryptionMode};
use dirsync_connector::error::{SyncError, SyncResult};
use dirsync_connector::operation::{SearchRequest, DEFAULT_CHANGE_ATTRIBUTE};

/// Largest page size accepted; Active Directory's MaxPageSize defaults to 1000
/// and the server silently caps larger requests.
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// Configuration of one LDAP/Active Directory sync source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Connection and bind settings.
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Search base DN (e.g., "DC=example,DC=com"). When empty, the server's
    /// default naming context is searched.
    #[serde(default)]
    pub base_dn: String,

    /// LDAP filter selecting the entries to synchronize.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Page size for search operations.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Attributes to request; empty means all user attributes.
    #[serde(default)]
    pub attributes: Vec<String>,

    /// Attribute used for incremental change tracking.
    #[serde(default = "default_change_attribute")]
    pub change_attribute: String,
}

fn default_filter() -> String {
    "(|(&(objectClass=user)(objectCategory=person))(objectClass=group))".to_string()
}

fn default_page_size() -> u32 {
    500
}

fn default_change_attribute() -> String {
    DEFAULT_CHANGE_ATTRIBUTE.to_string()
}

impl LdapConfig {
    /// Create a new config with the default filter and page size.
    pub fn new(
        host: impl Into<String>,
        base_dn: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            connection: ConnectionConfig::new(host, credentials),
            base_dn: base_dn.into(),
            filter: default_filter(),
            page_size: default_page_size(),
            attributes: Vec::new(),
            change_attribute: default_change_attribute(),
        }
    }

    /// Create a config for an AD domain, deriving the base DN from its DNS name.
    #[must_use]
    pub fn from_domain(domain: &str, host: &str, credentials: Credentials) -> Self {
        Self::new(host, base_dn_for_domain(domain), credentials)
    }

    /// Set the encryption mode.
    #[must_use]
    pub fn with_encryption(mut self, encryption: EncryptionMode) -> Self {
        self.connection.encryption = encryption;
        self
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.connection.port = Some(port);
        self
    }

    /// Set the search filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Restrict the requested attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set the attribute compared against the watermark.
    #[must_use]
    pub fn with_change_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.change_attribute = attribute.into();
        self
    }

    /// Build the full-scan search request for this source.
    #[must_use]
    pub fn search_request(&self) -> SearchRequest {
        let request = SearchRequest::new(&self.base_dn, &self.filter, self.page_size)
            .with_change_attribute(&self.change_attribute);
        if self.attributes.is_empty() {
            return request;
        }

        // The change attribute drives the watermark and must always be returned.
        let mut attributes = self.attributes.clone();
        if !attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&self.change_attribute))
        {
            attributes.push(self.change_attribute.clone());
        }
        request.with_attributes(attributes)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        self.connection.validate()?;

        if !is_balanced_filter(&self.filter) {
            return Err(SyncError::configuration(format!(
                "filter '{}' must be a parenthesized LDAP filter",
                self.filter
            )));
        }

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::configuration(format!(
                "page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }

        if self.change_attribute.trim().is_empty() {
            return Err(SyncError::configuration("change_attribute is required"));
        }

        Ok(())
    }
}

/// Convert `example.com` to `dc=example,dc=com`.
pub fn base_dn_for_domain(domain: &str) -> String {
    domain
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| format!("dc={part}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Check that a filter is wrapped in parentheses and they balance.
fn is_balanced_filter(filter: &str) -> bool {
    let filter = filter.trim();
    if !filter.starts_with('(') || !filter.ends_with(')') {
        return false;
    }

    let mut depth: i32 = 0;
    let mut escaped = false;
    for ch in filter.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LdapConfig {
        LdapConfig::new(
            "dc01.example.com",
            "DC=example,DC=com",
            Credentials::new("svc-sync@example.com", "secret"),
        )
    }

    #[test]
    fn test_ldap_config_defaults() {
        let config = sample();
        assert_eq!(config.page_size, 500);
        assert_eq!(config.change_attribute, "whenChanged");
        assert_eq!(config.connection.effective_port(), 389);
        assert_eq!(config.connection.encryption, EncryptionMode::Simple);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_domain_derives_base_dn() {
        let config = LdapConfig::from_domain(
            "uk-halle.example.org",
            "dc01.uk-halle.example.org",
            Credentials::new("svc", "secret"),
        );
        assert_eq!(config.base_dn, "dc=uk-halle,dc=example,dc=org");
        assert_eq!(config.connection.host, "dc01.uk-halle.example.org");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(sample().with_page_size(0).validate().is_err());
        assert!(sample().with_page_size(MAX_PAGE_SIZE + 1).validate().is_err());
        assert!(sample().with_filter("objectClass=user").validate().is_err());
        assert!(sample().with_filter("(objectClass=user").validate().is_err());
        assert!(sample().with_filter("(cn=a\\29b)").validate().is_ok());

        let mut config = sample();
        config.change_attribute = " ".to_string();
        assert!(matches!(
            config.validate(),
            Err(SyncError::Configuration { .. })
        ));
    }

    #[test]
    fn test_empty_base_dn_is_discovered_later() {
        let mut config = sample();
        config.base_dn = String::new();
        assert!(config.validate().is_ok());
        assert!(config.search_request().base_dn.is_empty());
    }

    #[test]
    fn test_search_request_carries_change_attribute() {
        let mut config = sample().with_attributes(vec!["cn".to_string()]);
        config.change_attribute = "modifyTimestamp".to_string();

        let request = config.search_request();
        assert_eq!(request.change_attribute, "modifyTimestamp");
        assert_eq!(
            request.attributes,
            vec!["cn".to_string(), "modifyTimestamp".to_string()]
        );
    }

    #[test]
    fn test_search_request_all_attributes() {
        let request = sample().search_request();
        assert_eq!(request.base_dn, "DC=example,DC=com");
        assert_eq!(request.page_size, 500);
        assert_eq!(request.attributes, vec!["*".to_string()]);
    }

    #[test]
    fn test_search_request_adds_change_attribute() {
        let request = sample()
            .with_attributes(vec!["cn".to_string(), "mail".to_string()])
            .search_request();
        assert_eq!(
            request.attributes,
            vec![
                "cn".to_string(),
                "mail".to_string(),
                "whenChanged".to_string()
            ]
        );
    }

    #[test]
    fn test_ldap_config_serialization_hides_secret() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["host"], "dc01.example.com");
        assert_eq!(json["credentials"]["principal"], "svc-sync@example.com");
        assert!(json["credentials"].get("secret").is_none());
    }
}
