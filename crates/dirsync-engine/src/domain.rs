//! Sync domain definition.

use serde::{Deserialize, Serialize};

use dirsync_connector::config::ConnectionConfig;
use dirsync_connector::error::{SyncError, SyncResult};
use dirsync_connector::operation::SearchRequest;

use crate::normalize::NormalizerConfig;

/// One independently synchronized directory (e.g. an AD domain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain identifier; names the persisted cursor.
    pub id: String,
    /// How to reach and bind to the directory.
    pub connection: ConnectionConfig,
    /// Full-scan search. Its change attribute feeds the watermark, and an
    /// empty base DN is read from the rootDSE when the run connects.
    pub search: SearchRequest,
    /// Entry normalization.
    #[serde(default)]
    pub normalizer: NormalizerConfig,
}

impl DomainConfig {
    /// Create a domain with default normalization.
    pub fn new(id: impl Into<String>, connection: ConnectionConfig, search: SearchRequest) -> Self {
        Self {
            id: id.into(),
            connection,
            search,
            normalizer: NormalizerConfig::default(),
        }
    }

    /// Set the normalizer configuration.
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Set the change-tracking attribute.
    pub fn with_change_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.search.change_attribute = attribute.into();
        self
    }

    /// Validate the domain definition.
    pub fn validate(&self) -> SyncResult<()> {
        validate_domain_id(&self.id)?;
        self.connection.validate()?;
        self.normalizer.validate()?;

        if self.search.change_attribute.trim().is_empty() {
            return Err(SyncError::configuration(format!(
                "domain '{}': change attribute is required",
                self.id
            )));
        }
        if self.search.filter.trim().is_empty() {
            return Err(SyncError::configuration(format!(
                "domain '{}': search filter is required",
                self.id
            )));
        }
        if self.search.page_size == 0 {
            return Err(SyncError::configuration(format!(
                "domain '{}': page size must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// Check that a domain identifier is non-empty and safe as a file name.
pub fn validate_domain_id(id: &str) -> SyncResult<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(SyncError::configuration(format!(
            "invalid domain id '{}': use letters, digits, '.', '_' or '-'",
            id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_connector::config::Credentials;

    fn domain(id: &str) -> DomainConfig {
        DomainConfig::new(
            id,
            ConnectionConfig::new("dc01.example.com", Credentials::new("svc", "secret")),
            SearchRequest::new("DC=example,DC=com", "(objectClass=user)", 500),
        )
    }

    #[test]
    fn test_domain_id_validation() {
        assert!(validate_domain_id("uk-halle").is_ok());
        assert!(validate_domain_id("corp.example_2").is_ok());
        assert!(validate_domain_id("").is_err());
        assert!(validate_domain_id("..").is_err());
        assert!(validate_domain_id("../etc").is_err());
        assert!(validate_domain_id("a/b").is_err());
        assert!(validate_domain_id("with space").is_err());
    }

    #[test]
    fn test_domain_validation() {
        assert!(domain("corp").validate().is_ok());
        assert!(domain("bad/id").validate().is_err());

        let mut config = domain("corp");
        config.search.page_size = 0;
        assert!(matches!(
            config.validate(),
            Err(SyncError::Configuration { .. })
        ));
    }

    #[test]
    fn test_default_change_attribute() {
        assert_eq!(domain("corp").search.change_attribute, "whenChanged");
        assert_eq!(
            domain("corp")
                .with_change_attribute("modifyTimestamp")
                .search
                .change_attribute,
            "modifyTimestamp"
        );
        assert!(domain("corp")
            .with_change_attribute("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_empty_base_dn_is_allowed() {
        let mut config = domain("corp");
        config.search.base_dn = String::new();
        assert!(config.validate().is_ok());
    }
}
