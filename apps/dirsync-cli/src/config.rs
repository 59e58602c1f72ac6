//! Domain configuration from the environment
//!
//! Each domain reads `AD_<DOMAIN>_*` variables, where `<DOMAIN>` is the
//! domain id upper-cased with every other character replaced by `_`
//! (`uk-halle` reads `AD_UK_HALLE_HOST`).

use dirsync_connector::config::{Credentials, EncryptionMode};
use dirsync_connector_ldap::{base_dn_for_domain, LdapConfig};
use dirsync_engine::domain::{validate_domain_id, DomainConfig};
use dirsync_engine::normalize::NormalizerConfig;

use crate::error::{CliError, CliResult};

/// Port used when `AD_<DOMAIN>_PORT` is unset.
pub const DEFAULT_PORT: u16 = 389;

/// A domain's settings as read from the environment.
#[derive(Debug, Clone)]
pub struct DomainSource {
    /// Domain id.
    pub id: String,
    /// LDAP source; an empty `base_dn` is read from the rootDSE when the
    /// domain's run connects.
    pub ldap: LdapConfig,
    /// Key attribute override.
    pub key_attribute: Option<String>,
}

impl DomainSource {
    /// Build the engine's domain definition.
    pub fn into_domain_config(self) -> CliResult<DomainConfig> {
        self.ldap.validate()?;

        let mut normalizer = NormalizerConfig::default();
        if let Some(key) = self.key_attribute {
            normalizer = normalizer.with_key_attribute(key);
        }

        let search = self.ldap.search_request();
        let domain =
            DomainConfig::new(self.id, self.ldap.connection, search).with_normalizer(normalizer);
        domain.validate()?;
        Ok(domain)
    }
}

/// Environment variable prefix for a domain.
pub fn env_prefix(domain: &str) -> String {
    let name: String = domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("AD_{}", name)
}

/// Load a domain from the process environment.
pub fn load_domain_from_env(domain: &str) -> CliResult<DomainSource> {
    load_domain(domain, |name| std::env::var(name).ok())
}

/// Load a domain using `lookup` to read variables.
pub fn load_domain<F>(domain: &str, lookup: F) -> CliResult<DomainSource>
where
    F: Fn(&str) -> Option<String>,
{
    validate_domain_id(domain)?;
    let prefix = env_prefix(domain);

    let var = |suffix: &str| -> Option<String> {
        lookup(&format!("{}_{}", prefix, suffix)).filter(|v| !v.trim().is_empty())
    };
    let required = |suffix: &str| -> CliResult<String> {
        var(suffix).ok_or_else(|| CliError::MissingEnv(format!("{}_{}", prefix, suffix)))
    };

    let host = required("HOST")?;
    let user = required("USER")?;
    let password = required("PASSWORD")?;

    let encryption = match var("ENCRYPTION") {
        Some(value) => value.parse::<EncryptionMode>()?,
        None => EncryptionMode::Simple,
    };
    let port = match var("PORT") {
        Some(value) => parse_number::<u16>(&prefix, "PORT", &value)?,
        None => DEFAULT_PORT,
    };

    // Dotted ids are DNS names; anything else is discovered from the rootDSE.
    let base_dn = var("BASE_DN").unwrap_or_else(|| {
        if domain.contains('.') {
            base_dn_for_domain(domain)
        } else {
            String::new()
        }
    });

    let mut ldap = LdapConfig::new(host, base_dn, Credentials::new(user, password))
        .with_encryption(encryption)
        .with_port(port);
    if let Some(filter) = var("FILTER") {
        ldap = ldap.with_filter(filter);
    }
    if let Some(value) = var("PAGE_SIZE") {
        ldap = ldap.with_page_size(parse_number::<u32>(&prefix, "PAGE_SIZE", &value)?);
    }
    if let Some(attribute) = var("CHANGE_ATTRIBUTE") {
        ldap = ldap.with_change_attribute(attribute);
    }

    Ok(DomainSource {
        id: domain.to_string(),
        ldap,
        key_attribute: var("KEY_ATTRIBUTE"),
    })
}

fn parse_number<T: std::str::FromStr>(prefix: &str, suffix: &str, value: &str) -> CliResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        CliError::Config(format!(
            "{}_{} must be a number, got '{}'",
            prefix, suffix, value
        ))
    })
}
