//! Directory connection configuration
//!
//! Transport, credential and timeout settings shared by directory clients.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Transport encryption used when talking to the directory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Plain LDAP, no TLS.
    None,
    /// Implicit TLS on the configured port without certificate verification.
    #[default]
    Simple,
    /// Plain connection upgraded with the StartTLS extended operation.
    #[serde(rename = "starttls")]
    StartTls,
    /// Implicit TLS (`ldaps://`) with certificate verification.
    Ldaps,
}

impl EncryptionMode {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::Simple => "simple",
            EncryptionMode::StartTls => "starttls",
            EncryptionMode::Ldaps => "ldaps",
        }
    }

    /// Port used when none is configured.
    pub fn default_port(&self) -> u16 {
        match self {
            EncryptionMode::Ldaps => 636,
            _ => 389,
        }
    }

    /// Whether the TLS session starts before the first LDAP message.
    pub fn is_implicit_tls(&self) -> bool {
        matches!(self, EncryptionMode::Simple | EncryptionMode::Ldaps)
    }

    /// Whether the server certificate is verified.
    pub fn verifies_certificate(&self) -> bool {
        matches!(self, EncryptionMode::StartTls | EncryptionMode::Ldaps)
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EncryptionMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "plain" => Ok(EncryptionMode::None),
            "simple" | "simple_tls" => Ok(EncryptionMode::Simple),
            "starttls" | "start_tls" => Ok(EncryptionMode::StartTls),
            "ldaps" => Ok(EncryptionMode::Ldaps),
            other => Err(SyncError::configuration(format!(
                "unknown encryption mode '{other}' (expected none, simple, starttls or ldaps)"
            ))),
        }
    }
}

/// Bind credentials for a directory server.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Bind principal (DN or `user@domain`).
    pub principal: String,
    /// Bind secret.
    #[serde(default, skip_serializing)]
    pub secret: String,
}

impl Credentials {
    /// Create new credentials.
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("secret", &"***REDACTED***")
            .finish()
    }
}

/// Timeouts applied to a directory connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Connection timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Per-operation timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl ConnectionSettings {
    /// Set the connection timeout.
    #[must_use]
    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, secs: u64) -> Self {
        self.read_timeout_secs = secs;
        self
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get read timeout as Duration.
    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.read_timeout_secs)
    }
}

/// Everything needed to open a bound connection to one directory server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port. Defaults to the encryption mode's standard port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Transport encryption.
    #[serde(default)]
    pub encryption: EncryptionMode,

    /// Bind credentials.
    pub credentials: Credentials,

    /// Timeouts.
    #[serde(default)]
    pub settings: ConnectionSettings,
}

impl ConnectionConfig {
    /// Create a connection config with the default encryption mode.
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: None,
            encryption: EncryptionMode::default(),
            credentials,
            settings: ConnectionSettings::default(),
        }
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the encryption mode.
    #[must_use]
    pub fn with_encryption(mut self, encryption: EncryptionMode) -> Self {
        self.encryption = encryption;
        self
    }

    /// Set the timeouts.
    #[must_use]
    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Effective port.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.encryption.default_port())
    }

    /// Server URL for the configured transport.
    pub fn url(&self) -> String {
        let scheme = if self.encryption.is_implicit_tls() {
            "ldaps"
        } else {
            "ldap"
        };
        format!("{}://{}:{}", scheme, self.host, self.effective_port())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.host.trim().is_empty() {
            return Err(SyncError::configuration("host is required"));
        }

        if self.port == Some(0) {
            return Err(SyncError::configuration("port must be non-zero"));
        }

        if self.credentials.principal.trim().is_empty() {
            return Err(SyncError::configuration("bind principal is required"));
        }

        // An empty secret turns a simple bind into an unauthenticated bind.
        if self.credentials.secret.is_empty() {
            return Err(SyncError::configuration("bind secret is required"));
        }

        if self.settings.connection_timeout_secs == 0 {
            return Err(SyncError::configuration(
                "connection timeout must be at least one second",
            ));
        }

        Ok(())
    }
}
