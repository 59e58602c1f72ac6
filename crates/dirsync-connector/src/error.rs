//! Directory sync error types
//!
//! Error definitions with transient/permanent classification for retry logic.

use thiserror::Error;

/// Error that can occur while reading from a directory or delivering changes.
#[derive(Debug, Error)]
pub enum SyncError {
    // Configuration errors (fatal, never retried)
    /// Missing or invalid connection parameters.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    // Authentication errors (fatal for the run)
    /// The directory rejected the bind credentials.
    #[error("authentication failed for {principal}")]
    Authentication { principal: String },

    // Connection errors (transient)
    /// Failed to reach the directory server.
    #[error("connectivity error: {message}")]
    Connectivity {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A page fetch failed for a reason that may resolve itself.
    #[error("transient read error: {message}")]
    TransientRead {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Data errors (per page or per entry)
    /// The server returned a response that could not be interpreted.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A directory entry could not be mapped to a record.
    #[error("cannot normalize entry '{dn}': {message}")]
    Normalization {
        dn: String,
        /// Record key, when it could still be derived from the entry.
        key: Option<String>,
        message: String,
    },

    // Delivery errors
    /// The sink did not acknowledge a change.
    #[error("sink delivery failed: {message}")]
    SinkDelivery {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Persisted state errors
    /// Reading or committing the sync cursor failed.
    #[error("sync state error: {message}")]
    State {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The run was cancelled by the operator or a timeout.
    #[error("run cancelled: {reason}")]
    Cancelled { reason: String },
}

impl SyncError {
    /// Check if this error is transient and the operation should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity { .. }
                | SyncError::TransientRead { .. }
                | SyncError::SinkDelivery { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Whether the error only affects a single entry and the run may continue.
    pub fn is_entry_scoped(&self) -> bool {
        matches!(self, SyncError::Normalization { .. })
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Configuration { .. } => "INVALID_CONFIG",
            SyncError::Authentication { .. } => "AUTH_FAILED",
            SyncError::Connectivity { .. } => "CONNECTIVITY",
            SyncError::TransientRead { .. } => "TRANSIENT_READ",
            SyncError::Protocol { .. } => "PROTOCOL_ERROR",
            SyncError::Normalization { .. } => "NORMALIZATION_ERROR",
            SyncError::SinkDelivery { .. } => "SINK_DELIVERY",
            SyncError::State { .. } => "STATE_ERROR",
            SyncError::Cancelled { .. } => "CANCELLED",
        }
    }

    // Convenience constructors

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration {
            message: message.into(),
        }
    }

    /// Create a connectivity error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        SyncError::Connectivity {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connectivity error with source.
    pub fn connectivity_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Connectivity {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transient read error.
    pub fn transient_read(message: impl Into<String>) -> Self {
        SyncError::TransientRead {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient read error with source.
    pub fn transient_read_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::TransientRead {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol {
            message: message.into(),
        }
    }

    /// Create a normalization error for the entry with the given DN.
    pub fn normalization(dn: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Normalization {
            dn: dn.into(),
            key: None,
            message: message.into(),
        }
    }

    /// Create a sink delivery error.
    pub fn sink_delivery(message: impl Into<String>) -> Self {
        SyncError::SinkDelivery {
            message: message.into(),
            source: None,
        }
    }

    /// Create a sink delivery error with source.
    pub fn sink_delivery_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::SinkDelivery {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        SyncError::State {
            message: message.into(),
            source: None,
        }
    }

    /// Create a state error with source.
    pub fn state_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::State {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        SyncError::Cancelled {
            reason: reason.into(),
        }
    }
}

/// Result type for directory sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let transient_errors = vec![
            SyncError::connectivity("test"),
            SyncError::transient_read("test"),
            SyncError::sink_delivery("test"),
        ];

        for err in transient_errors {
            assert!(
                err.is_transient(),
                "Expected {} to be transient",
                err.error_code()
            );
            assert!(!err.is_permanent());
        }
    }

    #[test]
    fn test_permanent_errors() {
        let permanent_errors = vec![
            SyncError::configuration("missing host"),
            SyncError::Authentication {
                principal: "svc-sync".to_string(),
            },
            SyncError::protocol("bad cookie"),
            SyncError::normalization("CN=x", "no objectClass"),
            SyncError::state("corrupt"),
            SyncError::cancelled("operator"),
        ];

        for err in permanent_errors {
            assert!(
                err.is_permanent(),
                "Expected {} to be permanent",
                err.error_code()
            );
        }
    }

    #[test]
    fn test_entry_scoped() {
        assert!(SyncError::normalization("CN=x", "bad").is_entry_scoped());
        assert!(!SyncError::protocol("bad page").is_entry_scoped());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Authentication {
            principal: "CN=svc,DC=example,DC=com".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "authentication failed for CN=svc,DC=example,DC=com"
        );

        let err = SyncError::normalization("CN=Broken,DC=example,DC=com", "missing objectClass");
        assert_eq!(
            err.to_string(),
            "cannot normalize entry 'CN=Broken,DC=example,DC=com': missing objectClass"
        );
    }

    #[test]
    fn test_error_with_source() {
        let source_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = SyncError::connectivity_with_source("failed", source_err);

        assert!(err.is_transient());
        assert_eq!(err.error_code(), "CONNECTIVITY");
        assert!(std::error::Error::source(&err).is_some());
    }
}
