//! CLI error types and exit codes

use thiserror::Error;

use dirsync_connector::error::SyncError;

/// Exit codes for the CLI
/// - 0: Success
/// - 1: A sync run failed or was cancelled
/// - 2: Configuration error
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable {0}")]
    MissingEnv(String),

    #[error("{failed} of {total} domain run(s) did not succeed")]
    RunFailed { failed: usize, total: usize },

    #[error("{0}")]
    Sync(SyncError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::MissingEnv(_) => 2,
            CliError::Sync(SyncError::Configuration { .. }) => 2,
            CliError::RunFailed { .. } | CliError::Sync(_) | CliError::Io(_) => 1,
        }
    }

    /// Print the error to stderr
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {}", self);
        } else {
            eprintln!("Error: {}", self);
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {}", suggestion);
            } else {
                eprintln!("\nSuggestion: {}", suggestion);
            }
        }
    }

    /// Get a suggested action for this error
    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::MissingEnv(_) => {
                Some("Export AD_<DOMAIN>_HOST, AD_<DOMAIN>_USER and AD_<DOMAIN>_PASSWORD.")
            }
            CliError::Sync(SyncError::Authentication { .. }) => {
                Some("Check the bind user and password of the domain.")
            }
            CliError::Sync(SyncError::Connectivity { .. }) => {
                Some("Check host, port and encryption mode, then run 'dirsync check'.")
            }
            CliError::RunFailed { .. } => Some("Re-run with -v for details; state was not committed."),
            _ => None,
        }
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        CliError::Sync(e)
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Io(format!("JSON error: {}", e))
    }
}
