//! Sync command - reconcile directory domains into per-domain output folders

use clap::Args;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use dirsync_connector::resilience::RetryConfig;
use dirsync_connector::traits::DirectoryClient;
use dirsync_connector_ldap::LdapDirectoryClient;
use dirsync_engine::reconcile::{ReconcileOptions, DEFAULT_BATCH_SIZE};
use dirsync_engine::runner::SyncRunner;
use dirsync_engine::state::FileStateStore;
use dirsync_engine::summary::{RunMode, RunSummary};
use dirsync_engine::CancellationToken;

use crate::config::{load_domain_from_env, DomainSource};
use crate::error::{CliError, CliResult};
use crate::output::{write_summaries, OutputFormat};
use crate::sink::JsonFileSink;

/// Arguments for the sync command
#[derive(Args, Debug, Clone)]
#[command(about = "Synchronize directory domains")]
pub struct SyncArgs {
    /// Domain to synchronize (repeatable)
    #[arg(long = "domain", short = 'd', required = true)]
    pub domains: Vec<String>,

    /// Run a full pass even when a watermark is stored
    #[arg(long)]
    pub full: bool,

    /// Compute changes without delivering or committing them
    #[arg(long)]
    pub dry_run: bool,

    /// Directory holding per-domain sync state
    #[arg(long, env = "DIRSYNC_STATE_DIR", default_value = "state")]
    pub state_dir: PathBuf,

    /// Directory receiving one folder of JSON records per domain
    #[arg(long, env = "DIRSYNC_OUTPUT_DIR", default_value = "out")]
    pub output_dir: PathBuf,

    /// Abort runs that take longer than this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Records per sink batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Retries after a transient bind, read or delivery failure
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl SyncArgs {
    fn mode(&self) -> RunMode {
        if self.full {
            RunMode::Full
        } else {
            RunMode::Incremental
        }
    }

    fn options(&self) -> CliResult<ReconcileOptions> {
        let retry = RetryConfig::default().with_max_retries(self.max_retries);
        let mut options = ReconcileOptions::default()
            .with_batch_size(self.batch_size)
            .with_page_retry(retry.clone())
            .with_sink_retry(retry)
            .with_dry_run(self.dry_run);
        if let Some(secs) = self.timeout_secs {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        options.validate()?;
        Ok(options)
    }
}

/// Execute the sync command
pub async fn execute(args: SyncArgs) -> CliResult<()> {
    let sources = args
        .domains
        .iter()
        .map(String::as_str)
        .map(load_domain_from_env)
        .collect::<CliResult<Vec<_>>>()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling runs");
            on_signal.cancel();
        }
    });

    let client: Arc<dyn DirectoryClient> = Arc::new(LdapDirectoryClient::new());
    let summaries = run_sync(client, sources, &args, &cancel).await?;

    write_summaries(&mut std::io::stdout().lock(), &summaries, args.format)?;
    std::io::stdout().flush()?;

    check_outcome(&summaries)
}

/// Run every domain and return the summaries in argument order.
///
/// A domain that cannot be reached fails on its own; the others still run.
pub async fn run_sync(
    client: Arc<dyn DirectoryClient>,
    sources: Vec<DomainSource>,
    args: &SyncArgs,
    cancel: &CancellationToken,
) -> CliResult<Vec<RunSummary>> {
    let options = args.options()?;

    let mut seen = BTreeSet::new();
    for source in &sources {
        if !seen.insert(source.id.as_str()) {
            return Err(CliError::Config(format!(
                "domain '{}' given more than once",
                source.id
            )));
        }
    }

    let state = Arc::new(FileStateStore::new(&args.state_dir));
    let mut runner = SyncRunner::new(client, state).with_options(options);

    for source in sources {
        let domain = source.into_domain_config()?;
        let sink = Arc::new(JsonFileSink::new(args.output_dir.join(&domain.id)));
        runner.add_job(domain, args.mode(), sink);
    }

    info!(
        domains = runner.job_count(),
        dry_run = args.dry_run,
        full = args.full,
        "Starting sync"
    );
    Ok(runner.run(cancel).await)
}

/// Map run outcomes to the command result.
pub fn check_outcome(summaries: &[RunSummary]) -> CliResult<()> {
    let failed = summaries.iter().filter(|s| !s.is_success()).count();
    if failed > 0 {
        return Err(CliError::RunFailed {
            failed,
            total: summaries.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use dirsync_connector::config::ConnectionConfig;
    use dirsync_connector::error::{SyncError, SyncResult};
    use dirsync_connector::operation::DirectoryEntry;
    use dirsync_connector::traits::DirectoryConnection;
    use dirsync_engine::memory::InMemoryDirectory;
    use dirsync_engine::summary::RunStatus;
    use tempfile::TempDir;

    fn user(cn: &str) -> DirectoryEntry {
        DirectoryEntry::new(format!("CN={},OU=Staff,DC=corp,DC=example", cn))
            .with_object_class("top")
            .with_object_class("person")
            .with_object_class("user")
            .with_attribute("sAMAccountName", cn.to_lowercase())
            .with_attribute("userAccountControl", "512")
            .with_when_changed(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    fn source(id: &str) -> DomainSource {
        source_on(id, "dc01")
    }

    fn source_on(id: &str, host: &str) -> DomainSource {
        let prefix = crate::config::env_prefix(id);
        crate::config::load_domain(id, |k| match k.strip_prefix(&prefix) {
            Some("_HOST") => Some(host.to_string()),
            Some("_USER") => Some("svc".to_string()),
            Some("_PASSWORD") => Some("pw".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn args(dir: &TempDir) -> SyncArgs {
        SyncArgs {
            domains: Vec::new(),
            full: false,
            dry_run: false,
            state_dir: dir.path().join("state"),
            output_dir: dir.path().join("out"),
            timeout_secs: None,
            batch_size: 10,
            max_retries: 0,
            format: OutputFormat::Json,
        }
    }

    async fn directory() -> InMemoryDirectory {
        let directory = InMemoryDirectory::new().with_naming_context("DC=corp,DC=example");
        directory.set_entries(vec![user("Alice"), user("Bob")]).await;
        directory
    }

    #[tokio::test]
    async fn test_sync_writes_records_and_state() {
        let dir = TempDir::new().unwrap();
        let directory = directory().await;
        let args = args(&dir);

        let summaries = run_sync(
            Arc::new(directory.clone()),
            vec![source("corp")],
            &args,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, RunStatus::Succeeded);
        // No watermark yet, so the incremental request ran as a full pass.
        assert_eq!(summaries[0].mode, RunMode::Full);
        assert_eq!(summaries[0].upserts, 2);
        assert!(check_outcome(&summaries).is_ok());

        let records = std::fs::read_dir(dir.path().join("out").join("corp"))
            .unwrap()
            .count();
        assert_eq!(records, 2);
        assert!(dir.path().join("state").join("corp.json").exists());

        // Second run sees nothing new.
        let again = run_sync(
            Arc::new(directory),
            vec![source("corp")],
            &args,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(again[0].mode, RunMode::Incremental);
        assert_eq!(again[0].events(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut args = args(&dir);
        args.dry_run = true;

        let summaries = run_sync(
            Arc::new(directory().await),
            vec![source("corp")],
            &args,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summaries[0].upserts, 2);
        assert!(!dir.path().join("out").join("corp").exists());
        assert!(!dir.path().join("state").join("corp.json").exists());
    }

    #[tokio::test]
    async fn test_failed_run_maps_to_exit_code() {
        let dir = TempDir::new().unwrap();
        let directory = directory().await;
        directory.reject_bind(true);

        let summaries = run_sync(
            Arc::new(directory),
            vec![source("corp")],
            &args(&dir),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summaries[0].status, RunStatus::Failed);
        assert_eq!(summaries[0].error_code.as_deref(), Some("AUTH_FAILED"));
        assert_eq!(check_outcome(&summaries).unwrap_err().exit_code(), 1);
    }

    /// Directory whose host `down` never answers.
    struct PartialOutage {
        directory: InMemoryDirectory,
    }

    #[async_trait]
    impl DirectoryClient for PartialOutage {
        fn display_name(&self) -> &str {
            "partial-outage"
        }

        async fn connect(
            &self,
            config: &ConnectionConfig,
        ) -> SyncResult<Box<dyn DirectoryConnection>> {
            if config.host == "down" {
                return Err(SyncError::connectivity("host unreachable"));
            }
            self.directory.connect(config).await
        }
    }

    #[tokio::test]
    async fn test_unreachable_domain_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let client = PartialOutage {
            directory: directory().await,
        };

        let summaries = run_sync(
            Arc::new(client),
            vec![source_on("lab", "down"), source_on("corp", "up")],
            &args(&dir),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].domain, "lab");
        assert_eq!(summaries[0].status, RunStatus::Failed);
        assert_eq!(summaries[0].error_code.as_deref(), Some("CONNECTIVITY"));
        assert_eq!(summaries[1].domain, "corp");
        assert_eq!(summaries[1].status, RunStatus::Succeeded);
        assert_eq!(summaries[1].upserts, 2);

        assert!(dir.path().join("state").join("corp.json").exists());
        assert!(!dir.path().join("state").join("lab.json").exists());
        assert!(matches!(
            check_outcome(&summaries),
            Err(CliError::RunFailed { failed: 1, total: 2 })
        ));
    }

    #[test]
    fn test_max_retries_applies_to_reads_and_delivery() {
        let dir = TempDir::new().unwrap();
        let mut args = args(&dir);
        args.max_retries = 7;
        let options = args.options().unwrap();
        assert_eq!(options.page_retry.max_retries, 7);
        assert_eq!(options.sink_retry.max_retries, 7);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_reported_as_failure() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summaries = run_sync(
            Arc::new(directory().await),
            vec![source("corp")],
            &args(&dir),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(summaries[0].status, RunStatus::Cancelled);
        let err = check_outcome(&summaries).unwrap_err();
        assert!(matches!(err, CliError::RunFailed { failed: 1, total: 1 }));
    }

    #[tokio::test]
    async fn test_duplicate_domain_rejected() {
        let dir = TempDir::new().unwrap();
        let err = run_sync(
            Arc::new(directory().await),
            vec![source("corp"), source("corp")],
            &args(&dir),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = TempDir::new().unwrap();
        let mut args = args(&dir);
        args.batch_size = 0;
        assert_eq!(args.options().unwrap_err().exit_code(), 2);
    }
}
