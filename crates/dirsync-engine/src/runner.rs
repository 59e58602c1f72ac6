//! Multi-domain runner.
//!
//! Runs several domains concurrently. Domains share the directory client and
//! state store; each run opens its own connection and owns its sink.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dirsync_connector::traits::{DirectoryClient, Sink};

use crate::domain::DomainConfig;
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::state::SyncStateStore;
use crate::summary::{RunMode, RunPhase, RunStatus, RunSummary};

/// One domain scheduled for a run.
#[derive(Clone)]
pub struct SyncJob {
    /// Domain to synchronize.
    pub domain: DomainConfig,
    /// Full or incremental.
    pub mode: RunMode,
    /// Where the domain's changes go.
    pub sink: Arc<dyn Sink>,
}

impl std::fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncJob")
            .field("domain", &self.domain.id)
            .field("mode", &self.mode)
            .field("sink", &self.sink.name())
            .finish()
    }
}

/// Runs sync jobs for several domains concurrently.
pub struct SyncRunner {
    client: Arc<dyn DirectoryClient>,
    state: Arc<dyn SyncStateStore>,
    options: ReconcileOptions,
    jobs: Vec<SyncJob>,
}

impl SyncRunner {
    /// Create a runner with default options.
    pub fn new(client: Arc<dyn DirectoryClient>, state: Arc<dyn SyncStateStore>) -> Self {
        Self {
            client,
            state,
            options: ReconcileOptions::default(),
            jobs: Vec::new(),
        }
    }

    /// Set the options used for every domain.
    #[must_use]
    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Schedule a domain.
    pub fn add_job(&mut self, domain: DomainConfig, mode: RunMode, sink: Arc<dyn Sink>) {
        self.jobs.push(SyncJob { domain, mode, sink });
    }

    /// Number of scheduled domains.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Run every scheduled domain and return the summaries in job order.
    pub async fn run(self, cancel: &CancellationToken) -> Vec<RunSummary> {
        let mut set = JoinSet::new();
        let domains: Vec<String> = self.jobs.iter().map(|j| j.domain.id.clone()).collect();

        info!(domains = domains.len(), "Starting sync runner");

        for (index, job) in self.jobs.into_iter().enumerate() {
            let reconciler = Reconciler::new(self.client.clone(), job.sink, self.state.clone())
                .with_options(self.options.clone());
            let cancel = cancel.clone();
            set.spawn(async move {
                let summary = reconciler.run(&job.domain, job.mode, &cancel).await;
                (index, summary)
            });
        }

        let mut slots: Vec<Option<RunSummary>> = domains.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, summary)) => slots[index] = Some(summary),
                Err(e) => error!(error = %e, "Sync task aborted"),
            }
        }

        // A panicked task still gets a failed summary.
        slots
            .into_iter()
            .zip(domains)
            .map(|(slot, domain)| {
                slot.unwrap_or_else(|| {
                    let mut summary = RunSummary::new(domain, RunMode::Full, self.options.dry_run);
                    summary.status = RunStatus::Failed;
                    summary.failed_phase = Some(RunPhase::Failed);
                    summary.error = Some("sync task aborted".to_string());
                    summary.finish();
                    summary
                })
            })
            .collect()
    }
}
