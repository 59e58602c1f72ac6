//! Reconciliation engine.
//!
//! Drives one sync run through `Idle -> Paging -> Diffing -> Delivering ->
//! Committing -> Idle`, entering `Failed` from any phase on a run-level error.
//! The cursor is committed only after the sink acknowledged every batch, so
//! an interrupted run is simply repeated (at-least-once delivery).

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use dirsync_connector::error::{SyncError, SyncResult};
use dirsync_connector::operation::{ChangeEvent, NormalizedRecord, ResumeToken, SearchRequest};
use dirsync_connector::resilience::{Retried, RetryConfig, RetryExecutor};
use dirsync_connector::traits::{DirectoryClient, DirectoryConnection, Sink};

use crate::domain::DomainConfig;
use crate::normalize::EntryNormalizer;
use crate::state::{SyncCursor, SyncStateStore};
use crate::summary::{RunMode, RunPhase, RunSummary, SkipRecord};

/// Default number of change events per sink batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of batches delivered concurrently.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Tuning of a reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Change events per sink batch.
    pub batch_size: usize,
    /// Batches awaiting acknowledgement at the same time.
    pub max_in_flight_batches: usize,
    /// Retry policy for batch delivery.
    pub sink_retry: RetryConfig,
    /// Retry policy for connecting and fetching pages.
    pub page_retry: RetryConfig,
    /// Give up (as cancelled) after this long.
    pub timeout: Option<Duration>,
    /// Compute the diff only: no delivery, no commit.
    pub dry_run: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_in_flight_batches: DEFAULT_MAX_IN_FLIGHT,
            sink_retry: RetryConfig::default(),
            page_retry: RetryConfig::default(),
            timeout: None,
            dry_run: false,
        }
    }
}

impl ReconcileOptions {
    /// Set the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of concurrently delivered batches.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight_batches = max_in_flight;
        self
    }

    /// Set the sink retry policy.
    #[must_use]
    pub fn with_sink_retry(mut self, retry: RetryConfig) -> Self {
        self.sink_retry = retry;
        self
    }

    /// Set the connect/page retry policy.
    #[must_use]
    pub fn with_page_retry(mut self, retry: RetryConfig) -> Self {
        self.page_retry = retry;
        self
    }

    /// Set the run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable or disable dry-run mode.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::configuration("batch size must be positive"));
        }
        if self.max_in_flight_batches == 0 {
            return Err(SyncError::configuration(
                "max in-flight batches must be positive",
            ));
        }
        Ok(())
    }
}

/// What the Paging phase observed.
#[derive(Debug, Default)]
struct Pass {
    /// Normalized records by key; the later entry wins on duplicates.
    observed: BTreeMap<String, NormalizedRecord>,
    /// Keys of skipped entries whose key was derivable.
    skipped_keys: BTreeSet<String>,
    /// Skipped entries whose key was not derivable.
    unknown_skips: u32,
    /// Highest change timestamp returned.
    max_when_changed: Option<DateTime<Utc>>,
}

/// Output of the Diffing phase.
#[derive(Debug)]
struct Plan {
    events: Vec<ChangeEvent>,
    cursor: SyncCursor,
}

/// Mutable state of one run.
struct RunContext {
    summary: RunSummary,
    phase: RunPhase,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    fn transition(&mut self, to: RunPhase) {
        info!(
            domain = %self.summary.domain,
            from = %self.phase,
            to = %to,
            "Run phase transition"
        );
        self.phase = to;
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        match interruption(&self.cancel, self.deadline) {
            Some(reason) => Err(SyncError::cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Sleep for a retry backoff, waking early on cancellation.
    async fn backoff(&self, delay: Duration) -> SyncResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::cancelled("cancelled during retry backoff")),
            _ = tokio::time::sleep(delay) => self.check_cancelled(),
        }
    }
}

/// Reason a run must stop, if any.
fn interruption(cancel: &CancellationToken, deadline: Option<Instant>) -> Option<&'static str> {
    if cancel.is_cancelled() {
        return Some("cancellation requested");
    }
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Some("run timeout exceeded"),
        _ => None,
    }
}

/// Reconciles one directory domain against its persisted cursor and a sink.
#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn DirectoryClient>,
    sink: Arc<dyn Sink>,
    state: Arc<dyn SyncStateStore>,
    options: ReconcileOptions,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("client", &self.client.display_name())
            .field("sink", &self.sink.name())
            .field("options", &self.options)
            .finish()
    }
}

impl Reconciler {
    /// Create a reconciler with default options.
    pub fn new(
        client: Arc<dyn DirectoryClient>,
        sink: Arc<dyn Sink>,
        state: Arc<dyn SyncStateStore>,
    ) -> Self {
        Self {
            client,
            sink,
            state,
            options: ReconcileOptions::default(),
        }
    }

    /// Replace the run options.
    #[must_use]
    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Get the run options.
    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Run one reconciliation pass.
    ///
    /// Never returns an error: failures and cancellation are reported in the
    /// summary, and in both cases the cursor is left untouched.
    #[instrument(skip_all, fields(domain = %domain.id, mode = %mode))]
    pub async fn run(
        &self,
        domain: &DomainConfig,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let mut run = RunContext {
            summary: RunSummary::new(&domain.id, mode, self.options.dry_run),
            phase: RunPhase::Idle,
            cancel: cancel.clone(),
            deadline: self.options.timeout.map(|t| Instant::now() + t),
        };

        info!(
            run_id = %run.summary.run_id,
            dry_run = self.options.dry_run,
            "Starting sync run"
        );

        if let Err(e) = self.execute(domain, &mut run).await {
            let phase = run.phase;
            run.summary.fail(phase, &e);
            run.transition(RunPhase::Failed);
            match e {
                SyncError::Cancelled { .. } => {
                    warn!(phase = %phase, reason = %e, "Sync run cancelled; state not committed")
                }
                _ => error!(
                    phase = %phase,
                    error = %e,
                    code = e.error_code(),
                    "Sync run failed; state not committed"
                ),
            }
        }

        run.summary.finish();
        info!(
            status = %run.summary.status,
            upserts = run.summary.upserts,
            deletes = run.summary.deletes,
            unchanged = run.summary.unchanged,
            skipped = run.summary.skipped_count(),
            conflicts = run.summary.conflicts,
            duration_ms = run.summary.duration_ms,
            "Sync run finished"
        );
        run.summary
    }

    async fn execute(&self, domain: &DomainConfig, run: &mut RunContext) -> SyncResult<()> {
        domain.validate()?;
        self.options.validate()?;

        let normalizer = EntryNormalizer::new(domain.normalizer.clone());
        let cursor = self.state.load(&domain.id).await?;

        let request = match (run.summary.mode, cursor.high_watermark) {
            (RunMode::Full, _) => domain.search.clone(),
            (RunMode::Incremental, Some(watermark)) => domain.search.changed_since(&watermark),
            (RunMode::Incremental, None) => {
                info!("No watermark recorded yet; running a full pass instead");
                run.summary.mode = RunMode::Full;
                domain.search.clone()
            }
        };
        run.check_cancelled()?;

        run.transition(RunPhase::Paging);
        let pass = self.page(domain, request, &normalizer, run).await?;

        run.transition(RunPhase::Diffing);
        let plan = Self::diff(&cursor, pass, run);

        if self.options.dry_run {
            info!(
                upserts = run.summary.upserts,
                deletes = run.summary.deletes,
                "Dry run: skipping delivery and commit"
            );
            run.transition(RunPhase::Idle);
            return Ok(());
        }

        run.check_cancelled()?;
        run.transition(RunPhase::Delivering);
        self.deliver(&plan.events, run).await?;

        run.check_cancelled()?;
        run.transition(RunPhase::Committing);
        self.state.commit(&domain.id, &plan.cursor).await?;
        run.summary.watermark = plan.cursor.high_watermark;

        run.transition(RunPhase::Idle);
        Ok(())
    }

    /// Paging: read every page over one scoped connection.
    ///
    /// An empty base DN is replaced by the server's default naming context.
    async fn page(
        &self,
        domain: &DomainConfig,
        mut request: SearchRequest,
        normalizer: &EntryNormalizer,
        run: &mut RunContext,
    ) -> SyncResult<Pass> {
        let retry = RetryExecutor::new(self.options.page_retry.clone());
        let client = &self.client;
        let connection = &domain.connection;

        let connected = retry
            .execute_cancellable(&run.cancel, move || client.connect(connection))
            .await;
        run.summary.page_retries += connected.retries;
        let mut conn = connected.result?;

        let collected = match Self::resolve_base_dn(conn.as_mut(), &mut request).await {
            Ok(()) => Self::collect(conn.as_mut(), &request, normalizer, &retry, run).await,
            Err(e) => Err(e),
        };

        // Released on every path; a failing unbind does not change the outcome.
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close directory connection");
        }
        collected
    }

    async fn resolve_base_dn(
        conn: &mut dyn DirectoryConnection,
        request: &mut SearchRequest,
    ) -> SyncResult<()> {
        if !request.base_dn.trim().is_empty() {
            return Ok(());
        }
        let info = conn.server_info().await?;
        match info.default_naming_context.filter(|dn| !dn.trim().is_empty()) {
            Some(dn) => {
                info!(base_dn = %dn, "Using the server's default naming context");
                request.base_dn = dn;
                Ok(())
            }
            None => Err(SyncError::configuration(
                "no base DN configured and the server reports no default naming context",
            )),
        }
    }

    async fn collect(
        conn: &mut dyn DirectoryConnection,
        request: &SearchRequest,
        normalizer: &EntryNormalizer,
        retry: &RetryExecutor,
        run: &mut RunContext,
    ) -> SyncResult<Pass> {
        let mut pass = Pass::default();
        let mut resume: Option<ResumeToken> = None;

        loop {
            run.check_cancelled()?;

            let mut attempt = 0;
            let page = loop {
                match conn.fetch_page(request, resume.as_ref()).await {
                    Ok(page) => break page,
                    Err(e) => {
                        let Some(delay) = retry.retry_delay(&e, attempt) else {
                            return Err(e);
                        };
                        warn!(
                            page = run.summary.pages + 1,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Page fetch failed; retrying from the same token"
                        );
                        run.summary.page_retries += 1;
                        run.backoff(delay).await?;
                        attempt += 1;
                    }
                }
            };

            run.summary.pages += 1;
            run.summary.entries_seen += (page.entries.len() + page.malformed.len()) as u32;

            for malformed in page.malformed {
                pass.unknown_skips += 1;
                run.summary.skip(SkipRecord {
                    dn: malformed.dn,
                    key: None,
                    phase: RunPhase::Paging,
                    message: malformed.message,
                });
            }

            for entry in page.entries {
                if let Some(changed) = entry.when_changed {
                    pass.max_when_changed = pass.max_when_changed.max(Some(changed));
                }

                match normalizer.normalize(&entry) {
                    Ok(record) => {
                        let key = record.key.clone();
                        if let Some(earlier) = pass.observed.insert(key.clone(), record) {
                            warn!(
                                key = %key,
                                dn = %entry.distinguished_name,
                                earlier_dn = ?earlier.field("dn").and_then(|v| v.as_text()),
                                "Duplicate key in one pass; keeping the later entry"
                            );
                            run.summary.conflicts += 1;
                        }
                    }
                    Err(SyncError::Normalization { dn, key, message }) => {
                        warn!(dn = %dn, key = ?key, error = %message, "Skipping entry");
                        match &key {
                            Some(key) => {
                                pass.skipped_keys.insert(key.clone());
                            }
                            None => pass.unknown_skips += 1,
                        }
                        run.summary.skip(SkipRecord {
                            dn,
                            key,
                            phase: RunPhase::Paging,
                            message,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            debug!(
                pages = run.summary.pages,
                observed = pass.observed.len(),
                "Page processed"
            );

            match page.next {
                Some(token) => resume = Some(token),
                None => break,
            }
        }

        Ok(pass)
    }

    /// Diffing: compare observations with the cursor and plan the next one.
    fn diff(cursor: &SyncCursor, pass: Pass, run: &mut RunContext) -> Plan {
        let full = run.summary.mode == RunMode::Full;
        let mut events = Vec::new();

        // Full runs rebuild the fingerprint set; incremental runs patch it.
        let mut fingerprints = if full {
            BTreeMap::new()
        } else {
            cursor.last_known_fingerprints.clone()
        };

        for (key, record) in pass.observed {
            let unchanged = cursor.fingerprint(&key) == Some(record.fingerprint.as_str());
            fingerprints.insert(key, record.fingerprint.clone());
            if unchanged {
                run.summary.unchanged += 1;
            } else {
                run.summary.upserts += 1;
                events.push(ChangeEvent::upsert(record));
            }
        }

        if full {
            // A skipped entry still exists; keep what the sink last received.
            for key in &pass.skipped_keys {
                if let (false, Some(previous)) =
                    (fingerprints.contains_key(key), cursor.fingerprint(key))
                {
                    fingerprints.insert(key.clone(), previous.to_string());
                }
            }

            if pass.unknown_skips > 0 {
                warn!(
                    skipped = pass.unknown_skips,
                    "Entries without a derivable key were skipped; deletion detection suppressed"
                );
                run.summary.deletions_suppressed = true;
                for (key, previous) in &cursor.last_known_fingerprints {
                    fingerprints
                        .entry(key.clone())
                        .or_insert_with(|| previous.clone());
                }
            } else {
                run.summary.deletions_detected = true;
                for key in cursor.last_known_fingerprints.keys() {
                    if !fingerprints.contains_key(key) {
                        run.summary.deletes += 1;
                        events.push(ChangeEvent::delete(key.clone()));
                    }
                }
            }
        }

        info!(
            upserts = run.summary.upserts,
            deletes = run.summary.deletes,
            unchanged = run.summary.unchanged,
            deletions_detected = run.summary.deletions_detected,
            "Diff computed"
        );

        Plan {
            events,
            cursor: SyncCursor {
                last_successful_run_at: Some(Utc::now()),
                high_watermark: cursor.high_watermark.max(pass.max_when_changed),
                last_known_fingerprints: fingerprints,
                ..SyncCursor::default()
            },
        }
    }

    /// Delivering: send batches with bounded concurrency and retries.
    async fn deliver(&self, events: &[ChangeEvent], run: &mut RunContext) -> SyncResult<()> {
        if events.is_empty() {
            debug!("Nothing to deliver");
            return Ok(());
        }

        let executor = RetryExecutor::new(self.options.sink_retry.clone());
        // Stops new batches after the first failure; in-flight ones finish.
        let stop = run.cancel.child_token();
        let deadline = run.deadline;
        let total = events.len().div_ceil(self.options.batch_size);

        let executor = &executor;
        let stop_ref = &stop;
        let sink = &self.sink;

        let mut batches: Vec<BoxFuture<'_, (usize, Retried<()>)>> = Vec::with_capacity(total);
        for (index, batch) in events.chunks(self.options.batch_size).enumerate() {
            batches.push(
                async move {
                    if let Some(reason) = interruption(stop_ref, deadline) {
                        let skipped = Retried {
                            result: Err(SyncError::cancelled(reason)),
                            retries: 0,
                        };
                        return (index, skipped);
                    }
                    debug!(batch = index + 1, total, size = batch.len(), "Delivering batch");
                    let outcome = executor
                        .execute_cancellable(stop_ref, move || sink.deliver(batch))
                        .await;
                    (index, outcome)
                }
                .boxed(),
            );
        }
        let mut deliveries = stream::iter(batches).buffered(self.options.max_in_flight_batches);

        let mut first_error: Option<SyncError> = None;
        while let Some((index, outcome)) = deliveries.next().await {
            run.summary.batch_retries += outcome.retries;
            match outcome.result {
                Ok(()) => {
                    run.summary.batches_delivered += 1;
                    debug!(batch = index + 1, total, "Batch acknowledged");
                }
                Err(e) => {
                    if first_error.is_none() {
                        warn!(
                            batch = index + 1,
                            retries = outcome.retries,
                            error = %e,
                            "Batch delivery failed"
                        );
                        stop.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(batches = total, events = events.len(), "All batches acknowledged");
                Ok(())
            }
        }
    }
}
