//! Run summaries.
//!
//! Structured, serializable report of one reconciliation run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dirsync_connector::error::SyncError;

/// Whether a run scans everything or only recent changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Scan the whole base; detects deletions.
    Full,
    /// Only entries changed since the watermark; never deletes.
    Incremental,
}

impl RunMode {
    /// Get the mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciler state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Paging,
    Diffing,
    Delivering,
    Committing,
    Failed,
}

impl RunPhase {
    /// Get the phase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Paging => "paging",
            RunPhase::Diffing => "diffing",
            RunPhase::Delivering => "delivering",
            RunPhase::Committing => "committing",
            RunPhase::Failed => "failed",
        }
    }

    /// Whether the run can still make progress from this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Idle | RunPhase::Failed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every change acknowledged and the cursor committed (or a dry run).
    Succeeded,
    /// The run stopped on an error; the cursor is unchanged.
    Failed,
    /// The run was cancelled or timed out; the cursor is unchanged.
    Cancelled,
}

impl RunStatus {
    /// Get the status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry that was skipped instead of failing the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    /// DN of the entry (empty if the server did not provide one).
    pub dn: String,
    /// Record key, when derivable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Phase in which the entry was skipped.
    pub phase: RunPhase,
    /// Why it was skipped.
    pub message: String,
}

/// Report of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: Uuid,
    /// Domain identifier.
    pub domain: String,
    /// Effective mode.
    pub mode: RunMode,
    /// Outcome.
    pub status: RunStatus,
    /// Diff only; nothing delivered or committed.
    pub dry_run: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,

    /// Pages fetched.
    #[serde(default)]
    pub pages: u32,
    /// Page fetch retries.
    #[serde(default)]
    pub page_retries: u32,
    /// Entries returned by the directory.
    #[serde(default)]
    pub entries_seen: u32,
    /// Upsert events (planned, for dry runs).
    #[serde(default)]
    pub upserts: u32,
    /// Delete events (planned, for dry runs).
    #[serde(default)]
    pub deletes: u32,
    /// Records whose fingerprint did not change.
    #[serde(default)]
    pub unchanged: u32,
    /// Duplicate keys in one pass (the later entry won).
    #[serde(default)]
    pub conflicts: u32,
    /// Batches acknowledged by the sink.
    #[serde(default)]
    pub batches_delivered: u32,
    /// Batch delivery retries.
    #[serde(default)]
    pub batch_retries: u32,
    /// Entries skipped, with reasons.
    #[serde(default)]
    pub skipped: Vec<SkipRecord>,

    /// Whether this run could detect deletions (full runs only).
    pub deletions_detected: bool,
    /// Deletion detection was turned off because an entry with an unknown
    /// key was skipped.
    #[serde(default)]
    pub deletions_suppressed: bool,
    /// Watermark committed by this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<DateTime<Utc>>,

    /// Phase in which the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<RunPhase>,
    /// Error message of a failed or cancelled run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl RunSummary {
    /// Start a summary for a new run.
    pub fn new(domain: impl Into<String>, mode: RunMode, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            domain: domain.into(),
            mode,
            status: RunStatus::Succeeded,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            pages: 0,
            page_retries: 0,
            entries_seen: 0,
            upserts: 0,
            deletes: 0,
            unchanged: 0,
            conflicts: 0,
            batches_delivered: 0,
            batch_retries: 0,
            skipped: Vec::new(),
            deletions_detected: false,
            deletions_suppressed: false,
            watermark: None,
            failed_phase: None,
            error: None,
            error_code: None,
        }
    }

    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Number of skipped entries.
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Total change events (planned or delivered).
    pub fn events(&self) -> u32 {
        self.upserts + self.deletes
    }

    /// Record a skipped entry.
    pub fn skip(&mut self, skip: SkipRecord) {
        self.skipped.push(skip);
    }

    /// Mark the run as failed or cancelled in `phase`.
    pub fn fail(&mut self, phase: RunPhase, error: &SyncError) {
        self.status = match error {
            SyncError::Cancelled { .. } => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        self.failed_phase = Some(phase);
        self.error = Some(error.to_string());
        self.error_code = Some(error.error_code().to_string());
    }

    /// Stamp the end time.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
    }

    /// One-line human-readable description.
    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} [{}{}] {}: {} upserts, {} deletes, {} unchanged, {} skipped, {} conflicts",
            self.domain,
            self.mode,
            if self.dry_run { ", dry-run" } else { "" },
            self.status,
            self.upserts,
            self.deletes,
            self.unchanged,
            self.skipped.len(),
            self.conflicts,
        );
        if !self.deletions_detected {
            line.push_str(" (deletions not detected)");
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" - {}", error));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_summary() {
        let summary = RunSummary::new("corp", RunMode::Full, false);
        assert!(summary.is_success());
        assert_eq!(summary.events(), 0);
        assert!(summary.finished_at.is_none());
    }

    #[test]
    fn test_fail_sets_status_and_code() {
        let mut summary = RunSummary::new("corp", RunMode::Full, false);
        summary.fail(RunPhase::Delivering, &SyncError::sink_delivery("down"));
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.failed_phase, Some(RunPhase::Delivering));
        assert_eq!(summary.error_code.as_deref(), Some("SINK_DELIVERY"));

        let mut summary = RunSummary::new("corp", RunMode::Full, false);
        summary.fail(RunPhase::Paging, &SyncError::cancelled("operator"));
        assert_eq!(summary.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_summary_serialization() {
        let mut summary = RunSummary::new("corp", RunMode::Incremental, true);
        summary.upserts = 2;
        summary.finish();

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["mode"], "incremental");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["dry_run"], true);
        assert_eq!(json["upserts"], 2);
        assert_eq!(json["deletions_detected"], false);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_describe() {
        let mut summary = RunSummary::new("corp", RunMode::Incremental, false);
        summary.upserts = 3;
        let line = summary.describe();
        assert!(line.starts_with("corp [incremental] succeeded: 3 upserts"));
        assert!(line.ends_with("(deletions not detected)"));
    }

    #[test]
    fn test_phase_terminal() {
        assert!(RunPhase::Idle.is_terminal());
        assert!(RunPhase::Failed.is_terminal());
        assert!(!RunPhase::Delivering.is_terminal());
    }
}
