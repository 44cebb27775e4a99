//! Per-repository outcomes, their aggregation and the rendered run summary

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ErrorKind;
use crate::masking::SecretMasker;
use crate::policy::Action;

/// Exit status of a run that was cancelled without any failure
pub const EXIT_CANCELLED: i32 = 130;

/// Largest failure count representable in the exit status
const MAX_FAILURE_EXIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Failed => "failed",
        }
    }
}

/// Terminal result for one repository. Never changed once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub repository: String,
    pub action: Action,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Human-readable detail, already masked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub attempts: u32,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub local_path: PathBuf,
}

impl OperationOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }

    pub fn is_conflict(&self) -> bool {
        self.error_kind == Some(ErrorKind::Conflict)
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
}

/// Single-writer accumulator of outcomes
///
/// Owned by exactly one task; workers reach it only through the channel
/// drained by [`collect`](Self::collect).
#[derive(Debug)]
pub struct Aggregator {
    started_at: DateTime<Utc>,
    started: Instant,
    seen: HashSet<String>,
    outcomes: Vec<OperationOutcome>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            seen: HashSet::new(),
            outcomes: Vec::new(),
        }
    }

    /// Record one outcome; returns false if the repository already had one
    pub fn record(&mut self, outcome: OperationOutcome) -> bool {
        if !self.seen.insert(outcome.repository.clone()) {
            warn!(repository = %outcome.repository, "Ignoring duplicate outcome");
            return false;
        }
        self.outcomes.push(outcome);
        true
    }

    /// Drain `rx` until every sender is gone
    pub async fn collect(&mut self, mut rx: mpsc::UnboundedReceiver<OperationOutcome>) {
        while let Some(outcome) = rx.recv().await {
            self.record(outcome);
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Freeze the collected outcomes into a summary
    pub fn finish(self) -> ExecutionSummary {
        let mut outcomes = self.outcomes;
        outcomes.sort_by(|a, b| a.repository.cmp(&b.repository));

        let count = |status: OutcomeStatus| outcomes.iter().filter(|o| o.status == status).count();
        let succeeded = count(OutcomeStatus::Success);
        let skipped = count(OutcomeStatus::Skipped);
        let failed = count(OutcomeStatus::Failed);
        let cancelled = outcomes.iter().filter(|o| o.is_cancelled()).count();
        let conflicts = outcomes.iter().filter(|o| o.is_conflict()).count();

        ExecutionSummary {
            total: outcomes.len(),
            succeeded,
            skipped,
            failed,
            cancelled,
            conflicts,
            started_at: self.started_at,
            duration: self.started.elapsed(),
            outcomes,
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only result of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Includes cancelled and conflicting repositories
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub conflicts: usize,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Sorted by repository name
    pub outcomes: Vec<OperationOutcome>,
}

impl ExecutionSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
    }

    /// Process exit status for this run
    ///
    /// 0 when nothing failed, the failure count (capped at 100) when something
    /// did, and 130 for a cancelled run without failures.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            self.failed.min(MAX_FAILURE_EXIT) as i32
        } else if self.was_cancelled() {
            EXIT_CANCELLED
        } else {
            0
        }
    }
}

#[derive(Serialize)]
struct FailureEntry<'a> {
    repository: &'a str,
    error_kind: Option<ErrorKind>,
    message: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    summary: &'a ExecutionSummary,
    exit_code: i32,
    failures: Vec<FailureEntry<'a>>,
}

/// Renders a summary for people or machines, masking as it goes
pub struct Reporter {
    masker: Arc<SecretMasker>,
}

impl Reporter {
    pub fn new(masker: Arc<SecretMasker>) -> Self {
        Self { masker }
    }

    pub fn render_text(&self, summary: &ExecutionSummary) -> String {
        let mut out = String::new();

        let headline = if !summary.is_success() {
            "❌ Synchronization finished with failures"
        } else if summary.was_cancelled() {
            "🛑 Synchronization cancelled"
        } else {
            "🎉 Synchronization Complete!"
        };

        let _ = writeln!(out, "{}", headline);
        let _ = writeln!(out, "   📊 Total repositories: {}", summary.total);
        let _ = writeln!(out, "   ✅ Succeeded: {}", summary.succeeded);
        let _ = writeln!(out, "   ⏭️  Skipped: {}", summary.skipped);
        if summary.conflicts > 0 {
            let _ = writeln!(out, "   ⚠️  Local changes present: {}", summary.conflicts);
        }
        if summary.cancelled > 0 {
            let _ = writeln!(out, "   🛑 Cancelled: {}", summary.cancelled);
        }
        let _ = writeln!(out, "   ❌ Failed: {}", summary.failed);
        let _ = writeln!(out, "   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

        if !summary.outcomes.is_empty() {
            let width = summary
                .outcomes
                .iter()
                .map(|o| o.repository.chars().count())
                .max()
                .unwrap_or(0);

            let _ = writeln!(out, "\n📋 Repositories:");
            for outcome in &summary.outcomes {
                let detail = match (outcome.error_kind, outcome.message.as_deref()) {
                    (Some(kind), Some(message)) => format!("{}: {}", kind, message),
                    (Some(kind), None) => kind.to_string(),
                    (None, Some(message)) => message.to_string(),
                    (None, None) => String::new(),
                };
                let _ = writeln!(
                    out,
                    "   {} {:<width$}  {:<7}  {:<7}  {}",
                    status_icon(outcome),
                    outcome.repository,
                    outcome.action.as_str(),
                    outcome.status.as_str(),
                    detail,
                    width = width
                );
            }
        }

        self.masker.mask(&out).into_owned()
    }

    pub fn render_json(&self, summary: &ExecutionSummary) -> serde_json::Result<String> {
        let report = JsonReport {
            summary,
            exit_code: summary.exit_code(),
            failures: summary
                .failures()
                .map(|o| FailureEntry {
                    repository: &o.repository,
                    error_kind: o.error_kind,
                    message: o.message.as_deref(),
                })
                .collect(),
        };

        let json = serde_json::to_string_pretty(&report)?;
        Ok(self.masker.mask(&json).into_owned())
    }
}

fn status_icon(outcome: &OperationOutcome) -> &'static str {
    match outcome.status {
        OutcomeStatus::Success => "✅",
        OutcomeStatus::Failed => "❌",
        OutcomeStatus::Skipped if outcome.is_cancelled() => "🛑",
        OutcomeStatus::Skipped if outcome.is_conflict() => "⚠️",
        OutcomeStatus::Skipped => "⏭️",
    }
}
