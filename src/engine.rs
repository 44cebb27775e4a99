//! Sync engine: the single entry point tying listing, planning, scheduling
//! and aggregation together
//!
//! Listing failures abort the run since there is nothing to partially
//! execute. Anything that goes wrong for one repository after listing ends
//! up in that repository's outcome. Cancellation is observed while listing,
//! between and during inspections, and by the scheduler.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::actions::ActionRunner;
use crate::error::{ErrorKind, SyncError};
use crate::git::VersionControl;
use crate::masking::SecretMasker;
use crate::policy::{repository_path, Action, PlannedAction, UpdateMode};
use crate::provider::{RepositoryDescriptor, RepositoryProvider, Session};
use crate::report::{Aggregator, ExecutionSummary, OperationOutcome, OutcomeStatus};
use crate::retry::{retry, RetryPolicy};
use crate::scheduler::{CancelSignal, Scheduler};

/// Orchestrates one project's synchronization against a local mirror
pub struct SyncEngine {
    provider: Arc<dyn RepositoryProvider>,
    vcs: Arc<dyn VersionControl>,
    masker: Arc<SecretMasker>,
    retry: RetryPolicy,
}

impl SyncEngine {
    pub fn new(
        provider: Arc<dyn RepositoryProvider>,
        vcs: Arc<dyn VersionControl>,
        masker: Arc<SecretMasker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            vcs,
            masker,
            retry,
        }
    }

    /// List every repository of `project`, retrying transient failures
    pub async fn list(
        &self,
        project: &str,
        session: &Session,
        cancel: &CancelSignal,
    ) -> Result<Vec<RepositoryDescriptor>, SyncError> {
        debug!("Listing repositories of {} on {}", project, self.provider.kind());

        let attempted = retry(&self.retry, cancel, |attempt| {
            if attempt > 1 {
                info!("Listing {} again (attempt {})", project, attempt);
            }
            let listing = self
                .provider
                .list_repositories(project, session)
                .try_collect::<Vec<_>>();
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(SyncError::Cancelled),
                    listed = listing => listed,
                }
            }
        })
        .await;

        let repositories = attempted.result?;
        info!(
            "Discovered {} repositories in {} ({} attempt(s))",
            repositories.len(),
            project,
            attempted.attempts
        );
        Ok(repositories)
    }

    /// Synchronize every repository of `project` under `destination_root`
    ///
    /// Returns an error only when nothing could be attempted: listing failed
    /// or was cancelled, or two repositories map to the same local path.
    /// Every listed repository otherwise has exactly one outcome in the
    /// summary.
    pub async fn sync_project(
        &self,
        project: &str,
        destination_root: &Path,
        concurrency: usize,
        mode: UpdateMode,
        session: &Session,
        cancel: &CancelSignal,
    ) -> Result<ExecutionSummary, SyncError> {
        info!(
            "Starting synchronization of {} into {} (mode: {})",
            project,
            destination_root.display(),
            mode
        );

        let mut aggregator = Aggregator::new();
        let repositories = self.list(project, session, cancel).await?;

        let (planned, unplannable) = self
            .plan(repositories, destination_root, mode, concurrency, cancel)
            .await;
        for outcome in unplannable {
            aggregator.record(outcome);
        }

        let runner = Arc::new(ActionRunner::new(self.vcs.clone(), session));
        let scheduler = Scheduler::new(
            concurrency,
            self.retry.clone(),
            runner,
            self.masker.clone(),
            cancel.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (scheduled, ()) = tokio::join!(scheduler.run(planned, tx), aggregator.collect(rx));
        scheduled?;

        let summary = aggregator.finish();
        info!(
            "Sync completed in {:.2}s: {} succeeded, {} skipped, {} failed",
            summary.duration.as_secs_f64(),
            summary.succeeded,
            summary.skipped,
            summary.failed
        );

        Ok(summary)
    }

    /// Resolve each repository's path, local state and action
    ///
    /// Repositories that cannot be planned come back as failed outcomes, and
    /// those not yet inspected when the run is cancelled as cancelled ones.
    /// Inspection runs with the same concurrency bound as execution and keeps
    /// the listing order.
    async fn plan(
        &self,
        repositories: Vec<RepositoryDescriptor>,
        destination_root: &Path,
        mode: UpdateMode,
        concurrency: usize,
        cancel: &CancelSignal,
    ) -> (Vec<PlannedAction>, Vec<OperationOutcome>) {
        let vcs = &self.vcs;

        let resolved: Vec<_> = stream::iter(repositories)
            .map(|repository| async move {
                if cancel.is_cancelled() {
                    return (repository, Err(SyncError::Cancelled));
                }
                let planned = match repository_path(destination_root, &repository.name) {
                    Ok(path) => {
                        let state = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(SyncError::Cancelled),
                            state = vcs.inspect(&path) => state,
                        };
                        state.map(|state| PlannedAction::new(repository.clone(), state, mode, path))
                    }
                    Err(e) => Err(e),
                };
                (repository, planned)
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let mut planned = Vec::with_capacity(resolved.len());
        let mut unplannable = Vec::new();

        for (repository, result) in resolved {
            match result {
                Ok(action) => {
                    debug!(
                        repository = %repository.name,
                        action = %action.action,
                        "Local state {:?}",
                        action.local_state
                    );
                    planned.push(action);
                }
                Err(SyncError::Cancelled) => {
                    debug!(repository = %repository.name, "Cancelled before planning finished");
                    unplannable.push(OperationOutcome {
                        local_path: repository_path(destination_root, &repository.name)
                            .unwrap_or_else(|_| destination_root.to_path_buf()),
                        repository: repository.name,
                        action: Action::Skip,
                        status: OutcomeStatus::Skipped,
                        error_kind: Some(ErrorKind::Cancelled),
                        message: Some("cancelled before it started".to_string()),
                        attempts: 0,
                        duration: Duration::ZERO,
                    });
                }
                Err(e) => {
                    let message = self.masker.mask(&e.to_string()).into_owned();
                    warn!(
                        repository = %repository.name,
                        status = "failed",
                        error_kind = e.kind().as_str(),
                        "Cannot plan: {}",
                        message
                    );
                    unplannable.push(OperationOutcome {
                        local_path: destination_root.to_path_buf(),
                        repository: repository.name,
                        action: Action::Skip,
                        status: OutcomeStatus::Failed,
                        error_kind: Some(e.kind()),
                        message: Some(message),
                        attempts: 0,
                        duration: Duration::ZERO,
                    });
                }
            }
        }

        (planned, unplannable)
    }
}
