//! Bounded-concurrency execution of planned actions
//!
//! Actions are submitted in list order and run on at most `concurrency`
//! tasks at a time. Every submitted action produces exactly one
//! [`OperationOutcome`], sent to the aggregator over a channel: finished,
//! skipped, failed, panicked or abandoned because the run was cancelled.

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use crate::actions::ActionRunner;
use crate::error::{ErrorKind, SyncError};
use crate::masking::SecretMasker;
use crate::policy::{Action, PlannedAction};
use crate::report::{OperationOutcome, OutcomeStatus};
use crate::retry::{retry, RetryPolicy};

/// Cooperative cancellation shared by everything in a run
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of this signal
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size worker pool draining the planned-action list
pub struct Scheduler {
    concurrency: usize,
    retry: RetryPolicy,
    runner: Arc<ActionRunner>,
    masker: Arc<SecretMasker>,
    cancel: CancelSignal,
}

impl Scheduler {
    pub fn new(
        concurrency: usize,
        retry: RetryPolicy,
        runner: Arc<ActionRunner>,
        masker: Arc<SecretMasker>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            retry,
            runner,
            masker,
            cancel,
        }
    }

    /// Execute every action, pushing one outcome per action into `outcomes`
    ///
    /// Fails before submitting anything if two actions target overlapping
    /// paths.
    pub async fn run(
        &self,
        actions: Vec<PlannedAction>,
        outcomes: mpsc::UnboundedSender<OperationOutcome>,
    ) -> Result<(), SyncError> {
        ensure_disjoint(&actions)?;

        info!(
            "Scheduling {} repositories with concurrency {}",
            actions.len(),
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut pending = actions.into_iter();

        while let Some(planned) = pending.next() {
            // A permit is taken here, in submission order, before the task exists
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit.filter(|_| !self.cancel.is_cancelled()) else {
                let _ = outcomes.send(cancelled_outcome(&planned));
                break;
            };

            debug!(repository = %planned.repository.name, action = %planned.action, "Submitting");

            let job = Job {
                planned,
                runner: self.runner.clone(),
                retry: self.retry.clone(),
                masker: self.masker.clone(),
                cancel: self.cancel.clone(),
            };
            let outcomes = outcomes.clone();

            tasks.spawn(
                async move {
                    let outcome = job.execute().await;
                    drop(permit);
                    let _ = outcomes.send(outcome);
                }
                .with_current_subscriber(),
            );
        }

        let abandoned: Vec<_> = pending.collect();
        if !abandoned.is_empty() {
            warn!("Run cancelled, {} repositories not started", abandoned.len());
            for planned in &abandoned {
                let _ = outcomes.send(cancelled_outcome(planned));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                // Jobs catch their own panics, so this is an aborted runtime
                error!("Worker task ended abnormally: {}", e);
            }
        }

        Ok(())
    }
}

/// One planned action plus everything needed to run it on a worker
struct Job {
    planned: PlannedAction,
    runner: Arc<ActionRunner>,
    retry: RetryPolicy,
    masker: Arc<SecretMasker>,
    cancel: CancelSignal,
}

impl Job {
    async fn execute(self) -> OperationOutcome {
        let planned = &self.planned;
        let name = planned.repository.name.clone();

        if planned.action == Action::Skip {
            let outcome = skipped_outcome(planned);
            info!(
                repository = %name,
                action = %planned.action,
                status = "skipped",
                error_kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("none"),
                "{}",
                outcome.message.as_deref().unwrap_or("")
            );
            return outcome;
        }

        if self.cancel.is_cancelled() {
            return cancelled_outcome(planned);
        }

        info!(repository = %name, action = %planned.action, "Starting");

        let runner: &ActionRunner = &self.runner;
        let attempted = AssertUnwindSafe(retry(&self.retry, &self.cancel, move |attempt| {
            debug!(repository = %planned.repository.name, attempt, "Attempting {}", planned.action);
            runner.run(planned)
        }))
        .catch_unwind()
        .await;

        let (result, attempts, duration) = match attempted {
            Ok(attempted) => (attempted.result, attempted.attempts, attempted.duration),
            Err(_) => (
                Err(SyncError::RepositoryOperation("worker panicked".to_string())),
                1,
                Duration::ZERO,
            ),
        };

        let outcome = match result {
            Ok(()) => OperationOutcome {
                repository: name.clone(),
                action: planned.action,
                status: OutcomeStatus::Success,
                error_kind: None,
                message: None,
                attempts,
                duration,
                local_path: planned.local_path.clone(),
            },
            Err(SyncError::Cancelled) => OperationOutcome {
                message: Some("cancelled while waiting to retry".to_string()),
                attempts,
                duration,
                ..cancelled_outcome(planned)
            },
            Err(err) => OperationOutcome {
                repository: name.clone(),
                action: planned.action,
                status: OutcomeStatus::Failed,
                error_kind: Some(err.kind()),
                message: Some(self.masker.mask(&err.to_string()).into_owned()),
                attempts,
                duration,
                local_path: planned.local_path.clone(),
            },
        };

        match outcome.status {
            OutcomeStatus::Failed => warn!(
                repository = %name,
                action = %planned.action,
                status = "failed",
                error_kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("none"),
                attempts,
                "{}",
                outcome.message.as_deref().unwrap_or("")
            ),
            status => info!(
                repository = %name,
                action = %planned.action,
                status = status.as_str(),
                attempts,
                "Finished in {:.2}s",
                duration.as_secs_f64()
            ),
        }

        outcome
    }
}

fn skipped_outcome(planned: &PlannedAction) -> OperationOutcome {
    let (error_kind, message) = if planned.conflict {
        (Some(ErrorKind::Conflict), "local changes present")
    } else {
        (None, "already present locally")
    };

    OperationOutcome {
        repository: planned.repository.name.clone(),
        action: Action::Skip,
        status: OutcomeStatus::Skipped,
        error_kind,
        message: Some(message.to_string()),
        attempts: 0,
        duration: Duration::ZERO,
        local_path: planned.local_path.clone(),
    }
}

fn cancelled_outcome(planned: &PlannedAction) -> OperationOutcome {
    OperationOutcome {
        repository: planned.repository.name.clone(),
        action: planned.action,
        status: OutcomeStatus::Skipped,
        error_kind: Some(ErrorKind::Cancelled),
        message: Some("cancelled before it started".to_string()),
        attempts: 0,
        duration: Duration::ZERO,
        local_path: planned.local_path.clone(),
    }
}

/// Reject action lists in which two actions would touch the same subtree
///
/// Comparison is case-insensitive so the check holds on case-folding
/// filesystems too.
pub fn ensure_disjoint(actions: &[PlannedAction]) -> Result<(), SyncError> {
    let mut seen: HashMap<PathBuf, &str> = HashMap::new();

    for planned in actions {
        let key = PathBuf::from(planned.local_path.to_string_lossy().to_lowercase());

        if let Some(other) = seen.get(&key) {
            return Err(SyncError::Validation(format!(
                "repositories '{}' and '{}' both map to {}",
                other,
                planned.repository.name,
                planned.local_path.display()
            )));
        }

        if let Some((path, other)) = seen
            .iter()
            .find(|(path, _)| key.starts_with(path) || path.starts_with(&key))
        {
            return Err(SyncError::Validation(format!(
                "repositories '{}' and '{}' have nested paths ({} and {})",
                other,
                planned.repository.name,
                path.display(),
                planned.local_path.display()
            )));
        }

        seen.insert(key, planned.repository.name.as_str());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{LocalState, UpdateMode};
    use crate::provider::{ProviderKind, RepositoryDescriptor};

    fn planned(name: &str, path: &str) -> PlannedAction {
        PlannedAction::new(
            RepositoryDescriptor {
                name: name.into(),
                clone_url: format!("https://h/{}.git", name),
                provider_kind: ProviderKind::AzureDevOps,
                default_branch: None,
            },
            LocalState::Absent,
            UpdateMode::Skip,
            PathBuf::from(path),
        )
    }

    #[test]
    fn test_disjoint_paths_pass() {
        let actions = vec![planned("a", "/m/a"), planned("ab", "/m/ab"), planned("b", "/m/b")];
        assert!(ensure_disjoint(&actions).is_ok());
    }

    #[test]
    fn test_case_insensitive_collision_fails_fast() {
        let actions = vec![planned("Api", "/m/Api"), planned("api", "/m/api")];
        let err = ensure_disjoint(&actions).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("Api"));
    }

    #[test]
    fn test_nested_paths_fail_fast() {
        let actions = vec![planned("outer", "/m/outer"), planned("inner", "/m/outer/inner")];
        assert!(ensure_disjoint(&actions).is_err());
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        signal.cancel();

        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_conflict_skip_outcome_is_marked() {
        let mut action = planned("api", "/m/api");
        action.action = Action::Skip;
        action.conflict = true;

        let outcome = skipped_outcome(&action);
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Conflict));
        assert_eq!(outcome.message.as_deref(), Some("local changes present"));
    }
}
