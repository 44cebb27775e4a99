//! repofleet - Concurrent multi-provider repository mirroring
//!
//! repofleet lists every repository of an Azure DevOps project, GitHub
//! organization or BitBucket workspace and clones or updates each one under a
//! local directory, never touching local work unless told to.
//!
//! ## Core Features
//!
//! - **Provider Abstraction**: one listing contract over Azure DevOps, GitHub and BitBucket
//! - **Update Modes**: `skip`, `pull` or `force` reconciliation of existing copies
//! - **Bounded Concurrency**: a fixed number of clones and pulls in flight
//! - **Retry/Backoff**: transient network failures retried with jittered backoff
//! - **Credential Masking**: tokens never reach logs or reports
//!
//! ## Modules
//!
//! - [`engine`]: the single entry point for a project sync
//! - [`provider`]: provider variants and sessions
//! - [`policy`]: update-mode decisions and local paths
//! - [`scheduler`]: bounded worker pool and cancellation
//! - [`retry`]: retry/backoff executor
//! - [`report`]: outcomes, aggregation and rendering
//! - [`git`]: the git command-line collaborator
//! - [`masking`]: credential masking and logging setup
//! - [`config`]: configuration management and parsing

pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod masking;
pub mod policy;
pub mod provider;
pub mod report;
pub mod retry;
pub mod scheduler;

pub use config::Config;
pub use engine::SyncEngine;
pub use error::{ErrorKind, SyncError};
pub use git::{GitAuth, GitCli, VersionControl};
pub use masking::SecretMasker;
pub use policy::{decide, Action, LocalState, PlannedAction, UpdateMode};
pub use provider::{
    Credentials, Provider, ProviderKind, RepositoryDescriptor, RepositoryProvider, Session,
};
pub use report::{Aggregator, ExecutionSummary, OperationOutcome, OutcomeStatus, Reporter};
pub use retry::RetryPolicy;
pub use scheduler::{CancelSignal, Scheduler};
