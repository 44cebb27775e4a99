//! Update-mode policy: what to do with each repository given its local state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::SyncError;
use crate::provider::RepositoryDescriptor;

/// User-selected reconciliation policy for repositories that already exist locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Never touch an existing copy
    #[default]
    Skip,
    /// Fast-forward clean copies, leave modified ones alone
    Pull,
    /// Replace every existing copy with a fresh clone
    Force,
}

impl UpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::Skip => "skip",
            UpdateMode::Pull => "pull",
            UpdateMode::Force => "force",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(UpdateMode::Skip),
            "pull" => Ok(UpdateMode::Pull),
            "force" => Ok(UpdateMode::Force),
            other => Err(SyncError::Configuration(format!(
                "unknown update mode '{}' (expected skip, pull or force)",
                other
            ))),
        }
    }
}

/// State of a repository's local path, derived fresh on every run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalState {
    /// Nothing on disk, or a directory that holds no git repository
    Absent,
    /// Work tree without modifications, level with its upstream
    PresentClean,
    /// Uncommitted modifications, unpushed commits or no upstream
    PresentDirty,
}

/// Operation chosen for one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Clone,
    Pull,
    Reclone,
    Skip,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Clone => "clone",
            Action::Pull => "pull",
            Action::Reclone => "reclone",
            Action::Skip => "skip",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide the action for a repository
///
/// | local state  | skip  | pull  | force   |
/// |--------------|-------|-------|---------|
/// | Absent       | Clone | Clone | Clone   |
/// | PresentClean | Skip  | Pull  | Reclone |
/// | PresentDirty | Skip  | Skip  | Reclone |
pub fn decide(local_state: LocalState, mode: UpdateMode) -> Action {
    match (local_state, mode) {
        (LocalState::Absent, _) => Action::Clone,
        (_, UpdateMode::Skip) => Action::Skip,
        (LocalState::PresentClean, UpdateMode::Pull) => Action::Pull,
        (LocalState::PresentDirty, UpdateMode::Pull) => Action::Skip,
        (_, UpdateMode::Force) => Action::Reclone,
    }
}

/// One repository's resolved work item, consumed once by the scheduler
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub repository: RepositoryDescriptor,
    pub action: Action,
    pub local_path: PathBuf,
    pub local_state: LocalState,
    /// Skipped because `pull` found local changes; reported as a conflict
    pub conflict: bool,
}

impl PlannedAction {
    pub fn new(
        repository: RepositoryDescriptor,
        local_state: LocalState,
        mode: UpdateMode,
        local_path: PathBuf,
    ) -> Self {
        let action = decide(local_state, mode);
        let conflict = action == Action::Skip
            && mode == UpdateMode::Pull
            && local_state == LocalState::PresentDirty;

        Self {
            repository,
            action,
            local_path,
            local_state,
            conflict,
        }
    }
}

/// Local directory for a repository under `root`
///
/// Path separators and characters that are awkward on common filesystems are
/// replaced so each repository name maps to exactly one child of `root`.
pub fn repository_path(root: &Path, name: &str) -> Result<PathBuf, SyncError> {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c: char| c == '.' || c.is_whitespace());

    if sanitized.is_empty() {
        return Err(SyncError::Validation(format!(
            "repository name '{}' does not map to a usable directory name",
            name
        )));
    }

    Ok(root.join(sanitized))
}
