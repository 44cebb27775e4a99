//! Executes one planned action against the local mirror
//!
//! Clones are made in a hidden staging directory next to the target and
//! renamed into place, so the target path is either absent or a complete
//! clone. A reclone moves the old copy aside first and puts it back if the
//! fresh clone fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::git::{GitAuth, VersionControl};
use crate::policy::{Action, PlannedAction};
use crate::provider::Session;

const STAGING_SUFFIX: &str = "repofleet-tmp";
const ASIDE_SUFFIX: &str = "repofleet-old";

/// Runs planned actions through the version-control collaborator
pub struct ActionRunner {
    vcs: Arc<dyn VersionControl>,
    auth: GitAuth,
}

impl ActionRunner {
    pub fn new(vcs: Arc<dyn VersionControl>, session: &Session) -> Self {
        Self {
            vcs,
            auth: session.git_auth(),
        }
    }

    /// Perform one attempt of `planned`
    ///
    /// Each attempt leaves the target path as it found it or fully updated.
    pub async fn run(&self, planned: &PlannedAction) -> Result<(), SyncError> {
        match planned.action {
            Action::Skip => Ok(()),
            Action::Clone => self.clone_fresh(planned).await,
            Action::Pull => self.vcs.pull(&planned.local_path, &self.auth).await,
            Action::Reclone => self.reclone(planned).await,
        }
    }

    async fn clone_fresh(&self, planned: &PlannedAction) -> Result<(), SyncError> {
        let dest = &planned.local_path;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::fs(format!("cannot create {}", parent.display()), e))?;
        }

        clear_leftover(dest).await?;
        self.clone_into_place(planned).await
    }

    async fn clone_into_place(&self, planned: &PlannedAction) -> Result<(), SyncError> {
        let dest = &planned.local_path;
        let staging = sibling_path(dest, STAGING_SUFFIX)?;
        remove_if_exists(&staging).await?;

        let url = &planned.repository.clone_url;
        let branch = planned.repository.default_branch.as_deref();

        if let Err(e) = self.vcs.clone_repo(url, &staging, branch, &self.auth).await {
            if let Err(cleanup) = remove_if_exists(&staging).await {
                warn!("Failed to clean up {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&staging, dest).await {
            let _ = remove_if_exists(&staging).await;
            return Err(SyncError::fs(
                format!("cannot move clone into {}", dest.display()),
                e,
            ));
        }

        Ok(())
    }

    async fn reclone(&self, planned: &PlannedAction) -> Result<(), SyncError> {
        let dest = &planned.local_path;
        let aside = sibling_path(dest, ASIDE_SUFFIX)?;

        remove_if_exists(&aside).await?;
        tokio::fs::rename(dest, &aside).await.map_err(|e| {
            SyncError::fs(format!("cannot move {} aside", dest.display()), e)
        })?;

        match self.clone_into_place(planned).await {
            Ok(()) => {
                if let Err(e) = remove_if_exists(&aside).await {
                    warn!(
                        "Fresh clone in place but old copy remains at {}: {}",
                        aside.display(),
                        e
                    );
                }
                Ok(())
            }
            Err(e) => {
                debug!("Reclone of {} failed, restoring previous copy", dest.display());
                if let Err(restore) = tokio::fs::rename(&aside, dest).await {
                    return Err(SyncError::FileSystem(format!(
                        "{}; restoring previous copy from {} also failed: {}",
                        e,
                        aside.display(),
                        restore
                    )));
                }
                Err(e)
            }
        }
    }
}

/// Hidden sibling of `path` used for staging, e.g. `.api.repofleet-tmp`
fn sibling_path(path: &Path, suffix: &str) -> Result<PathBuf, SyncError> {
    let name = path.file_name().ok_or_else(|| {
        SyncError::Validation(format!("{} has no final path component", path.display()))
    })?;
    Ok(path.with_file_name(format!(".{}.{}", name.to_string_lossy(), suffix)))
}

async fn remove_if_exists(path: &Path) -> Result<(), SyncError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| SyncError::fs(format!("cannot remove {}", path.display()), e)),
        Ok(_) => tokio::fs::remove_file(path)
            .await
            .map_err(|e| SyncError::fs(format!("cannot remove {}", path.display()), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::fs(format!("cannot stat {}", path.display()), e)),
    }
}

/// Clear what a path classified as absent may still hold
///
/// Only an empty directory is removed. Anything else is someone's data and
/// fails the clone instead.
async fn clear_leftover(dest: &Path) -> Result<(), SyncError> {
    let meta = match tokio::fs::symlink_metadata(dest).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SyncError::fs(format!("cannot stat {}", dest.display()), e)),
    };

    if !meta.is_dir() {
        return Err(SyncError::FileSystem(format!(
            "{} exists and is not a directory",
            dest.display()
        )));
    }

    let mut entries = tokio::fs::read_dir(dest)
        .await
        .map_err(|e| SyncError::fs(format!("cannot read {}", dest.display()), e))?;
    let is_empty = entries
        .next_entry()
        .await
        .map_err(|e| SyncError::fs(format!("cannot read {}", dest.display()), e))?
        .is_none();

    if is_empty {
        debug!("Removing empty directory at {}", dest.display());
        return tokio::fs::remove_dir(dest)
            .await
            .map_err(|e| SyncError::fs(format!("cannot remove {}", dest.display()), e));
    }

    Err(SyncError::FileSystem(format!(
        "{} is not empty; refusing to clone over it",
        dest.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::policy::{LocalState, UpdateMode};
    use crate::provider::{Credentials, ProviderKind, RepositoryDescriptor};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes a marker file on clone; optionally fails every clone
    #[derive(Default)]
    struct DiskGit {
        fail_clone: Option<SyncError>,
        clones: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VersionControl for DiskGit {
        async fn clone_repo(
            &self,
            url: &str,
            dest: &Path,
            _branch: Option<&str>,
            auth: &GitAuth,
        ) -> Result<(), SyncError> {
            let seen = format!("{} as {} ({:?})", url, auth.username(), auth);
            self.clones.lock().unwrap().push(seen);
            std::fs::create_dir_all(dest.join(".git")).unwrap();
            if let Some(err) = &self.fail_clone {
                return Err(err.clone());
            }
            std::fs::write(dest.join("CONTENT"), "fresh").unwrap();
            Ok(())
        }

        async fn pull(&self, _path: &Path, _auth: &GitAuth) -> Result<(), SyncError> {
            Ok(())
        }

        async fn inspect(&self, _path: &Path) -> Result<LocalState, SyncError> {
            Ok(LocalState::Absent)
        }
    }

    fn planned(root: &Path, state: LocalState, mode: UpdateMode) -> PlannedAction {
        PlannedAction::new(
            RepositoryDescriptor {
                name: "api".into(),
                clone_url: "https://github.com/acme/api.git".into(),
                provider_kind: ProviderKind::GitHub,
                default_branch: Some("main".into()),
            },
            state,
            mode,
            root.join("api"),
        )
    }

    fn runner(git: Arc<DiskGit>) -> ActionRunner {
        let session = Session::new(ProviderKind::GitHub, Credentials::new(None, "tok"), None);
        ActionRunner::new(git, &session)
    }

    #[tokio::test]
    async fn test_clone_lands_complete_and_leaves_no_staging() {
        let root = TempDir::new().unwrap();
        let git = Arc::new(DiskGit::default());
        let action = planned(root.path(), LocalState::Absent, UpdateMode::Skip);

        runner(git.clone()).run(&action).await.unwrap();

        assert_eq!(std::fs::read_to_string(root.path().join("api/CONTENT")).unwrap(), "fresh");
        assert!(!root.path().join(".api.repofleet-tmp").exists());
    }

    #[tokio::test]
    async fn test_clone_url_is_passed_without_credentials() {
        let root = TempDir::new().unwrap();
        let git = Arc::new(DiskGit::default());
        let action = planned(root.path(), LocalState::Absent, UpdateMode::Skip);

        runner(git.clone()).run(&action).await.unwrap();

        let seen = git.clones.lock().unwrap()[0].clone();
        assert!(seen.starts_with("https://github.com/acme/api.git as x-access-token"));
        assert!(!seen.contains("tok@"));
        assert!(!seen.contains("\"tok\""));
    }

    #[tokio::test]
    async fn test_failed_clone_leaves_target_absent() {
        let root = TempDir::new().unwrap();
        let git = Arc::new(DiskGit {
            fail_clone: Some(SyncError::Connection("reset".into())),
            ..Default::default()
        });
        let action = planned(root.path(), LocalState::Absent, UpdateMode::Skip);

        let err = runner(git).run(&action).await.unwrap_err();

        assert_matches!(err, SyncError::Connection(_));
        assert!(!root.path().join("api").exists());
        assert!(!root.path().join(".api.repofleet-tmp").exists());
    }

    #[tokio::test]
    async fn test_reclone_replaces_existing_copy() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("api");
        std::fs::create_dir_all(dest.join(".git")).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        let action = planned(root.path(), LocalState::PresentClean, UpdateMode::Force);
        assert_eq!(action.action, Action::Reclone);

        runner(Arc::new(DiskGit::default())).run(&action).await.unwrap();

        assert!(!dest.join("stale.txt").exists());
        assert!(dest.join("CONTENT").exists());
        assert!(!root.path().join(".api.repofleet-old").exists());
    }

    #[tokio::test]
    async fn test_failed_reclone_restores_previous_copy() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("api");
        std::fs::create_dir_all(dest.join(".git")).unwrap();
        std::fs::write(dest.join("work.txt"), "keep me").unwrap();

        let git = Arc::new(DiskGit {
            fail_clone: Some(SyncError::RepositoryOperation("boom".into())),
            ..Default::default()
        });
        let action = planned(root.path(), LocalState::PresentDirty, UpdateMode::Force);

        let err = runner(git).run(&action).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RepositoryOperation);
        assert_eq!(std::fs::read_to_string(dest.join("work.txt")).unwrap(), "keep me");
        assert!(!root.path().join(".api.repofleet-old").exists());
    }

    #[tokio::test]
    async fn test_stale_staging_and_empty_target_are_cleared() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("api");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::create_dir_all(root.path().join(".api.repofleet-tmp/.git")).unwrap();

        let action = planned(root.path(), LocalState::Absent, UpdateMode::Pull);
        runner(Arc::new(DiskGit::default())).run(&action).await.unwrap();

        assert!(dest.join("CONTENT").exists());
    }

    #[tokio::test]
    async fn test_existing_repository_is_never_cleared_for_a_clone() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("api");
        std::fs::create_dir_all(dest.join(".git")).unwrap();
        std::fs::write(dest.join("work.txt"), "uncommitted").unwrap();

        let action = planned(root.path(), LocalState::Absent, UpdateMode::Skip);
        let err = runner(Arc::new(DiskGit::default())).run(&action).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FileSystem);
        assert_eq!(std::fs::read_to_string(dest.join("work.txt")).unwrap(), "uncommitted");
    }

    #[tokio::test]
    async fn test_unrelated_directory_is_not_overwritten() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("api");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("notes.txt"), "mine").unwrap();

        let action = planned(root.path(), LocalState::Absent, UpdateMode::Skip);
        let err = runner(Arc::new(DiskGit::default())).run(&action).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FileSystem);
        assert!(dest.join("notes.txt").exists());
    }

    #[test]
    fn test_sibling_paths_are_hidden() {
        assert_eq!(
            sibling_path(Path::new("/m/api"), STAGING_SUFFIX).unwrap(),
            PathBuf::from("/m/.api.repofleet-tmp")
        );
    }
}
