use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::masking::SecretMasker;
use crate::policy::LocalState;

const USERNAME_ENV: &str = "REPOFLEET_GIT_USERNAME";
const TOKEN_ENV: &str = "REPOFLEET_GIT_TOKEN";

/// Inline credential helper answering `get` from the two variables above
const CREDENTIAL_HELPER: &str = "credential.helper=!f() { test \"$1\" = get || exit 0; \
    echo \"username=${REPOFLEET_GIT_USERNAME}\"; echo \"password=${REPOFLEET_GIT_TOKEN}\"; }; f";

/// Credentials for one git invocation
///
/// They reach git through the environment of the child process and an
/// inline credential helper, so they never show up in its arguments, in
/// the remote URL or in the cloned repository's configuration.
#[derive(Clone)]
pub struct GitAuth {
    username: String,
    token: String,
}

impl GitAuth {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitAuth")
            .field("username", &self.username)
            .field("token", &"***")
            .finish()
    }
}

/// `-c` options that replace any configured helper with the inline one
///
/// Clearing the list first keeps a user's `store` helper from writing the
/// token to disk.
fn credential_args() -> [&'static str; 4] {
    ["-c", "credential.helper=", "-c", CREDENTIAL_HELPER]
}

/// Version-control collaborator used by the sync engine
///
/// Implementations report transient network trouble as
/// [`SyncError::Connection`] so callers can retry it, and every other git
/// failure as [`SyncError::RepositoryOperation`].
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone `url` into `dest`, which must not exist yet
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        branch: Option<&str>,
        auth: &GitAuth,
    ) -> Result<(), SyncError>;

    /// Fast-forward an existing work tree from its upstream
    async fn pull(&self, path: &Path, auth: &GitAuth) -> Result<(), SyncError>;

    /// Classify what is on disk at `path`
    ///
    /// A git repository that cannot be read is an error, never `Absent`.
    async fn inspect(&self, path: &Path) -> Result<LocalState, SyncError>;
}

/// [`VersionControl`] backed by the `git` command line
pub struct GitCli {
    timeout: Duration,
    masker: Arc<SecretMasker>,
}

impl GitCli {
    pub fn new(timeout: Duration, masker: Arc<SecretMasker>) -> Self {
        Self { timeout, masker }
    }

    async fn run_git(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        auth: Option<&GitAuth>,
    ) -> Result<Output, SyncError> {
        let mut command = AsyncCommand::new("git");
        if let Some(auth) = auth {
            command
                .args(credential_args())
                .env(USERNAME_ENV, &auth.username)
                .env(TOKEN_ENV, &auth.token);
        }
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(SyncError::RepositoryOperation(format!(
                "failed to execute git {}: {}",
                args.first().unwrap_or(&""),
                e
            ))),
            Err(_) => Err(SyncError::Connection(format!(
                "git {} timed out after {}s",
                args.first().unwrap_or(&""),
                self.timeout.as_secs()
            ))),
        }
    }

    fn stderr(&self, output: &Output) -> String {
        let stderr = String::from_utf8_lossy(&output.stderr);
        self.masker.mask(stderr.trim()).into_owned()
    }

    fn failure(&self, operation: &str, output: &Output) -> SyncError {
        classify_git_failure(operation, &self.stderr(output))
    }

    async fn has_upstream_divergence(&self, path: &Path) -> Result<bool, SyncError> {
        let output = self
            .run_git(&["rev-list", "--count", "@{upstream}..HEAD"], Some(path), None)
            .await?;

        if !output.status.success() {
            // No upstream configured: nothing to compare against
            return Ok(true);
        }

        let count = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u32>()
            .unwrap_or(0);
        Ok(count > 0)
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        branch: Option<&str>,
        auth: &GitAuth,
    ) -> Result<(), SyncError> {
        let dest_str = dest.to_string_lossy();
        let mut args = vec!["clone", "--quiet"];
        if let Some(branch) = branch {
            args.extend(["--branch", branch]);
        }
        args.extend(["--", url, dest_str.as_ref()]);

        debug!("Running git clone into {}", dest.display());

        let output = self.run_git(&args, None, Some(auth)).await?;
        if !output.status.success() {
            return Err(self.failure("clone", &output));
        }
        Ok(())
    }

    async fn pull(&self, path: &Path, auth: &GitAuth) -> Result<(), SyncError> {
        debug!("Running git pull in {}", path.display());

        let output = self
            .run_git(&["pull", "--ff-only", "--quiet"], Some(path), Some(auth))
            .await?;
        if !output.status.success() {
            return Err(self.failure("pull", &output));
        }
        Ok(())
    }

    async fn inspect(&self, path: &Path) -> Result<LocalState, SyncError> {
        if !path.exists() || !path.join(".git").exists() {
            return Ok(LocalState::Absent);
        }

        let status = self
            .run_git(&["status", "--porcelain"], Some(path), None)
            .await?;
        if !status.status.success() {
            let stderr = self.stderr(&status);
            warn!("{} is a git repository git cannot read: {}", path.display(), stderr);
            return Err(SyncError::RepositoryOperation(format!(
                "cannot read repository at {}, leaving it untouched: {}",
                path.display(),
                stderr
            )));
        }

        if !status.stdout.is_empty() || self.has_upstream_divergence(path).await? {
            return Ok(LocalState::PresentDirty);
        }

        Ok(LocalState::PresentClean)
    }
}

const CONNECTION_MARKERS: &[&str] = &[
    "could not resolve host",
    "connection timed out",
    "operation timed out",
    "connection reset",
    "connection refused",
    "failed to connect",
    "early eof",
    "the remote end hung up unexpectedly",
    "rpc failed",
    "tls connection was non-properly terminated",
    "gnutls_handshake",
    "http 500",
    "http 502",
    "http 503",
    "http 504",
    "returned error: 5",
];

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "permission denied",
    "returned error: 401",
    "returned error: 403",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "repository not found",
    "does not appear to be a git repository",
];

/// Classify git's stderr into the error taxonomy
pub fn classify_git_failure(operation: &str, stderr: &str) -> SyncError {
    let lowered = stderr.to_lowercase();
    let message = format!("git {} failed: {}", operation, stderr);

    if CONNECTION_MARKERS.iter().any(|m| lowered.contains(m)) {
        SyncError::Connection(message)
    } else if AUTH_MARKERS.iter().any(|m| lowered.contains(m)) {
        SyncError::Authentication(message)
    } else if NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m)) {
        SyncError::ProjectNotFound(message)
    } else {
        SyncError::RepositoryOperation(message)
    }
}
