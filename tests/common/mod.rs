//! Common test utilities and fakes for repofleet integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use repofleet::provider::RepositoryStream;
use repofleet::{
    Credentials, GitAuth, LocalState, ProviderKind, RepositoryDescriptor, RepositoryProvider,
    Session, SyncError, VersionControl,
};

/// Token used by every fake session
pub const TOKEN: &str = "fake-pat-0123456789";

/// Test configuration helper
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
    pub original_env: Vec<(String, Option<String>)>,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("repofleet");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        // Store original environment variables
        let env_vars = vec!["AZURE_DEVOPS_PAT", "GITHUB_TOKEN", "XDG_CONFIG_HOME"];
        let original_env = env_vars
            .iter()
            .map(|var| (var.to_string(), env::var(var).ok()))
            .collect();

        Self {
            temp_dir,
            config_dir,
            original_env,
        }
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    pub fn create_minimal_config(&self) -> PathBuf {
        let config_content = format!(
            r#"
destination_root: "{}"
provider:
  kind: azure-devops
sync:
  concurrency: 2
  update_mode: skip
"#,
            self.temp_dir.path().join("mirror").display()
        );
        self.create_test_config(&config_content)
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        // Restore original environment variables
        for (key, value) in &self.original_env {
            match value {
                Some(val) => env::set_var(key, val),
                None => env::remove_var(key),
            }
        }
    }
}

pub fn descriptor(name: &str) -> RepositoryDescriptor {
    RepositoryDescriptor {
        name: name.to_string(),
        clone_url: format!("https://dev.azure.com/acme/platform/_git/{}", name),
        provider_kind: ProviderKind::AzureDevOps,
        default_branch: Some("main".to_string()),
    }
}

pub fn session() -> Session {
    Session::new(ProviderKind::AzureDevOps, Credentials::new(None, TOKEN), None)
}

/// Provider that lists a fixed set of repositories
pub struct StaticProvider {
    repositories: Vec<RepositoryDescriptor>,
    failure: Option<SyncError>,
}

impl StaticProvider {
    pub fn new(names: &[&str]) -> Self {
        Self {
            repositories: names.iter().map(|n| descriptor(n)).collect(),
            failure: None,
        }
    }

    pub fn failing(err: SyncError) -> Self {
        Self {
            repositories: Vec::new(),
            failure: Some(err),
        }
    }
}

#[async_trait]
impl RepositoryProvider for StaticProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureDevOps
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<Session, SyncError> {
        Ok(Session::new(self.kind(), credentials, None))
    }

    fn list_repositories<'a>(
        &'a self,
        _project: &'a str,
        _session: &'a Session,
    ) -> RepositoryStream<'a> {
        if let Some(err) = &self.failure {
            return stream::iter(vec![Err(err.clone())]).boxed();
        }
        stream::iter(self.repositories.iter().cloned().map(Ok)).boxed()
    }
}

/// Scripted in-memory version-control collaborator
///
/// Clones write a `.git` directory and a `CONTENT` file naming the
/// repository. Local state is whatever the test configured per repository
/// name, `Absent` otherwise.
#[derive(Default)]
pub struct FakeGit {
    states: Mutex<HashMap<String, LocalState>>,
    failures: Mutex<HashMap<String, VecDeque<SyncError>>>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every clone or pull sleeps this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every clone or pull waits for a permit from `gate` before finishing
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_state(self, name: &str, state: LocalState) -> Self {
        self.states.lock().unwrap().insert(name.to_string(), state);
        self
    }

    /// Fail the next operations on `name` with these errors, in order
    pub fn with_failures(self, name: &str, errors: Vec<SyncError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), errors.into());
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// `(operation, repository)` for every clone and pull, in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls().iter().filter(|(_, n)| n == name).count()
    }

    async fn operate(&self, operation: &str, name: &str) -> Result<(), SyncError> {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), name.to_string()));
        self.started.fetch_add(1, Ordering::SeqCst);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Repository name from a clone URL such as `https://host/org/_git/api`
fn name_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git")
        .to_string()
}

fn name_from_path(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl VersionControl for FakeGit {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        _branch: Option<&str>,
        _auth: &GitAuth,
    ) -> Result<(), SyncError> {
        let name = name_from_url(url);
        self.operate("clone", &name).await?;

        std::fs::create_dir_all(dest.join(".git")).unwrap();
        std::fs::write(dest.join("CONTENT"), format!("fresh clone of {}", name)).unwrap();
        Ok(())
    }

    async fn pull(&self, path: &Path, _auth: &GitAuth) -> Result<(), SyncError> {
        self.operate("pull", &name_from_path(path)).await
    }

    async fn inspect(&self, path: &Path) -> Result<LocalState, SyncError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(&name_from_path(path))
            .copied()
            .unwrap_or(LocalState::Absent))
    }
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
