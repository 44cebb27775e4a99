//! Repository listing abstraction over the supported hosting providers
//!
//! Every provider lists the repositories of one project identifier as a lazy,
//! paged stream of [`RepositoryDescriptor`]s. Providers never yield a
//! descriptor without a clone URL, and they surface failures through the
//! shared [`SyncError`] taxonomy: `Connection` for transient failures,
//! `Provider` for responses that make no sense.

pub mod azure;
pub mod bitbucket;
pub mod github;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::SyncError;
use crate::git::GitAuth;

pub use azure::AzureDevOpsProvider;
pub use bitbucket::BitBucketProvider;
pub use github::GitHubProvider;

/// Supported hosting providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "azure-devops")]
    AzureDevOps,
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "bitbucket")]
    BitBucket,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::AzureDevOps => "azure-devops",
            ProviderKind::GitHub => "github",
            ProviderKind::BitBucket => "bitbucket",
        }
    }

    /// Environment variable holding the access token when none is configured
    pub fn default_token_env(&self) -> &'static str {
        match self {
            ProviderKind::AzureDevOps => "AZURE_DEVOPS_PAT",
            ProviderKind::GitHub => "GITHUB_TOKEN",
            ProviderKind::BitBucket => "BITBUCKET_APP_PASSWORD",
        }
    }

    /// Environment variable holding the account name, for providers that need one
    pub fn default_username_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::BitBucket => Some("BITBUCKET_USERNAME"),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "azure-devops" | "azure" | "ado" => Ok(ProviderKind::AzureDevOps),
            "github" | "gh" => Ok(ProviderKind::GitHub),
            "bitbucket" | "bb" => Ok(ProviderKind::BitBucket),
            other => Err(SyncError::Configuration(format!(
                "unknown provider '{}' (expected azure-devops, github or bitbucket)",
                other
            ))),
        }
    }
}

/// A repository as listed by a provider. Read-only once listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub name: String,
    pub clone_url: String,
    pub provider_kind: ProviderKind,
    pub default_branch: Option<String>,
}

/// Raw credentials as supplied by the environment
#[derive(Clone)]
pub struct Credentials {
    pub username: Option<String>,
    pub token: String,
}

impl Credentials {
    pub fn new(username: Option<String>, token: impl Into<String>) -> Self {
        Self {
            username,
            token: token.into(),
        }
    }

    /// Read credentials for `kind` from the environment
    pub fn from_env(
        kind: ProviderKind,
        token_env: Option<&str>,
        username_env: Option<&str>,
    ) -> Result<Self, SyncError> {
        let token_var = token_env.unwrap_or_else(|| kind.default_token_env());
        let token = std::env::var(token_var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                SyncError::Authentication(format!(
                    "no {} credentials found; set the {} environment variable",
                    kind, token_var
                ))
            })?;

        let username = username_env
            .or_else(|| kind.default_username_env())
            .and_then(|var| std::env::var(var).ok())
            .filter(|u| !u.trim().is_empty());

        Ok(Self::new(username, token.trim()))
    }

    /// Values that must never appear in emitted text
    pub fn secrets(&self) -> Vec<String> {
        vec![self.token.clone()]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"***")
            .finish()
    }
}

/// Authenticated provider session
///
/// Opaque to the sync engine; only the provider and the clone step look inside.
#[derive(Clone)]
pub struct Session {
    kind: ProviderKind,
    credentials: Credentials,
    account: Option<String>,
}

impl Session {
    pub fn new(kind: ProviderKind, credentials: Credentials, account: Option<String>) -> Self {
        Self {
            kind,
            credentials,
            account,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Account the session was authenticated as, when the provider reports one
    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub(crate) fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Credentials git presents when cloning or pulling over HTTPS
    pub fn git_auth(&self) -> GitAuth {
        let username = match self.kind {
            ProviderKind::GitHub => "x-access-token".to_string(),
            ProviderKind::AzureDevOps => "pat".to_string(),
            ProviderKind::BitBucket => self
                .credentials
                .username
                .clone()
                .unwrap_or_else(|| "x-token-auth".to_string()),
        };
        GitAuth::new(username, self.credentials.token.clone())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Lazy sequence of listed repositories
pub type RepositoryStream<'a> = BoxStream<'a, Result<RepositoryDescriptor, SyncError>>;

/// Uniform listing contract implemented by every provider
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Exchange raw credentials for a session
    async fn authenticate(&self, credentials: Credentials) -> Result<Session, SyncError>;

    /// List every repository of `project`
    ///
    /// The stream is finite and pages on demand. It cannot be resumed; call
    /// again with the same identifier to start over.
    fn list_repositories<'a>(&'a self, project: &'a str, session: &'a Session)
        -> RepositoryStream<'a>;
}

/// The fixed set of supported providers behind one interface
pub enum Provider {
    AzureDevOps(AzureDevOpsProvider),
    GitHub(GitHubProvider),
    BitBucket(BitBucketProvider),
}

impl Provider {
    /// Create a provider of `kind`, optionally against a non-default API base URL
    pub fn new(kind: ProviderKind, base_url: Option<String>) -> Result<Self, SyncError> {
        Ok(match kind {
            ProviderKind::AzureDevOps => {
                Provider::AzureDevOps(AzureDevOpsProvider::new(base_url)?)
            }
            ProviderKind::GitHub => Provider::GitHub(GitHubProvider::new(base_url)),
            ProviderKind::BitBucket => Provider::BitBucket(BitBucketProvider::new(base_url)?),
        })
    }

    fn inner(&self) -> &dyn RepositoryProvider {
        match self {
            Provider::AzureDevOps(p) => p,
            Provider::GitHub(p) => p,
            Provider::BitBucket(p) => p,
        }
    }
}

#[async_trait]
impl RepositoryProvider for Provider {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<Session, SyncError> {
        self.inner().authenticate(credentials).await
    }

    fn list_repositories<'a>(
        &'a self,
        project: &'a str,
        session: &'a Session,
    ) -> RepositoryStream<'a> {
        self.inner().list_repositories(project, session)
    }
}

/// Drop descriptors without a usable clone URL
pub(crate) fn with_clone_urls(stream: RepositoryStream<'_>) -> RepositoryStream<'_> {
    stream
        .filter(|item| {
            let keep = match item {
                Ok(repo) if repo.clone_url.trim().is_empty() => {
                    warn!(repository = %repo.name, "Skipping repository without a clone URL");
                    false
                }
                _ => true,
            };
            futures::future::ready(keep)
        })
        .boxed()
}

pub(crate) fn http_client() -> Result<reqwest::Client, SyncError> {
    reqwest::Client::builder()
        .user_agent(concat!("repofleet/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .map_err(|e| SyncError::Configuration(format!("failed to build HTTP client: {}", e)))
}

/// Map a reqwest transport failure onto the taxonomy
pub(crate) fn transport_error(err: reqwest::Error) -> SyncError {
    if let Some(status) = err.status() {
        return crate::error::classify_status(status.as_u16(), err.to_string());
    }
    if err.is_decode() {
        return SyncError::Provider(format!("malformed response: {}", err));
    }
    SyncError::Connection(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn session(kind: ProviderKind) -> Session {
        Session::new(
            kind,
            Credentials::new(Some("alice".into()), "tok3n"),
            None,
        )
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("azure-devops".parse::<ProviderKind>().unwrap(), ProviderKind::AzureDevOps);
        assert_eq!("GitHub".parse::<ProviderKind>().unwrap(), ProviderKind::GitHub);
        assert_eq!("bb".parse::<ProviderKind>().unwrap(), ProviderKind::BitBucket);
        assert!("gitlab".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_debug_output_hides_token() {
        let s = session(ProviderKind::GitHub);
        assert!(!format!("{:?}", s).contains("tok3n"));
        assert!(!format!("{:?}", s.credentials()).contains("tok3n"));
    }

    #[test]
    fn test_git_user_per_provider() {
        assert_eq!(session(ProviderKind::GitHub).git_auth().username(), "x-access-token");
        assert_eq!(session(ProviderKind::AzureDevOps).git_auth().username(), "pat");
        assert_eq!(session(ProviderKind::BitBucket).git_auth().username(), "alice");

        let anonymous = Session::new(ProviderKind::BitBucket, Credentials::new(None, "t"), None);
        assert_eq!(anonymous.git_auth().username(), "x-token-auth");
    }

    #[tokio::test]
    async fn test_empty_clone_urls_are_never_yielded() {
        let repo = |name: &str, url: &str| {
            Ok(RepositoryDescriptor {
                name: name.into(),
                clone_url: url.into(),
                provider_kind: ProviderKind::GitHub,
                default_branch: None,
            })
        };
        let listed = stream::iter(vec![
            repo("a", "https://h/a"),
            repo("b", " "),
            repo("c", "https://h/c"),
        ]);

        let names: Vec<String> = with_clone_urls(listed.boxed())
            .map(|r| r.unwrap().name)
            .collect()
            .await;
        assert_eq!(names, vec!["a", "c"]);
    }
}
