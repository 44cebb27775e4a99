use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use octocrab::models::Repository;
use octocrab::Octocrab;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    with_clone_urls, Credentials, ProviderKind, RepositoryDescriptor, RepositoryProvider,
    RepositoryStream, Session,
};
use crate::error::{classify_status, SyncError};

const PER_PAGE: u8 = 100;

/// GitHub provider; the project identifier is an organization or user login
pub struct GitHubProvider {
    base_url: Option<String>,
}

/// Whose repositories are being paged through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Organization,
    User,
}

struct PageState {
    client: Octocrab,
    login: String,
    owner: Owner,
    page: u8,
    done: bool,
}

#[derive(Serialize)]
struct PageParams {
    per_page: u8,
    page: u8,
}

impl GitHubProvider {
    pub fn new(base_url: Option<String>) -> Self {
        Self { base_url }
    }

    fn client(&self, token: &str) -> Result<Octocrab, SyncError> {
        let mut builder = Octocrab::builder().personal_token(token.to_string());

        if let Some(base_url) = &self.base_url {
            builder = builder.base_uri(base_url.as_str()).map_err(|e| {
                SyncError::Configuration(format!("invalid GitHub API URL '{}': {}", base_url, e))
            })?;
        }

        builder
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to create GitHub client: {}", e)))
    }

    async fn fetch_page(state: &PageState) -> Result<Vec<Repository>, SyncError> {
        match state.owner {
            Owner::Organization => state
                .client
                .orgs(state.login.as_str())
                .list_repos()
                .per_page(PER_PAGE)
                .page(state.page)
                .send()
                .await
                .map(|page| page.items)
                .map_err(octocrab_error),
            Owner::User => state
                .client
                .get::<Vec<Repository>, _, _>(
                    format!("/users/{}/repos", state.login),
                    Some(&PageParams {
                        per_page: PER_PAGE,
                        page: state.page,
                    }),
                )
                .await
                .map_err(octocrab_error),
        }
    }

    async fn next_page(
        mut state: PageState,
    ) -> Result<Option<(Vec<Repository>, PageState)>, SyncError> {
        if state.done {
            return Ok(None);
        }

        debug!("Fetching {:?} repositories for {} page {}", state.owner, state.login, state.page);

        let items = match Self::fetch_page(&state).await {
            // Not an organization: the identifier may be a user login
            Err(SyncError::ProjectNotFound(_))
                if state.owner == Owner::Organization && state.page == 1 =>
            {
                debug!("{} is not an organization, listing user repositories", state.login);
                state.owner = Owner::User;
                Self::fetch_page(&state).await?
            }
            other => other?,
        };

        if items.len() < PER_PAGE as usize {
            state.done = true;
        } else if state.page == u8::MAX {
            warn!("Reached maximum pagination limit (255 pages) for {}", state.login);
            state.done = true;
        } else {
            state.page += 1;
        }

        Ok(Some((items, state)))
    }
}

#[async_trait]
impl RepositoryProvider for GitHubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<Session, SyncError> {
        let client = self.client(&credentials.token)?;

        let user = client.current().user().await.map_err(octocrab_error)?;

        info!("Authenticated as GitHub user: {}", user.login);
        Ok(Session::new(ProviderKind::GitHub, credentials, Some(user.login)))
    }

    fn list_repositories<'a>(
        &'a self,
        project: &'a str,
        session: &'a Session,
    ) -> RepositoryStream<'a> {
        let client = match self.client(&session.credentials().token) {
            Ok(client) => client,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let state = PageState {
            client,
            login: project.to_string(),
            owner: Owner::Organization,
            page: 1,
            done: false,
        };

        let listed = stream::try_unfold(state, Self::next_page)
            .map_ok(|repos| stream::iter(repos.into_iter().map(|r| Ok(to_descriptor(r)))))
            .try_flatten()
            .boxed();

        with_clone_urls(listed)
    }
}

fn to_descriptor(repo: Repository) -> RepositoryDescriptor {
    RepositoryDescriptor {
        clone_url: repo
            .clone_url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_default(),
        name: repo.name,
        provider_kind: ProviderKind::GitHub,
        default_branch: repo.default_branch,
    }
}

fn octocrab_error(err: octocrab::Error) -> SyncError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            classify_status(source.status_code.as_u16(), source.message.clone())
        }
        octocrab::Error::Serde { .. } | octocrab::Error::Json { .. } => {
            SyncError::Provider(format!("malformed GitHub response: {}", err))
        }
        _ => SyncError::Connection(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_api_repository() {
        let repo: Repository = serde_json::from_value(serde_json::json!({
            "id": 1296269,
            "name": "Hello-World",
            "full_name": "octocat/Hello-World",
            "url": "https://api.github.com/repos/octocat/Hello-World",
            "clone_url": "https://github.com/octocat/Hello-World.git",
            "default_branch": "main"
        }))
        .unwrap();

        let descriptor = to_descriptor(repo);
        assert_eq!(descriptor.name, "Hello-World");
        assert_eq!(descriptor.clone_url, "https://github.com/octocat/Hello-World.git");
        assert_eq!(descriptor.default_branch.as_deref(), Some("main"));
        assert_eq!(descriptor.provider_kind, ProviderKind::GitHub);
    }

    #[test]
    fn test_missing_clone_url_becomes_empty() {
        let repo: Repository = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "bare",
            "url": "https://api.github.com/repos/octocat/bare"
        }))
        .unwrap();

        assert!(to_descriptor(repo).clone_url.is_empty());
    }
}
