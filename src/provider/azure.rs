use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::debug;

use super::{
    http_client, transport_error, with_clone_urls, Credentials, ProviderKind,
    RepositoryDescriptor, RepositoryProvider, RepositoryStream, Session,
};
use crate::error::{classify_status, SyncError};

const DEFAULT_BASE_URL: &str = "https://dev.azure.com";
const API_VERSION: &str = "7.0";

/// Azure DevOps provider; the project identifier is `organization/project`
pub struct AzureDevOpsProvider {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RepositoryList {
    value: Vec<AzureRepository>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureRepository {
    name: String,
    #[serde(default)]
    remote_url: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    is_disabled: bool,
}

impl AzureDevOpsProvider {
    pub fn new(base_url: Option<String>) -> Result<Self, SyncError> {
        Ok(Self {
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            http: http_client()?,
        })
    }

    fn split_project(project: &str) -> Result<(&str, &str), SyncError> {
        match project.split_once('/') {
            Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok((org, name))
            }
            _ => Err(SyncError::Validation(format!(
                "Azure DevOps project must be given as 'organization/project', got '{}'",
                project
            ))),
        }
    }

    async fn fetch(
        &self,
        project: &str,
        session: &Session,
    ) -> Result<Vec<RepositoryDescriptor>, SyncError> {
        let (org, name) = Self::split_project(project)?;
        let url = format!(
            "{}/{}/{}/_apis/git/repositories?api-version={}",
            self.base_url, org, name, API_VERSION
        );

        debug!("Listing Azure DevOps repositories for {}/{}", org, name);

        let response = self
            .http
            .get(&url)
            .basic_auth("", Some(&session.credentials().token))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let list: RepositoryList = response.json().await.map_err(|e| {
            SyncError::Provider(format!("malformed Azure DevOps response: {}", e))
        })?;

        Ok(list
            .value
            .into_iter()
            .filter(|repo| {
                if repo.is_disabled {
                    debug!("Skipping disabled repository {}", repo.name);
                }
                !repo.is_disabled
            })
            .map(|repo| RepositoryDescriptor {
                name: repo.name,
                clone_url: repo.remote_url.unwrap_or_default(),
                provider_kind: ProviderKind::AzureDevOps,
                default_branch: repo
                    .default_branch
                    .map(|b| b.trim_start_matches("refs/heads/").to_string()),
            })
            .collect())
    }
}

#[async_trait]
impl RepositoryProvider for AzureDevOpsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureDevOps
    }

    /// The PAT is only checked on first use, as it is scoped per organization
    async fn authenticate(&self, credentials: Credentials) -> Result<Session, SyncError> {
        if credentials.token.trim().is_empty() {
            return Err(SyncError::Authentication(
                "Azure DevOps personal access token is empty".to_string(),
            ));
        }
        Ok(Session::new(ProviderKind::AzureDevOps, credentials, None))
    }

    fn list_repositories<'a>(
        &'a self,
        project: &'a str,
        session: &'a Session,
    ) -> RepositoryStream<'a> {
        // The repositories endpoint is not paged: one request returns them all
        let listed = stream::once(self.fetch(project, session))
            .map_ok(|repos| stream::iter(repos.into_iter().map(Ok)))
            .try_flatten()
            .boxed();

        with_clone_urls(listed)
    }
}
