use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    http_client, transport_error, with_clone_urls, Credentials, ProviderKind,
    RepositoryDescriptor, RepositoryProvider, RepositoryStream, Session,
};
use crate::error::{classify_status, SyncError};

const DEFAULT_BASE_URL: &str = "https://api.bitbucket.org";

/// BitBucket Cloud provider; the project identifier is a workspace slug
pub struct BitBucketProvider {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RepositoryPage {
    #[serde(default)]
    values: Vec<BitBucketRepository>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BitBucketRepository {
    name: String,
    #[serde(default)]
    mainbranch: Option<Branch>,
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Branch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Links {
    #[serde(default)]
    clone: Vec<CloneLink>,
}

#[derive(Debug, Deserialize)]
struct CloneLink {
    name: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl BitBucketProvider {
    pub fn new(base_url: Option<String>) -> Result<Self, SyncError> {
        Ok(Self {
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            http: http_client()?,
        })
    }

    fn request(&self, url: &str, credentials: &Credentials) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &credentials.username {
            Some(username) => request.basic_auth(username, Some(&credentials.token)),
            None => request.bearer_auth(&credentials.token),
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        session: &Session,
    ) -> Result<RepositoryPage, SyncError> {
        debug!("Fetching BitBucket page {}", url);

        let response = self
            .request(url, session.credentials())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Provider(format!("malformed BitBucket response: {}", e)))
    }
}

#[async_trait]
impl RepositoryProvider for BitBucketProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BitBucket
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<Session, SyncError> {
        let url = format!("{}/2.0/user", self.base_url);
        let response = self
            .request(&url, &credentials)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), "BitBucket rejected the credentials"));
        }

        let account: Account = response
            .json()
            .await
            .map_err(|e| SyncError::Provider(format!("malformed BitBucket response: {}", e)))?;
        let login = account.username.or(account.display_name);

        info!("Authenticated with BitBucket as {}", login.as_deref().unwrap_or("unknown"));
        Ok(Session::new(ProviderKind::BitBucket, credentials, login))
    }

    fn list_repositories<'a>(
        &'a self,
        project: &'a str,
        session: &'a Session,
    ) -> RepositoryStream<'a> {
        let first = format!("{}/2.0/repositories/{}?pagelen=100", self.base_url, project);

        // Follow `next` links until the workspace is exhausted
        let listed = stream::try_unfold(Some(first), move |next| async move {
            let Some(url) = next else {
                return Ok(None);
            };
            let page = self.fetch_page(&url, session).await?;
            Ok(Some((page.values, page.next)))
        })
        .map_ok(|repos| stream::iter(repos.into_iter().map(|r| Ok(to_descriptor(r)))))
        .try_flatten()
        .boxed();

        with_clone_urls(listed)
    }
}

fn to_descriptor(repo: BitBucketRepository) -> RepositoryDescriptor {
    let clone_url = repo
        .links
        .clone
        .into_iter()
        .find(|link| link.name == "https")
        .map(|link| link.href)
        .unwrap_or_default();

    RepositoryDescriptor {
        name: repo.name,
        clone_url,
        provider_kind: ProviderKind::BitBucket,
        default_branch: repo.mainbranch.map(|b| b.name),
    }
}
