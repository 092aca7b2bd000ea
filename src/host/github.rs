//! GitHub REST implementation of [`ReleaseHost`].

use std::io;

use camino::Utf8Path;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::types::{CreatedReleasePayload, ReleasePayload, UploadedAssetPayload};
use super::{
    AssetDescriptor, AssetHandle, AssetLocator, DestinationRelease, HostFuture, NewRelease,
    ReleaseDescriptor, ReleaseHost, ReleaseHostError,
};
use crate::config::{ConfigError, MirrorConfig};
use crate::source::RepoId;

/// REST API version pinned on every request.
pub const API_VERSION: &str = "2022-11-28";
/// User agent sent on every request.
pub const USER_AGENT: &str = "tagmirror";

const JSON_ACCEPT: &str = "application/vnd.github+json";
const OCTET_STREAM: &str = "application/octet-stream";

/// Authenticated GitHub client.
#[derive(Clone, Debug)]
pub struct GithubClient {
    http: Client,
    api_base: String,
}

impl GithubClient {
    /// Builds a client for `api_base` authenticated with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the token cannot be used as a header
    /// value or the HTTP client cannot be constructed.
    pub fn new(token: &str, api_base: &str) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|err| ConfigError::Parse(format!("invalid github_token: {err}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_ACCEPT));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static(API_VERSION),
        );
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|err| ConfigError::Parse(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_owned(),
        })
    }

    /// Builds a client from loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no token is configured.
    pub fn from_config(config: &MirrorConfig) -> Result<Self, ConfigError> {
        let token = config.require_token()?;
        Self::new(token, &config.api_base)
    }

    fn releases_url(&self, repo: &RepoId) -> String {
        format!(
            "{}/repos/{}/{}/releases",
            self.api_base,
            repo.owner(),
            repo.name()
        )
    }

    async fn get(&self, url: &str) -> Result<Response, ReleaseHostError> {
        self.http
            .get(url)
            .send()
            .await
            .map_err(|err| read_error(url, &err.to_string()))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        url: &str,
        response: Response,
    ) -> Result<T, ReleaseHostError> {
        response
            .json::<T>()
            .await
            .map_err(|err| read_error(url, &format!("invalid response body: {err}")))
    }

    async fn fetch_latest(
        &self,
        repo: &RepoId,
    ) -> Result<Option<ReleaseDescriptor>, ReleaseHostError> {
        let latest_url = format!("{}/latest", self.releases_url(repo));
        let response = self.get(&latest_url).await?;
        match response.status() {
            status if status.is_success() => {
                let payload: ReleasePayload = Self::read_json(&latest_url, response).await?;
                return Ok(Some(payload.into()));
            }
            StatusCode::NOT_FOUND => {
                debug!(repo = %repo, "no stable release; falling back to newest release");
            }
            status => return Err(status_error(&latest_url, status, response, read_error).await),
        }

        let list_url = format!("{}?per_page=1", self.releases_url(repo));
        let listing = self.get(&list_url).await?;
        let status = listing.status();
        if !status.is_success() {
            return Err(status_error(&list_url, status, listing, read_error).await);
        }
        let payloads: Vec<ReleasePayload> = Self::read_json(&list_url, listing).await?;
        Ok(payloads.into_iter().next().map(ReleaseDescriptor::from))
    }

    async fn tag_exists(&self, repo: &RepoId, tag: &str) -> Result<bool, ReleaseHostError> {
        let url = release_tag_url(&self.releases_url(repo), tag)?;
        let response = self.get(&url).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(&url, status, response, read_error).await),
        }
    }

    async fn post_release(
        &self,
        repo: &RepoId,
        release: &NewRelease,
    ) -> Result<DestinationRelease, ReleaseHostError> {
        let url = self.releases_url(repo);
        let response = self
            .http
            .post(&url)
            .json(release)
            .send()
            .await
            .map_err(|err| write_error(&url, &err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&url, status, response, write_error).await);
        }
        let payload: CreatedReleasePayload = response
            .json()
            .await
            .map_err(|err| write_error(&url, &format!("invalid response body: {err}")))?;
        let created = DestinationRelease::from(payload);
        info!(tag = %created.tag, url = ?created.html_url, "created destination release");
        Ok(created)
    }

    async fn post_asset(
        &self,
        release: &DestinationRelease,
        file: &Utf8Path,
    ) -> Result<AssetHandle, ReleaseHostError> {
        let url = release.upload_url.clone();
        let name = file
            .file_name()
            .ok_or_else(|| write_error(&url, &format!("{file} has no file name")))?;
        let handle = tokio::fs::File::open(file)
            .await
            .map_err(|err| write_error(&url, &format!("failed to open {file}: {err}")))?;
        let length = handle
            .metadata()
            .await
            .map_err(|err| write_error(&url, &format!("failed to stat {file}: {err}")))?
            .len();

        let response = self
            .http
            .post(&url)
            .query(&[("name", name)])
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::from(handle))
            .send()
            .await
            .map_err(|err| write_error(&url, &err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&url, status, response, write_error).await);
        }
        let payload: UploadedAssetPayload = response
            .json()
            .await
            .map_err(|err| write_error(&url, &format!("invalid response body: {err}")))?;
        Ok(payload.into())
    }

    async fn stream_asset(
        &self,
        asset: &AssetDescriptor,
        destination: &Utf8Path,
    ) -> Result<u64, ReleaseHostError> {
        let url = asset.locator.url();
        let mut request = self.http.get(url);
        if matches!(asset.locator, AssetLocator::ApiContent(_)) {
            request = request.header(ACCEPT, OCTET_STREAM);
        }
        let mut response = request
            .send()
            .await
            .map_err(|err| fetch_error(url, &err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status, response, fetch_error).await);
        }

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|err| local_write_error(url, destination, &err))?;
        let mut written = 0_u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| fetch_error(url, &err.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| local_write_error(url, destination, &err))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| local_write_error(url, destination, &err))?;
        Ok(written)
    }
}

impl ReleaseHost for GithubClient {
    fn latest_release<'a>(
        &'a self,
        repo: &'a RepoId,
    ) -> HostFuture<'a, Option<ReleaseDescriptor>> {
        Box::pin(self.fetch_latest(repo))
    }

    fn release_exists<'a>(&'a self, repo: &'a RepoId, tag: &'a str) -> HostFuture<'a, bool> {
        Box::pin(self.tag_exists(repo, tag))
    }

    fn create_release<'a>(
        &'a self,
        repo: &'a RepoId,
        release: &'a NewRelease,
    ) -> HostFuture<'a, DestinationRelease> {
        Box::pin(self.post_release(repo, release))
    }

    fn upload_asset<'a>(
        &'a self,
        release: &'a DestinationRelease,
        file: &'a Utf8Path,
    ) -> HostFuture<'a, AssetHandle> {
        Box::pin(self.post_asset(release, file))
    }

    fn download_asset<'a>(
        &'a self,
        asset: &'a AssetDescriptor,
        destination: &'a Utf8Path,
    ) -> HostFuture<'a, u64> {
        Box::pin(self.stream_asset(asset, destination))
    }
}

/// Appends `tags/<tag>` to `releases_url`, percent-encoding the tag so
/// separators inside it stay within one path segment.
pub(super) fn release_tag_url(releases_url: &str, tag: &str) -> Result<String, ReleaseHostError> {
    let mut url = Url::parse(releases_url)
        .map_err(|err| read_error(releases_url, &format!("invalid API URL: {err}")))?;
    url.path_segments_mut()
        .map_err(|()| read_error(releases_url, "API URL cannot carry path segments"))?
        .push("tags")
        .push(tag);
    Ok(url.into())
}

fn read_error(url: &str, message: &str) -> ReleaseHostError {
    ReleaseHostError::Read {
        url: url.to_owned(),
        message: message.to_owned(),
    }
}

fn write_error(url: &str, message: &str) -> ReleaseHostError {
    ReleaseHostError::Write {
        url: url.to_owned(),
        message: message.to_owned(),
    }
}

fn fetch_error(url: &str, message: &str) -> ReleaseHostError {
    ReleaseHostError::Fetch {
        url: url.to_owned(),
        message: message.to_owned(),
    }
}

fn local_write_error(url: &str, path: &Utf8Path, err: &io::Error) -> ReleaseHostError {
    if matches!(
        err.kind(),
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
    ) {
        ReleaseHostError::StorageFull {
            path: path.to_owned(),
            message: err.to_string(),
        }
    } else {
        fetch_error(url, &format!("failed to write {path}: {err}"))
    }
}

async fn status_error(
    url: &str,
    status: StatusCode,
    response: Response,
    build: fn(&str, &str) -> ReleaseHostError,
) -> ReleaseHostError {
    let body = response.text().await.unwrap_or_default();
    let detail = body.trim();
    if detail.is_empty() {
        build(url, &format!("HTTP {status}"))
    } else {
        build(url, &format!("HTTP {status}: {detail}"))
    }
}
