//! Release hosting abstraction.
//!
//! [`ReleaseHost`] is the narrow interface the orchestrator uses to read
//! upstream releases, create destination releases, attach assets, and fetch
//! asset bodies. [`GithubClient`] implements it over the GitHub REST API.

mod github;
mod types;

use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::source::RepoId;

pub use github::{API_VERSION, GithubClient, USER_AGENT};
pub use types::{
    AssetDescriptor, AssetHandle, AssetLocator, DestinationRelease, NewRelease,
    ReleaseDescriptor, sanitize_asset_name,
};

/// Future returned by host operations.
pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ReleaseHostError>> + Send + 'a>>;

/// Errors raised by release hosts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReleaseHostError {
    /// Raised when a read request fails or returns a non-success status.
    #[error("failed to read {url}: {message}")]
    Read {
        /// Requested URL.
        url: String,
        /// Status or transport message.
        message: String,
    },
    /// Raised when a create or upload request is rejected.
    #[error("failed to write {url}: {message}")]
    Write {
        /// Requested URL.
        url: String,
        /// Status or transport message.
        message: String,
    },
    /// Raised when an asset body cannot be fetched or stored.
    #[error("failed to fetch {url}: {message}")]
    Fetch {
        /// Asset URL.
        url: String,
        /// Status, transport, or I/O message.
        message: String,
    },
    /// Raised when local storage runs out while writing an asset.
    #[error("local storage exhausted while writing {path}: {message}")]
    StorageFull {
        /// Local file being written.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl ReleaseHostError {
    /// Returns `true` for local storage exhaustion.
    #[must_use]
    pub const fn is_storage_full(&self) -> bool {
        matches!(self, Self::StorageFull { .. })
    }
}

/// Minimal interface implemented by release hosting platforms.
pub trait ReleaseHost {
    /// Resolves the most recent release, falling back to the newest release
    /// of any kind. Returns `None` when the repository has no releases.
    fn latest_release<'a>(&'a self, repo: &'a RepoId)
    -> HostFuture<'a, Option<ReleaseDescriptor>>;

    /// Returns `true` when a release tagged `tag` exists in `repo`.
    fn release_exists<'a>(&'a self, repo: &'a RepoId, tag: &'a str) -> HostFuture<'a, bool>;

    /// Creates a release in `repo`.
    fn create_release<'a>(
        &'a self,
        repo: &'a RepoId,
        release: &'a NewRelease,
    ) -> HostFuture<'a, DestinationRelease>;

    /// Attaches `file` to `release`, naming the asset after the file.
    fn upload_asset<'a>(
        &'a self,
        release: &'a DestinationRelease,
        file: &'a Utf8Path,
    ) -> HostFuture<'a, AssetHandle>;

    /// Streams the asset body to `destination`, returning the bytes written.
    fn download_asset<'a>(
        &'a self,
        asset: &'a AssetDescriptor,
        destination: &'a Utf8Path,
    ) -> HostFuture<'a, u64>;
}
