//! Release and asset descriptors plus the wire payloads they come from.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Upstream release selected for mirroring.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseDescriptor {
    /// Upstream tag name.
    pub tag: String,
    /// Display name, falling back to the tag.
    pub name: String,
    /// Release notes.
    pub body: String,
    /// Whether the upstream release is a draft.
    pub draft: bool,
    /// Whether the upstream release is a prerelease.
    pub prerelease: bool,
    /// Downloadable assets in upstream order.
    pub assets: Vec<AssetDescriptor>,
}

/// How an asset body is fetched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AssetLocator {
    /// Browser download URL serving raw bytes.
    Direct(String),
    /// API asset URL; raw bytes require `Accept: application/octet-stream`.
    ApiContent(String),
}

impl AssetLocator {
    /// Classifies `url` by whether it addresses the release-asset API.
    #[must_use]
    pub fn classify(url: &str) -> Self {
        if url.contains("/releases/assets/") {
            Self::ApiContent(url.to_owned())
        } else {
            Self::Direct(url.to_owned())
        }
    }

    /// Underlying URL.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Direct(url) | Self::ApiContent(url) => url,
        }
    }
}

/// Asset discovered on an upstream release.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssetDescriptor {
    /// Sanitised file name, unique within the release.
    pub name: String,
    /// Where to fetch the body from.
    pub locator: AssetLocator,
    /// Size reported upstream, when known.
    pub size: Option<u64>,
}

/// Parameters for creating a destination release.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NewRelease {
    /// Tag to create.
    #[serde(rename = "tag_name")]
    pub tag: String,
    /// Display name.
    pub name: String,
    /// Release notes.
    pub body: String,
    /// Create as draft.
    pub draft: bool,
    /// Mark as prerelease.
    pub prerelease: bool,
    /// Commit or branch the tag points at; defaults to the default branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_commitish: Option<String>,
}

/// Release created in the destination repository.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DestinationRelease {
    /// Local tag.
    pub tag: String,
    /// Display name.
    pub name: String,
    /// Asset upload endpoint with any URI template suffix removed.
    pub upload_url: String,
    /// Browser URL of the release, when reported.
    pub html_url: Option<String>,
}

/// Asset attached to a destination release.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssetHandle {
    /// Host-assigned identifier.
    pub id: u64,
    /// Asset name as stored by the host.
    pub name: String,
    /// Public download URL, when reported.
    pub download_url: Option<String>,
}

/// Reduces an upstream asset name to a safe local file name.
///
/// Only the final path segment is kept; empty, `.` and `..` are rejected.
#[must_use]
pub fn sanitize_asset_name(raw: &str) -> Option<String> {
    let candidate = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        return None;
    }
    Some(candidate.to_owned())
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ReleasePayload {
    pub(super) tag_name: String,
    #[serde(default)]
    pub(super) name: Option<String>,
    #[serde(default)]
    pub(super) body: Option<String>,
    #[serde(default)]
    pub(super) draft: bool,
    #[serde(default)]
    pub(super) prerelease: bool,
    #[serde(default)]
    pub(super) assets: Vec<AssetPayload>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct AssetPayload {
    #[serde(default)]
    pub(super) name: Option<String>,
    #[serde(default)]
    pub(super) browser_download_url: Option<String>,
    #[serde(default)]
    pub(super) url: Option<String>,
    #[serde(default)]
    pub(super) size: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct CreatedReleasePayload {
    pub(super) tag_name: String,
    #[serde(default)]
    pub(super) name: Option<String>,
    pub(super) upload_url: String,
    #[serde(default)]
    pub(super) html_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct UploadedAssetPayload {
    pub(super) id: u64,
    pub(super) name: String,
    #[serde(default)]
    pub(super) browser_download_url: Option<String>,
}

impl From<ReleasePayload> for ReleaseDescriptor {
    fn from(payload: ReleasePayload) -> Self {
        let mut seen = BTreeSet::new();
        let mut assets = Vec::with_capacity(payload.assets.len());
        for asset in payload.assets {
            let Some(url) = asset
                .browser_download_url
                .filter(|url| !url.is_empty())
                .or(asset.url.filter(|url| !url.is_empty()))
            else {
                warn!(tag = %payload.tag_name, asset = ?asset.name, "asset has no download URL; skipping");
                continue;
            };
            let raw_name = asset.name.as_deref().unwrap_or(url.as_str());
            let Some(name) = sanitize_asset_name(raw_name) else {
                warn!(tag = %payload.tag_name, asset = raw_name, "asset name unusable; skipping");
                continue;
            };
            if !seen.insert(name.clone()) {
                warn!(tag = %payload.tag_name, asset = %name, "duplicate asset name; skipping");
                continue;
            }
            assets.push(AssetDescriptor {
                name,
                locator: AssetLocator::classify(&url),
                size: asset.size,
            });
        }

        let name = payload
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| payload.tag_name.clone());
        Self {
            tag: payload.tag_name,
            name,
            body: payload.body.unwrap_or_default(),
            draft: payload.draft,
            prerelease: payload.prerelease,
            assets,
        }
    }
}

impl From<CreatedReleasePayload> for DestinationRelease {
    fn from(payload: CreatedReleasePayload) -> Self {
        let upload_url = payload
            .upload_url
            .split_once('{')
            .map_or(payload.upload_url.as_str(), |(base, _)| base)
            .to_owned();
        Self {
            name: payload.name.unwrap_or_else(|| payload.tag_name.clone()),
            tag: payload.tag_name,
            upload_url,
            html_url: payload.html_url,
        }
    }
}

impl From<UploadedAssetPayload> for AssetHandle {
    fn from(payload: UploadedAssetPayload) -> Self {
        Self {
            id: payload.id,
            name: payload.name,
            download_url: payload.browser_download_url,
        }
    }
}
