//! Upstream source identity and the naming rules derived from it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// `owner/name` pair identifying a repository on the hosting platform.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RepoId {
    owner: String,
    name: String,
}

/// Raised when a repository identifier is not of the form `owner/name`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid repository identifier '{value}': expected owner/name")]
pub struct RepoIdError {
    /// Offending input.
    pub value: String,
}

impl RepoId {
    /// Builds an identifier from its parts, trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RepoIdError`] when either part is blank or contains `/`.
    pub fn new(owner: &str, name: &str) -> Result<Self, RepoIdError> {
        let trimmed_owner = owner.trim();
        let trimmed_name = name.trim();
        let invalid = |part: &str| part.is_empty() || part.contains('/');
        if invalid(trimmed_owner) || invalid(trimmed_name) {
            return Err(RepoIdError {
                value: format!("{owner}/{name}"),
            });
        }
        Ok(Self {
            owner: trimmed_owner.to_owned(),
            name: trimmed_name.to_owned(),
        })
    }

    /// Repository owner (user or organisation).
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Short repository name without the owner.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepoId {
    type Err = RepoIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((owner, name)) = value.trim().split_once('/') else {
            return Err(RepoIdError {
                value: value.to_owned(),
            });
        };
        Self::new(owner, name).map_err(|_| RepoIdError {
            value: value.to_owned(),
        })
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Repository whose latest release is mirrored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpstreamSource {
    /// Upstream repository.
    pub repo: RepoId,
    /// Folder and display-name alias; falls back to the short name.
    pub alias: Option<String>,
}

impl UpstreamSource {
    /// Creates a source without an alias.
    #[must_use]
    pub const fn new(repo: RepoId) -> Self {
        Self { repo, alias: None }
    }

    /// Attaches an alias, ignoring blank values.
    #[must_use]
    pub fn with_alias(mut self, alias: Option<&str>) -> Self {
        self.alias = alias
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned);
        self
    }

    /// Key under which the tracker records this source.
    #[must_use]
    pub fn tracker_key(&self) -> String {
        self.repo.to_string()
    }

    /// Alias when configured, otherwise the short repository name.
    #[must_use]
    pub fn folder_name(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.repo.name())
    }
}

impl fmt::Display for UpstreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.repo.fmt(f)
    }
}

/// Naming rules applied when projecting an upstream release locally.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NamingRules {
    /// Prefix local tags with the short repository name.
    pub namespace_tags: bool,
    /// Prefix display names with `[<alias>]`.
    pub prefix_display_names: bool,
    /// Place archive uploads under a per-source folder.
    pub per_source_folders: bool,
    /// Append the upstream tag to the archive folder.
    pub append_tag_to_archive: bool,
    /// Root folder on the archive backend.
    pub archive_root: String,
}

impl NamingRules {
    /// Local destination tag for `upstream_tag`.
    #[must_use]
    pub fn local_tag(&self, source: &UpstreamSource, upstream_tag: &str) -> String {
        if self.namespace_tags {
            format!("{}-{upstream_tag}", source.repo.name())
        } else {
            upstream_tag.to_owned()
        }
    }

    /// Display name of the destination release.
    #[must_use]
    pub fn display_name(&self, source: &UpstreamSource, upstream_name: &str) -> String {
        if self.prefix_display_names {
            format!("[{}] {upstream_name}", source.folder_name())
        } else {
            upstream_name.to_owned()
        }
    }

    /// Archive folder for `upstream_tag`: `<root>[/<alias>][/<tag>]`.
    #[must_use]
    pub fn archive_folder(&self, source: &UpstreamSource, upstream_tag: &str) -> String {
        let mut folder = normalise_remote_path(&self.archive_root);
        if self.per_source_folders {
            folder = join_remote(&folder, source.folder_name());
        }
        if self.append_tag_to_archive {
            folder = join_remote(&folder, &folder_segment(upstream_tag));
        }
        folder
    }
}

/// Short repository names used by more than one source.
#[must_use]
pub fn shared_short_names(sources: &[UpstreamSource]) -> Vec<&str> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for source in sources {
        *counts.entry(source.repo.name()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name)
        .collect()
}

/// Tags may contain path separators; keep them within one folder.
fn folder_segment(tag: &str) -> String {
    tag.replace(['/', '\\'], "-")
}

/// Ensures a remote path is absolute and has no trailing slash.
#[must_use]
pub fn normalise_remote_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

fn join_remote(base: &str, segment: &str) -> String {
    let cleaned = segment.trim().trim_matches('/');
    if base == "/" {
        format!("/{cleaned}")
    } else {
        format!("{base}/{cleaned}")
    }
}
