//! Configuration loading via `ortho-config`.
//!
//! [`MirrorConfig`] holds the raw, environment-shaped values. Calling
//! [`MirrorConfig::settings`] validates them and produces the typed
//! [`MirrorSettings`] consumed by the orchestrator.

use std::collections::BTreeMap;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use serde::de::{self, Deserializer};
use thiserror::Error;
use tracing::warn;

use crate::pipeline::ProcessingMode;
use crate::source::{NamingRules, RepoId, UpstreamSource, shared_short_names};
use crate::tracker::TrackerLayout;

/// Default directory holding the tracker checkout.
pub const DEFAULT_TRACKER_DIR: &str = ".release-tracker";

/// Default root folder on the archive backend.
pub const DEFAULT_ARCHIVE_ROOT: &str = "/apps/release-sync";

/// Default hosting API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Default archive CLI binary.
pub const DEFAULT_ARCHIVE_BIN: &str = "BaiduPCS-Go";

/// Default commit author recorded on tracker updates.
pub const DEFAULT_GIT_AUTHOR_NAME: &str = "github-actions[bot]";

/// Default commit author email recorded on tracker updates.
pub const DEFAULT_GIT_AUTHOR_EMAIL: &str = "github-actions[bot]@users.noreply.github.com";

const ENV_PREFIX: &str = "RELEASE_SYNC_";

/// Raw mirror settings merged from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "RELEASE_SYNC")]
pub struct MirrorConfig {
    /// Bearer token for the hosting API. Required by the release client.
    pub github_token: Option<String>,
    /// Repository (`owner/name`) receiving mirrored releases.
    pub destination_repo: Option<String>,
    /// Upstream repositories, newline-delimited or a JSON array.
    #[ortho_config(default = String::new())]
    #[serde(deserialize_with = "upstream_list_text")]
    pub upstream_repos: String,
    /// Single upstream repository, used when `upstream_repos` is empty.
    pub upstream_repo: Option<String>,
    /// JSON object mapping `owner/name` to a folder alias.
    pub repo_aliases: Option<String>,
    /// Directory containing the version-controlled tracker file.
    #[ortho_config(default = DEFAULT_TRACKER_DIR.to_owned())]
    pub tracker_dir: String,
    /// Tracker document shape written back (`multi` or `single`).
    #[ortho_config(default = "multi".to_owned())]
    pub tracker_layout: String,
    /// Path to the `git` executable.
    #[ortho_config(default = "git".to_owned())]
    pub git_bin: String,
    /// Author name for tracker commits.
    #[ortho_config(default = DEFAULT_GIT_AUTHOR_NAME.to_owned())]
    pub git_author_name: String,
    /// Author email for tracker commits.
    #[ortho_config(default = DEFAULT_GIT_AUTHOR_EMAIL.to_owned())]
    pub git_author_email: String,
    /// Hosting API base URL.
    #[ortho_config(default = DEFAULT_API_BASE.to_owned())]
    pub api_base: String,
    /// Whether assets are also copied to the archive backend.
    #[ortho_config(default = true, skip_cli)]
    pub archive_enabled: bool,
    /// Root folder on the archive backend. Defaults to
    /// [`DEFAULT_ARCHIVE_ROOT`], or `<DEFAULT_ARCHIVE_ROOT>/<destination>` in
    /// single-source mode.
    pub archive_root: Option<String>,
    /// Cookie blob carrying the archive session token.
    pub archive_cookie: Option<String>,
    /// Path to the archive CLI executable.
    #[ortho_config(default = DEFAULT_ARCHIVE_BIN.to_owned())]
    pub archive_bin: String,
    /// Keep each upstream tag in its own archive folder.
    #[ortho_config(default = true, skip_cli)]
    pub archive_append_tag: bool,
    /// Prefix local tags with the upstream short name.
    #[ortho_config(default = true, skip_cli)]
    pub namespace_release_tags: bool,
    /// Asset processing mode (`stream` or `batch`).
    #[ortho_config(default = "stream".to_owned())]
    pub processing_mode: String,
}

/// Validated settings driving a mirror run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MirrorSettings {
    /// Repository receiving mirrored releases.
    pub destination: RepoId,
    /// Sources processed in order.
    pub sources: Vec<UpstreamSource>,
    /// Local naming and archive layout rules.
    pub naming: NamingRules,
    /// Tracker document shape.
    pub tracker_layout: TrackerLayout,
    /// Asset processing mode.
    pub mode: ProcessingMode,
    /// Archive credential; `None` disables archive mirroring.
    pub archive_credential: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, key: &'static str) -> Self {
        Self { description, key }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {ENV_PREFIX}{} or add {} to tagmirror.toml",
            self.description,
            self.key.to_uppercase(),
            self.key
        ))
    }
}

impl MirrorConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("tagmirror")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the API token, rejecting absent or blank values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        require_present(
            self.github_token.as_deref(),
            &FieldMetadata::new("hosting API token", "github_token"),
        )
    }

    /// Validates the raw values and builds [`MirrorSettings`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the destination repository
    /// is absent, or [`ConfigError::Parse`] when a repository list, mode, or
    /// layout cannot be understood.
    pub fn settings(&self) -> Result<MirrorSettings, ConfigError> {
        let destination_raw = require_present(
            self.destination_repo.as_deref(),
            &FieldMetadata::new("destination repository", "destination_repo"),
        )?;
        let destination = parse_repo(destination_raw)?;
        let aliases = parse_aliases(self.repo_aliases.as_deref());
        let mode = self
            .processing_mode
            .parse::<ProcessingMode>()
            .map_err(|err| ConfigError::Parse(err.to_string()))?;

        let multi = parse_upstream_list(&self.upstream_repos)?;
        let single = self
            .upstream_repo
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let (repos, single_mode) = match (multi.is_empty(), single) {
            (true, Some(repo)) => (vec![parse_repo(repo)?], true),
            _ => (multi, false),
        };

        let sources: Vec<UpstreamSource> = repos
            .into_iter()
            .map(|repo| {
                let alias = aliases.get(&repo.to_string()).map(String::as_str);
                UpstreamSource::new(repo).with_alias(alias)
            })
            .collect();
        for short_name in shared_short_names(&sources) {
            warn!(
                short_name,
                "several upstream sources share a short name; their local tags and archive folders collide"
            );
        }

        let tracker_layout = if single_mode {
            TrackerLayout::Single
        } else {
            self.tracker_layout
                .parse::<TrackerLayout>()
                .map_err(|err| ConfigError::Parse(err.to_string()))?
        };

        let naming = NamingRules {
            namespace_tags: self.namespace_release_tags && !single_mode,
            prefix_display_names: !single_mode,
            per_source_folders: !single_mode,
            append_tag_to_archive: self.archive_append_tag,
            archive_root: self.resolved_archive_root(&destination, single_mode),
        };

        let archive_credential = self
            .archive_cookie
            .as_deref()
            .map(str::trim)
            .filter(|cookie| self.archive_enabled && !cookie.is_empty())
            .map(str::to_owned);

        Ok(MirrorSettings {
            destination,
            sources,
            naming,
            tracker_layout,
            mode,
            archive_credential,
        })
    }

    fn resolved_archive_root(&self, destination: &RepoId, single_mode: bool) -> String {
        self.archive_root
            .as_deref()
            .map(str::trim)
            .filter(|root| !root.is_empty())
            .map_or_else(
                || {
                    if single_mode {
                        format!("{DEFAULT_ARCHIVE_ROOT}/{destination}")
                    } else {
                        DEFAULT_ARCHIVE_ROOT.to_owned()
                    }
                },
                str::to_owned,
            )
    }
}

/// Accepts the upstream list either as text or as a sequence. Environment
/// values starting with `[` reach the deserializer already split into a
/// sequence; it is re-encoded as a JSON array for [`parse_upstream_list`].
fn upstream_list_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawList {
        Text(String),
        Items(Vec<serde_json::Value>),
    }

    match RawList::deserialize(deserializer)? {
        RawList::Text(text) => Ok(text),
        RawList::Items(items) => serde_json::to_string(&items).map_err(de::Error::custom),
    }
}

fn require_present<'a>(
    value: Option<&'a str>,
    metadata: &FieldMetadata,
) -> Result<&'a str, ConfigError> {
    match value.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => Ok(trimmed),
        _ => Err(metadata.missing()),
    }
}

fn parse_repo(value: &str) -> Result<RepoId, ConfigError> {
    value
        .parse::<RepoId>()
        .map_err(|err| ConfigError::Parse(err.to_string()))
}

/// Parses an upstream list given either as a JSON array or as
/// newline-delimited text. Blank lines and `#` comments are skipped.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed JSON or identifiers.
pub fn parse_upstream_list(raw: &str) -> Result<Vec<RepoId>, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<serde_json::Value>>(trimmed)
            .map_err(|err| ConfigError::Parse(format!("upstream list is not valid JSON: {err}")))?
            .into_iter()
            .filter_map(|value| match value {
                serde_json::Value::String(text) => Some(text),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .map(|entry| entry.trim().to_owned())
            .filter(|entry| !entry.is_empty())
            .collect()
    } else {
        trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect()
    };

    entries.iter().map(|entry| parse_repo(entry)).collect()
}

/// Parses the alias mapping. Malformed JSON yields an empty mapping.
#[must_use]
pub fn parse_aliases(raw: Option<&str>) -> BTreeMap<String, String> {
    let Some(text) = raw.map(str::trim).filter(|text| !text.is_empty()) else {
        return BTreeMap::new();
    };
    serde_json::from_str::<BTreeMap<String, String>>(text).unwrap_or_default()
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader or value parsing.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
