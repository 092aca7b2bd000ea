//! Durable per-source record of the last mirrored upstream tag.
//!
//! The tracker lives in a git checkout (typically a dedicated branch). Each
//! write replaces `state.json` wholesale and is committed and pushed before
//! the call returns, so a run never reports progress that was not published.
//! Writers must be serialised by the caller; the store performs no locking.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};

/// File name of the tracker document inside the tracker directory.
pub const STATE_FILE: &str = "state.json";

/// Last synced tag for one upstream source.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TrackerRecord {
    /// Upstream tag that was last processed.
    pub last_tag: String,
    /// When the tag was recorded.
    pub checked_at: DateTime<Utc>,
}

/// Tracker contents keyed by upstream source identifier.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrackerState {
    records: BTreeMap<String, TrackerRecord>,
}

impl TrackerState {
    /// Returns the record for `source`, if any.
    #[must_use]
    pub fn get(&self, source: &str) -> Option<&TrackerRecord> {
        self.records.get(source)
    }

    /// Last synced tag for `source`, if any.
    #[must_use]
    pub fn last_tag(&self, source: &str) -> Option<&str> {
        self.get(source).map(|record| record.last_tag.as_str())
    }

    /// Inserts or replaces the record for `source`.
    pub fn record(&mut self, source: impl Into<String>, record: TrackerRecord) {
        self.records.insert(source.into(), record);
    }

    /// Number of tracked sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when nothing has been tracked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over records in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TrackerRecord)> {
        self.records.iter()
    }
}

/// Shape of the persisted tracker document.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TrackerLayout {
    /// `{"repos": {"owner/name": {"last_tag", "checked_at"}}}`.
    #[default]
    Multi,
    /// `{"last_tag", "upstream_repo", "checked_at"}` for a single source.
    Single,
}

/// Raised when a tracker layout name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown tracker layout '{0}': expected multi or single")]
pub struct UnknownLayout(pub String);

impl FromStr for TrackerLayout {
    type Err = UnknownLayout;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "multi" => Ok(Self::Multi),
            "single" => Ok(Self::Single),
            _ => Err(UnknownLayout(value.to_owned())),
        }
    }
}

impl fmt::Display for TrackerLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multi => f.write_str("multi"),
            Self::Single => f.write_str("single"),
        }
    }
}

/// Errors raised while persisting tracker state. All of them are fatal for
/// the run because idempotency can no longer be guaranteed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TrackerError {
    /// Raised when the tracker file cannot be written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the state cannot be rendered for the configured layout.
    #[error("failed to render tracker state: {message}")]
    Render {
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a git step exits unsuccessfully.
    #[error("git {step} exited with status {status_text}: {stderr}")]
    Publish {
        /// Git subcommand that failed.
        step: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from git.
        stderr: String,
    },
    /// Raised when git cannot be started.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Read-modify-write store for tracker state.
pub trait TrackerStore {
    /// Loads the current state. Missing or corrupt documents yield an empty
    /// state rather than an error.
    fn read(&self) -> TrackerState;

    /// Persists `state` and publishes it, naming the changed source and tag
    /// in the publication record.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the state cannot be written or published.
    fn write(
        &self,
        state: &TrackerState,
        changed_source: &str,
        changed_tag: &str,
    ) -> Result<(), TrackerError>;
}

/// Commit author used for tracker commits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GitIdentity {
    /// Path to the `git` executable.
    pub git_bin: String,
    /// Commit author name.
    pub name: String,
    /// Commit author email.
    pub email: String,
}

/// Tracker persisted as `state.json` in a git checkout.
#[derive(Clone, Debug)]
pub struct GitTracker<R: CommandRunner> {
    dir: Utf8PathBuf,
    layout: TrackerLayout,
    identity: GitIdentity,
    runner: R,
}

impl GitTracker<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(
        dir: impl Into<Utf8PathBuf>,
        layout: TrackerLayout,
        identity: GitIdentity,
    ) -> Self {
        Self::new(dir, layout, identity, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> GitTracker<R> {
    /// Creates a tracker rooted at `dir`.
    #[must_use]
    pub fn new(
        dir: impl Into<Utf8PathBuf>,
        layout: TrackerLayout,
        identity: GitIdentity,
        runner: R,
    ) -> Self {
        Self {
            dir: dir.into(),
            layout,
            identity,
            runner,
        }
    }

    /// Directory holding the tracker checkout.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn commit_message(&self, changed_source: &str, changed_tag: &str) -> String {
        match self.layout {
            TrackerLayout::Multi => format!("chore(tracker): {changed_source} -> {changed_tag}"),
            TrackerLayout::Single => format!("chore(tracker): {changed_tag}"),
        }
    }

    fn git(&self, step: &str, args: &[OsString]) -> Result<(), TrackerError> {
        let output = self.runner.run_in(&self.dir, &self.identity.git_bin, args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(TrackerError::Publish {
            step: step.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    fn publish(&self, message: String) -> Result<(), TrackerError> {
        self.git(
            "add",
            &[OsString::from("add"), OsString::from(STATE_FILE)],
        )?;
        self.git(
            "commit",
            &[
                OsString::from("-c"),
                OsString::from(format!("user.name={}", self.identity.name)),
                OsString::from("-c"),
                OsString::from(format!("user.email={}", self.identity.email)),
                OsString::from("commit"),
                OsString::from("-m"),
                OsString::from(message),
            ],
        )?;
        self.git("push", &[OsString::from("push")])
    }
}

impl<R: CommandRunner> TrackerStore for GitTracker<R> {
    fn read(&self) -> TrackerState {
        match read_state_file(&self.dir) {
            Ok(Some(contents)) => parse_state(&contents).unwrap_or_else(|| {
                warn!(path = %self.dir.join(STATE_FILE), "tracker state unreadable; starting empty");
                TrackerState::default()
            }),
            Ok(None) => TrackerState::default(),
            Err(err) => {
                warn!(path = %self.dir.join(STATE_FILE), error = %err, "tracker state inaccessible; starting empty");
                TrackerState::default()
            }
        }
    }

    fn write(
        &self,
        state: &TrackerState,
        changed_source: &str,
        changed_tag: &str,
    ) -> Result<(), TrackerError> {
        let rendered = render_state(state, self.layout, changed_source)?;
        write_state_file(&self.dir, &rendered)?;
        self.publish(self.commit_message(changed_source, changed_tag))?;
        debug!(source = changed_source, tag = changed_tag, "tracker published");
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TrackerDocument {
    Multi {
        repos: BTreeMap<String, TrackerRecord>,
    },
    Single {
        last_tag: String,
        upstream_repo: String,
        checked_at: DateTime<Utc>,
    },
}

#[derive(Serialize)]
struct MultiDocument<'a> {
    repos: &'a BTreeMap<String, TrackerRecord>,
}

#[derive(Serialize)]
struct SingleDocument<'a> {
    last_tag: &'a str,
    upstream_repo: &'a str,
    checked_at: &'a DateTime<Utc>,
}

/// Parses either tracker shape. Returns `None` for corrupt documents.
#[must_use]
pub fn parse_state(contents: &str) -> Option<TrackerState> {
    if contents.trim().is_empty() {
        return Some(TrackerState::default());
    }
    let document = serde_json::from_str::<TrackerDocument>(contents).ok()?;
    let records = match document {
        TrackerDocument::Multi { repos } => repos,
        TrackerDocument::Single {
            last_tag,
            upstream_repo,
            checked_at,
        } => BTreeMap::from([(
            upstream_repo,
            TrackerRecord {
                last_tag,
                checked_at,
            },
        )]),
    };
    Some(TrackerState { records })
}

/// Renders `state` in the requested layout with two-space indentation.
///
/// # Errors
///
/// Returns [`TrackerError::Render`] when the single layout has no record for
/// `changed_source` or serialisation fails.
pub fn render_state(
    state: &TrackerState,
    layout: TrackerLayout,
    changed_source: &str,
) -> Result<String, TrackerError> {
    let rendered = match layout {
        TrackerLayout::Multi => serde_json::to_string_pretty(&MultiDocument {
            repos: &state.records,
        }),
        TrackerLayout::Single => {
            let record = state
                .get(changed_source)
                .ok_or_else(|| TrackerError::Render {
                    message: format!("no tracker record for {changed_source}"),
                })?;
            serde_json::to_string_pretty(&SingleDocument {
                last_tag: &record.last_tag,
                upstream_repo: changed_source,
                checked_at: &record.checked_at,
            })
        }
    };
    rendered
        .map(|mut text| {
            text.push('\n');
            text
        })
        .map_err(|err| TrackerError::Render {
            message: err.to_string(),
        })
}

fn read_state_file(dir: &Utf8Path) -> io::Result<Option<String>> {
    let handle = match Dir::open_ambient_dir(dir, ambient_authority()) {
        Ok(handle) => handle,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    match handle.read_to_string(STATE_FILE) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_state_file(dir: &Utf8Path, contents: &str) -> Result<(), TrackerError> {
    let io_error = |path: Utf8PathBuf| {
        move |err: io::Error| TrackerError::Io {
            path,
            message: err.to_string(),
        }
    };
    Dir::create_ambient_dir_all(dir, ambient_authority()).map_err(io_error(dir.to_path_buf()))?;
    let handle =
        Dir::open_ambient_dir(dir, ambient_authority()).map_err(io_error(dir.to_path_buf()))?;
    handle
        .write(STATE_FILE, contents)
        .map_err(io_error(dir.join(STATE_FILE)))
}

#[cfg(test)]
mod tests;
