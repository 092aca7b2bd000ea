//! Secondary archive uploads driven through an external CLI.
//!
//! [`PcsArchive`] wraps the `BaiduPCS-Go` command line client. Credentials
//! arrive as a browser cookie string; a [`CredentialExtractor`] pulls the
//! session token out of it before login.

use std::ffi::OsString;
use std::fmt;

use camino::Utf8Path;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
use crate::source::normalise_remote_path;

/// Cookie field holding the archive session token.
pub const DEFAULT_COOKIE_FIELD: &str = "BDUSS";
/// Attempts the archive CLI makes per upload before giving up.
pub const UPLOAD_RETRIES: u32 = 3;

/// Errors raised while extracting a session token from a credential blob.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// Raised when the blob does not carry the expected field.
    #[error("credential does not contain a {field} value")]
    Missing {
        /// Field that was looked up.
        field: String,
    },
    /// Raised when the field name cannot be turned into a pattern.
    #[error("invalid credential field pattern: {message}")]
    Pattern {
        /// Regex compiler message.
        message: String,
    },
}

/// Pulls a session token out of an opaque credential string.
pub trait CredentialExtractor {
    /// Returns the token embedded in `blob`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Missing`] when no usable token is present.
    fn extract(&self, blob: &str) -> Result<String, CredentialError>;
}

/// Extracts `<field>=<value>` from a `;`-separated cookie string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CookieFieldExtractor {
    field: String,
}

impl CookieFieldExtractor {
    /// Creates an extractor for `field`.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for CookieFieldExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_COOKIE_FIELD)
    }
}

impl CredentialExtractor for CookieFieldExtractor {
    fn extract(&self, blob: &str) -> Result<String, CredentialError> {
        let pattern = Regex::new(&format!("{}=([^;]+)", regex::escape(&self.field))).map_err(
            |err| CredentialError::Pattern {
                message: err.to_string(),
            },
        )?;
        pattern
            .captures(blob)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str().trim())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| CredentialError::Missing {
                field: self.field.clone(),
            })
    }
}

/// Authenticated archive session.
#[derive(Clone, Eq, PartialEq)]
pub struct ArchiveSession {
    token: String,
}

impl ArchiveSession {
    /// Wraps an extracted session token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Session token used for login.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for ArchiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveSession")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Errors raised by archive backends. None of them abort a sync pass.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArchiveError {
    /// Raised when the credential blob carries no usable token.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// Raised when the archive rejects the login.
    #[error("archive login failed with status {status_text}: {stderr}")]
    Auth {
        /// Exit status of the login command.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when an upload fails after the tool exhausted its retries.
    #[error("archive upload of {path} to {folder} failed with status {status_text}: {stderr}")]
    Transfer {
        /// Local file being uploaded.
        path: String,
        /// Remote destination folder.
        folder: String,
        /// Exit status of the upload command.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when the archive CLI cannot be started.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Secondary storage that mirrored assets are copied into.
pub trait ArchiveBackend {
    /// Logs in with `credential`, an opaque blob holding the session token.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Credential`] when no token can be extracted and
    /// [`ArchiveError::Auth`] when the login is rejected.
    fn authenticate(&self, credential: &str) -> Result<ArchiveSession, ArchiveError>;

    /// Creates `path` if missing. Existing folders are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Runner`] when the tool cannot be started.
    fn ensure_folder(&self, session: &ArchiveSession, path: &str) -> Result<(), ArchiveError>;

    /// Uploads `local` into `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Transfer`] when the upload fails.
    fn upload_file(
        &self,
        session: &ArchiveSession,
        local: &Utf8Path,
        folder: &str,
    ) -> Result<(), ArchiveError>;
}

/// Archive backend driving the `BaiduPCS-Go` CLI.
#[derive(Clone, Debug)]
pub struct PcsArchive<R: CommandRunner, X: CredentialExtractor = CookieFieldExtractor> {
    bin: String,
    runner: R,
    extractor: X,
}

impl PcsArchive<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(bin: impl Into<String>) -> Self {
        Self::new(bin, ProcessCommandRunner, CookieFieldExtractor::default())
    }
}

impl<R: CommandRunner, X: CredentialExtractor> PcsArchive<R, X> {
    /// Creates a backend invoking `bin` through `runner`.
    #[must_use]
    pub fn new(bin: impl Into<String>, runner: R, extractor: X) -> Self {
        Self {
            bin: bin.into(),
            runner,
            extractor,
        }
    }

    fn run(&self, args: &[OsString]) -> Result<CommandOutput, ArchiveError> {
        Ok(self.runner.run(&self.bin, args)?)
    }
}

impl<R: CommandRunner, X: CredentialExtractor> ArchiveBackend for PcsArchive<R, X> {
    fn authenticate(&self, credential: &str) -> Result<ArchiveSession, ArchiveError> {
        let token = self.extractor.extract(credential)?;

        let logout = self.run(&[OsString::from("logout")])?;
        if !logout.is_success() {
            debug!(status = %logout.status_text(), "archive logout reported failure; continuing");
        }

        let login = self.run(&[
            OsString::from("login"),
            OsString::from(format!("-bduss={token}")),
        ])?;
        if !login.is_success() {
            return Err(ArchiveError::Auth {
                status_text: login.status_text(),
                stderr: login.stderr,
            });
        }
        Ok(ArchiveSession::new(token))
    }

    fn ensure_folder(&self, _session: &ArchiveSession, path: &str) -> Result<(), ArchiveError> {
        let folder = normalise_remote_path(path);
        let output = self.run(&[OsString::from("mkdir"), OsString::from(&folder)])?;
        if !output.is_success() {
            debug!(folder = %folder, stderr = %output.stderr.trim(), "archive mkdir non-zero; assuming folder exists");
        }
        Ok(())
    }

    fn upload_file(
        &self,
        _session: &ArchiveSession,
        local: &Utf8Path,
        folder: &str,
    ) -> Result<(), ArchiveError> {
        let remote = normalise_remote_path(folder);
        let output = self.run(&[
            OsString::from("upload"),
            OsString::from(local.as_str()),
            OsString::from(&remote),
            OsString::from("-retry"),
            OsString::from(UPLOAD_RETRIES.to_string()),
        ])?;
        if output.is_success() {
            return Ok(());
        }
        Err(ArchiveError::Transfer {
            path: local.to_string(),
            folder: remote,
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }
}
