//! Test support utilities shared across unit and integration tests.
//!
//! The fakes record every call so tests can assert on side effects without
//! touching the network, the archive CLI or a git checkout.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::archive::{ArchiveBackend, ArchiveError, ArchiveSession, CredentialError};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::host::{
    AssetDescriptor, AssetHandle, AssetLocator, DestinationRelease, HostFuture, NewRelease,
    ReleaseDescriptor, ReleaseHost, ReleaseHostError,
};
use crate::source::RepoId;
use crate::tracker::{TrackerError, TrackerRecord, TrackerState, TrackerStore};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory, when one was requested.
    pub dir: Option<Utf8PathBuf>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn respond(
        &self,
        dir: Option<&Utf8Path>,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            dir: dir.map(Utf8Path::to_path_buf),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.respond(None, program, args)
    }

    fn run_in(
        &self,
        dir: &Utf8Path,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        self.respond(Some(dir), program, args)
    }
}

/// Builds a release descriptor whose assets download from
/// `https://downloads.test/<tag>/<name>`.
#[must_use]
pub fn release_descriptor(tag: &str, asset_names: &[&str]) -> ReleaseDescriptor {
    ReleaseDescriptor {
        tag: tag.to_owned(),
        name: format!("Release {tag}"),
        body: format!("notes for {tag}"),
        draft: false,
        prerelease: false,
        assets: asset_names
            .iter()
            .map(|name| AssetDescriptor {
                name: (*name).to_owned(),
                locator: AssetLocator::Direct(asset_url(tag, name)),
                size: None,
            })
            .collect(),
    }
}

/// Download URL used by [`release_descriptor`] for `name`.
#[must_use]
pub fn asset_url(tag: &str, name: &str) -> String {
    format!("https://downloads.test/{tag}/{name}")
}

/// Release created through [`FakeReleaseHost`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedRelease {
    /// Destination repository as `owner/name`.
    pub repo: String,
    /// Submitted parameters.
    pub release: NewRelease,
}

/// Asset attached through [`FakeReleaseHost`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadedAsset {
    /// Destination release tag.
    pub tag: String,
    /// Asset name.
    pub name: String,
    /// Uploaded bytes.
    pub contents: Vec<u8>,
}

#[derive(Debug, Default)]
struct FakeHostState {
    latest: BTreeMap<String, Result<Option<ReleaseDescriptor>, ReleaseHostError>>,
    existing: BTreeSet<(String, String)>,
    bodies: BTreeMap<String, Result<Vec<u8>, ReleaseHostError>>,
    failing_uploads: BTreeSet<String>,
    create_failure: Option<ReleaseHostError>,
    created: Vec<CreatedRelease>,
    uploads: Vec<UploadedAsset>,
    downloads: Vec<String>,
}

/// In-memory [`ReleaseHost`] with scripted releases and recorded writes.
#[derive(Clone, Debug, Default)]
pub struct FakeReleaseHost {
    state: Rc<RefCell<FakeHostState>>,
}

impl FakeReleaseHost {
    /// Creates a host with no releases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `release` the latest release of `repo` and serves a body for
    /// each of its assets.
    pub fn publish(&self, repo: &str, release: ReleaseDescriptor) {
        let mut state = self.state.borrow_mut();
        for asset in &release.assets {
            state.bodies.insert(
                asset.locator.url().to_owned(),
                Ok(format!("{} body", asset.name).into_bytes()),
            );
        }
        state.latest.insert(repo.to_owned(), Ok(Some(release)));
    }

    /// Makes the latest-release lookup for `repo` fail with `err`.
    pub fn fail_latest(&self, repo: &str, err: ReleaseHostError) {
        self.state
            .borrow_mut()
            .latest
            .insert(repo.to_owned(), Err(err));
    }

    /// Marks `tag` as already released in `repo`.
    pub fn add_existing_release(&self, repo: &str, tag: &str) {
        self.state
            .borrow_mut()
            .existing
            .insert((repo.to_owned(), tag.to_owned()));
    }

    /// Makes downloads of `url` fail with `err`.
    pub fn fail_download(&self, url: &str, err: ReleaseHostError) {
        self.state.borrow_mut().bodies.insert(url.to_owned(), Err(err));
    }

    /// Makes uploads of assets named `name` fail.
    pub fn fail_upload(&self, name: &str) {
        self.state
            .borrow_mut()
            .failing_uploads
            .insert(name.to_owned());
    }

    /// Makes every release creation fail with `err`.
    pub fn fail_create(&self, err: ReleaseHostError) {
        self.state.borrow_mut().create_failure = Some(err);
    }

    /// Releases created so far.
    #[must_use]
    pub fn created_releases(&self) -> Vec<CreatedRelease> {
        self.state.borrow().created.clone()
    }

    /// Assets uploaded so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadedAsset> {
        self.state.borrow().uploads.clone()
    }

    /// Asset URLs downloaded so far.
    #[must_use]
    pub fn downloads(&self) -> Vec<String> {
        self.state.borrow().downloads.clone()
    }

    /// Number of create and upload calls that reached the host.
    #[must_use]
    pub fn write_count(&self) -> usize {
        let state = self.state.borrow();
        state.created.len() + state.uploads.len()
    }

    fn latest_for(&self, repo: &RepoId) -> Result<Option<ReleaseDescriptor>, ReleaseHostError> {
        self.state
            .borrow()
            .latest
            .get(&repo.to_string())
            .cloned()
            .unwrap_or(Ok(None))
    }

    fn create(&self, repo: &RepoId, release: &NewRelease) -> Result<DestinationRelease, ReleaseHostError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.create_failure.clone() {
            return Err(err);
        }
        state.existing.insert((repo.to_string(), release.tag.clone()));
        state.created.push(CreatedRelease {
            repo: repo.to_string(),
            release: release.clone(),
        });
        Ok(DestinationRelease {
            tag: release.tag.clone(),
            name: release.name.clone(),
            upload_url: format!("https://uploads.test/{repo}/{}", release.tag),
            html_url: None,
        })
    }

    fn upload(&self, release: &DestinationRelease, file: &Utf8Path) -> Result<AssetHandle, ReleaseHostError> {
        let name = file.file_name().unwrap_or_default().to_owned();
        let write_error = |message: String| ReleaseHostError::Write {
            url: release.upload_url.clone(),
            message,
        };
        if self.state.borrow().failing_uploads.contains(&name) {
            return Err(write_error(String::from("HTTP 502 Bad Gateway")));
        }
        let contents = std::fs::read(file).map_err(|err| write_error(err.to_string()))?;
        let mut state = self.state.borrow_mut();
        state.uploads.push(UploadedAsset {
            tag: release.tag.clone(),
            name: name.clone(),
            contents,
        });
        Ok(AssetHandle {
            id: state.uploads.len() as u64,
            name,
            download_url: None,
        })
    }

    fn download(&self, asset: &AssetDescriptor, destination: &Utf8Path) -> Result<u64, ReleaseHostError> {
        let url = asset.locator.url().to_owned();
        let body = self.state.borrow().bodies.get(&url).cloned();
        self.state.borrow_mut().downloads.push(url.clone());
        let bytes = match body {
            Some(result) => result?,
            None => {
                return Err(ReleaseHostError::Fetch {
                    url,
                    message: String::from("HTTP 404 Not Found"),
                });
            }
        };
        std::fs::write(destination, &bytes).map_err(|err| ReleaseHostError::Fetch {
            url,
            message: err.to_string(),
        })?;
        Ok(bytes.len() as u64)
    }
}

impl ReleaseHost for FakeReleaseHost {
    fn latest_release<'a>(&'a self, repo: &'a RepoId) -> HostFuture<'a, Option<ReleaseDescriptor>> {
        let result = self.latest_for(repo);
        Box::pin(async move { result })
    }

    fn release_exists<'a>(&'a self, repo: &'a RepoId, tag: &'a str) -> HostFuture<'a, bool> {
        let exists = self
            .state
            .borrow()
            .existing
            .contains(&(repo.to_string(), tag.to_owned()));
        Box::pin(async move { Ok(exists) })
    }

    fn create_release<'a>(
        &'a self,
        repo: &'a RepoId,
        release: &'a NewRelease,
    ) -> HostFuture<'a, DestinationRelease> {
        let result = self.create(repo, release);
        Box::pin(async move { result })
    }

    fn upload_asset<'a>(
        &'a self,
        release: &'a DestinationRelease,
        file: &'a Utf8Path,
    ) -> HostFuture<'a, AssetHandle> {
        let result = self.upload(release, file);
        Box::pin(async move { result })
    }

    fn download_asset<'a>(
        &'a self,
        asset: &'a AssetDescriptor,
        destination: &'a Utf8Path,
    ) -> HostFuture<'a, u64> {
        let result = self.download(asset, destination);
        Box::pin(async move { result })
    }
}

/// File copied through [`RecordingArchive`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchivedFile {
    /// Remote folder.
    pub folder: String,
    /// File name.
    pub name: String,
}

#[derive(Debug, Default)]
struct ArchiveState {
    reject_login: bool,
    failing_uploads: BTreeSet<String>,
    logins: Vec<String>,
    folders: Vec<String>,
    files: Vec<ArchivedFile>,
}

/// In-memory [`ArchiveBackend`] that records folders and uploads.
#[derive(Clone, Debug, Default)]
pub struct RecordingArchive {
    state: Rc<RefCell<ArchiveState>>,
}

impl RecordingArchive {
    /// Creates an archive that accepts any `BDUSS=` credential.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every login.
    pub fn reject_login(&self) {
        self.state.borrow_mut().reject_login = true;
    }

    /// Makes uploads of files named `name` fail.
    pub fn fail_upload(&self, name: &str) {
        self.state
            .borrow_mut()
            .failing_uploads
            .insert(name.to_owned());
    }

    /// Credentials passed to successful logins.
    #[must_use]
    pub fn logins(&self) -> Vec<String> {
        self.state.borrow().logins.clone()
    }

    /// Folders ensured so far.
    #[must_use]
    pub fn folders(&self) -> Vec<String> {
        self.state.borrow().folders.clone()
    }

    /// Files uploaded so far.
    #[must_use]
    pub fn files(&self) -> Vec<ArchivedFile> {
        self.state.borrow().files.clone()
    }
}

impl ArchiveBackend for RecordingArchive {
    fn authenticate(&self, credential: &str) -> Result<ArchiveSession, ArchiveError> {
        let token = credential
            .split(';')
            .find_map(|part| part.trim().strip_prefix("BDUSS="))
            .filter(|token| !token.is_empty())
            .ok_or_else(|| CredentialError::Missing {
                field: String::from("BDUSS"),
            })?;
        let mut state = self.state.borrow_mut();
        if state.reject_login {
            return Err(ArchiveError::Auth {
                status_text: String::from("1"),
                stderr: String::from("login rejected"),
            });
        }
        state.logins.push(token.to_owned());
        Ok(ArchiveSession::new(token))
    }

    fn ensure_folder(&self, _session: &ArchiveSession, path: &str) -> Result<(), ArchiveError> {
        self.state.borrow_mut().folders.push(path.to_owned());
        Ok(())
    }

    fn upload_file(
        &self,
        _session: &ArchiveSession,
        local: &Utf8Path,
        folder: &str,
    ) -> Result<(), ArchiveError> {
        let name = local.file_name().unwrap_or_default().to_owned();
        let mut state = self.state.borrow_mut();
        if state.failing_uploads.contains(&name) || !local.exists() {
            return Err(ArchiveError::Transfer {
                path: local.to_string(),
                folder: folder.to_owned(),
                status_text: String::from("1"),
                stderr: String::from("simulated transfer failure"),
            });
        }
        state.files.push(ArchivedFile {
            folder: folder.to_owned(),
            name,
        });
        Ok(())
    }
}

/// Tracker write recorded by [`MemoryTracker`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrackerWrite {
    /// Source named in the publication record.
    pub source: String,
    /// Tag named in the publication record.
    pub tag: String,
}

#[derive(Debug, Default)]
struct MemoryTrackerState {
    state: TrackerState,
    writes: Vec<TrackerWrite>,
    reject_writes: bool,
}

/// In-memory [`TrackerStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryTracker {
    inner: Rc<RefCell<MemoryTrackerState>>,
}

impl MemoryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `tag` as already synced for `source`.
    pub fn seed(&self, source: &str, tag: &str) {
        self.inner.borrow_mut().state.record(
            source,
            TrackerRecord {
                last_tag: tag.to_owned(),
                checked_at: DateTime::<Utc>::UNIX_EPOCH,
            },
        );
    }

    /// Makes every subsequent write fail.
    pub fn reject_writes(&self) {
        self.inner.borrow_mut().reject_writes = true;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.inner.borrow().state.clone()
    }

    /// Writes made so far.
    #[must_use]
    pub fn writes(&self) -> Vec<TrackerWrite> {
        self.inner.borrow().writes.clone()
    }
}

impl TrackerStore for MemoryTracker {
    fn read(&self) -> TrackerState {
        self.state()
    }

    fn write(
        &self,
        state: &TrackerState,
        changed_source: &str,
        changed_tag: &str,
    ) -> Result<(), TrackerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.reject_writes {
            return Err(TrackerError::Publish {
                step: String::from("push"),
                status_text: String::from("1"),
                stderr: String::from("! [rejected] main -> main (fetch first)"),
            });
        }
        inner.state = state.clone();
        inner.writes.push(TrackerWrite {
            source: changed_source.to_owned(),
            tag: changed_tag.to_owned(),
        });
        Ok(())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let values = pairs
            .iter()
            .map(|(key, value)| (*key, Some(*value)))
            .collect::<Vec<_>>();
        Self::apply(&values).await
    }

    /// Sets or removes environment variables while holding a global mutex.
    /// A `None` value removes the variable for the lifetime of the guard.
    pub async fn apply(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
