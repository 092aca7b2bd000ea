//! Sync orchestration across upstream sources.
//!
//! [`MirrorOrchestrator`] runs one pass per upstream source: compare the
//! latest upstream tag with the tracker, create the destination release,
//! open the archive, push every asset through the [`AssetPipeline`], then
//! record the tag. Sources are processed strictly one after another so the
//! tracker only ever has one writer.

use camino::Utf8Path;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive::{ArchiveBackend, ArchiveSession};
use crate::config::MirrorSettings;
use crate::host::{
    DestinationRelease, NewRelease, ReleaseDescriptor, ReleaseHost, ReleaseHostError,
};
use crate::pipeline::{ArchiveTarget, AssetPipeline, PipelineError, PipelineSummary, ProcessingMode};
use crate::source::{NamingRules, RepoId, UpstreamSource};
use crate::tracker::{TrackerError, TrackerRecord, TrackerStore};

/// Errors raised while mirroring one source.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MirrorError {
    /// Raised when the upstream or destination release cannot be read.
    #[error("failed to read releases: {0}")]
    Read(#[source] ReleaseHostError),
    /// Raised when the destination release cannot be created.
    #[error("failed to create destination release {tag}: {source}")]
    CreateRelease {
        /// Local tag that was being created.
        tag: String,
        /// Underlying host error.
        source: ReleaseHostError,
    },
    /// Raised when the scratch directory cannot be prepared.
    #[error("failed to prepare scratch directory: {message}")]
    Scratch {
        /// Operating system error string.
        message: String,
    },
    /// Raised when local storage is exhausted.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// Raised when the tracker cannot be persisted.
    #[error("failed to persist tracker: {0}")]
    Persistence(#[from] TrackerError),
}

impl MirrorError {
    /// Returns `true` when the error must abort the whole batch.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Pipeline(_) | Self::Persistence(_))
    }
}

/// Result of a successful pass over one source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceOutcome {
    /// The source has no releases.
    NoRelease,
    /// The latest tag was already recorded.
    UpToDate {
        /// Tracked tag.
        tag: String,
    },
    /// The latest tag was mirrored and recorded.
    Synced {
        /// Upstream tag.
        tag: String,
        /// Destination tag.
        local_tag: String,
        /// Whether the destination release was created in this pass.
        created_release: bool,
        /// Whether the archive accepted uploads in this pass.
        archive_active: bool,
        /// Per-asset results.
        summary: PipelineSummary,
    },
}

/// Outcome of one source within a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceReport {
    /// Source identifier as `owner/name`.
    pub source: String,
    /// Pass outcome, or the contained error.
    pub result: Result<SourceOutcome, MirrorError>,
}

/// Outcomes of every source in a batch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchReport {
    /// Reports in processing order.
    pub sources: Vec<SourceReport>,
}

impl BatchReport {
    /// Sources whose latest tag was mirrored.
    #[must_use]
    pub fn synced(&self) -> usize {
        self.sources
            .iter()
            .filter(|report| matches!(report.result, Ok(SourceOutcome::Synced { .. })))
            .count()
    }

    /// Sources whose pass failed with a contained error.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.sources
            .iter()
            .filter(|report| report.result.is_err())
            .count()
    }

    /// Report for `source`, if it was processed.
    #[must_use]
    pub fn get(&self, source: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|report| report.source == source)
    }
}

/// Drives sync passes against injected collaborators.
pub struct MirrorOrchestrator<H: ReleaseHost, A: ArchiveBackend, T: TrackerStore> {
    host: H,
    archive: A,
    tracker: T,
    destination: RepoId,
    naming: NamingRules,
    mode: ProcessingMode,
    archive_credential: Option<String>,
}

impl<H: ReleaseHost, A: ArchiveBackend, T: TrackerStore> MirrorOrchestrator<H, A, T> {
    /// Creates an orchestrator from validated settings.
    #[must_use]
    pub fn new(host: H, archive: A, tracker: T, settings: &MirrorSettings) -> Self {
        Self {
            host,
            archive,
            tracker,
            destination: settings.destination.clone(),
            naming: settings.naming.clone(),
            mode: settings.mode,
            archive_credential: settings.archive_credential.clone(),
        }
    }

    /// Mirrors `sources` in order, containing non-fatal failures.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`MirrorError`] (tracker persistence or storage
    /// exhaustion); the remaining sources are not processed.
    pub async fn run_batch(&self, sources: &[UpstreamSource]) -> Result<BatchReport, MirrorError> {
        let mut report = BatchReport::default();
        for source in sources {
            let result = self.sync_source(source).await;
            if let Err(err) = &result {
                if err.is_fatal() {
                    error!(source = %source, error = %err, "fatal error; aborting batch");
                    return Err(err.clone());
                }
                warn!(source = %source, error = %err, "source failed; continuing with next source");
            }
            report.sources.push(SourceReport {
                source: source.tracker_key(),
                result,
            });
        }
        info!(
            sources = report.sources.len(),
            synced = report.synced(),
            failed = report.failed(),
            "batch finished"
        );
        Ok(report)
    }

    /// Runs one pass for `source`.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError`] when the upstream cannot be read, the
    /// destination release cannot be created, storage is exhausted or the
    /// tracker cannot be persisted.
    pub async fn sync_source(&self, source: &UpstreamSource) -> Result<SourceOutcome, MirrorError> {
        let key = source.tracker_key();
        let mut state = self.tracker.read();

        let Some(release) = self
            .host
            .latest_release(&source.repo)
            .await
            .map_err(MirrorError::Read)?
        else {
            info!(source = %source, "upstream has no releases; skipping");
            return Ok(SourceOutcome::NoRelease);
        };
        info!(
            source = %source,
            tag = %release.tag,
            draft = release.draft,
            prerelease = release.prerelease,
            "latest upstream release"
        );

        if state.last_tag(&key) == Some(release.tag.as_str()) {
            info!(source = %source, tag = %release.tag, "already synced");
            return Ok(SourceOutcome::UpToDate { tag: release.tag });
        }

        let local_tag = self.naming.local_tag(source, &release.tag);
        let folder = self.naming.archive_folder(source, &release.tag);
        let scratch = tempfile::Builder::new()
            .prefix(&format!("assets_{}_", source.repo.name()))
            .tempdir()
            .map_err(|err| MirrorError::Scratch {
                message: err.to_string(),
            })?;
        let scratch_path =
            Utf8Path::from_path(scratch.path()).ok_or_else(|| MirrorError::Scratch {
                message: format!("{} is not valid UTF-8", scratch.path().display()),
            })?;

        let created = self.ensure_destination_release(source, &release, &local_tag).await?;
        let session = self.open_archive(source, &folder);

        let pipeline = AssetPipeline::new(&self.host, scratch_path, self.mode)
            .with_release(created.as_ref())
            .with_archive(
                session
                    .as_ref()
                    .map(|active| ArchiveTarget::new(&self.archive, active, &folder)),
            );
        let summary = pipeline.run(&release.assets).await?;
        if summary.failed() > 0 {
            warn!(
                source = %source,
                tag = %release.tag,
                failed = summary.failed(),
                "recording tag although some assets failed"
            );
        }

        state.record(
            key.as_str(),
            TrackerRecord {
                last_tag: release.tag.clone(),
                checked_at: Utc::now(),
            },
        );
        self.tracker.write(&state, &key, &release.tag)?;
        info!(source = %source, tag = %release.tag, local_tag = %local_tag, "tracker updated");

        Ok(SourceOutcome::Synced {
            tag: release.tag,
            local_tag,
            created_release: created.is_some(),
            archive_active: session.is_some(),
            summary,
        })
    }

    async fn ensure_destination_release(
        &self,
        source: &UpstreamSource,
        release: &ReleaseDescriptor,
        local_tag: &str,
    ) -> Result<Option<DestinationRelease>, MirrorError> {
        let exists = self
            .host
            .release_exists(&self.destination, local_tag)
            .await
            .map_err(MirrorError::Read)?;
        if exists {
            info!(source = %source, tag = local_tag, "destination release exists; not re-uploading assets there");
            return Ok(None);
        }

        let request = NewRelease {
            tag: local_tag.to_owned(),
            name: self.naming.display_name(source, &release.name),
            body: release.body.clone(),
            draft: release.draft,
            prerelease: release.prerelease,
            target_commitish: None,
        };
        let created = self
            .host
            .create_release(&self.destination, &request)
            .await
            .map_err(|err| MirrorError::CreateRelease {
                tag: local_tag.to_owned(),
                source: err,
            })?;
        Ok(Some(created))
    }

    fn open_archive(&self, source: &UpstreamSource, folder: &str) -> Option<ArchiveSession> {
        let credential = self.archive_credential.as_deref()?;
        let session = match self.archive.authenticate(credential) {
            Ok(session) => session,
            Err(err) => {
                warn!(source = %source, error = %err, "archive login failed; archive disabled for this pass");
                return None;
            }
        };
        if let Err(err) = self.archive.ensure_folder(&session, folder) {
            warn!(source = %source, folder, error = %err, "archive folder unavailable; archive disabled for this pass");
            return None;
        }
        Some(session)
    }
}
