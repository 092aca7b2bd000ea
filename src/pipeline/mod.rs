//! Per-asset fetch, fan-out and cleanup.
//!
//! Each asset is streamed into the pass's scratch directory, uploaded to the
//! destination release and the archive when those targets are active, then
//! deleted. Upload failures are recorded on the asset's [`AssetReport`] and
//! never stop the remaining assets. Only local storage exhaustion aborts.

use std::fmt;
use std::io;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveBackend, ArchiveSession};
use crate::host::{AssetDescriptor, DestinationRelease, ReleaseHost, ReleaseHostError};

/// Ordering of fetch and fan-out within a pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProcessingMode {
    /// Fetch, fan out and clean one asset at a time.
    #[default]
    Stream,
    /// Fetch every asset first, then fan out and clean each in turn.
    Batch,
}

/// Error returned when a processing mode name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown processing mode '{0}': expected 'stream' or 'batch'")]
pub struct UnknownMode(pub String);

impl FromStr for ProcessingMode {
    type Err = UnknownMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "batch" => Ok(Self::Batch),
            _ => Err(UnknownMode(value.to_owned())),
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::Batch => f.write_str("batch"),
        }
    }
}

/// Furthest point an asset reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssetStage {
    /// Not yet fetched.
    Pending,
    /// Body stored locally; fan-out pending or local cleanup failed.
    Fetched,
    /// Fan-out finished and the local copy was removed.
    Cleaned,
    /// The body could not be fetched; the asset was skipped.
    FetchFailed,
}

/// Result of one upload target for one asset.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum TargetOutcome {
    /// The target was not active for this pass.
    #[default]
    Inactive,
    /// The upload succeeded.
    Uploaded,
    /// The upload failed with the given message.
    Failed(String),
}

/// Per-asset record produced by the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssetReport {
    /// Asset name.
    pub name: String,
    /// Final stage reached.
    pub stage: AssetStage,
    /// Bytes written locally, when fetched.
    pub bytes: Option<u64>,
    /// Fetch failure message, when the asset was skipped.
    pub fetch_error: Option<String>,
    /// Destination release upload result.
    pub release: TargetOutcome,
    /// Archive upload result.
    pub archive: TargetOutcome,
}

impl AssetReport {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            stage: AssetStage::Pending,
            bytes: None,
            fetch_error: None,
            release: TargetOutcome::Inactive,
            archive: TargetOutcome::Inactive,
        }
    }

    /// Returns `true` when any active target failed or the fetch failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.stage == AssetStage::FetchFailed
            || matches!(self.release, TargetOutcome::Failed(_))
            || matches!(self.archive, TargetOutcome::Failed(_))
    }
}

/// Reports for every asset of one pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PipelineSummary {
    /// Reports in processing order.
    pub assets: Vec<AssetReport>,
}

impl PipelineSummary {
    fn count(&self, predicate: impl Fn(&AssetReport) -> bool) -> usize {
        self.assets.iter().filter(|report| predicate(report)).count()
    }

    /// Assets whose body was fetched.
    #[must_use]
    pub fn fetched(&self) -> usize {
        self.count(|report| report.stage != AssetStage::FetchFailed)
    }

    /// Assets skipped because the fetch failed.
    #[must_use]
    pub fn fetch_failed(&self) -> usize {
        self.count(|report| report.stage == AssetStage::FetchFailed)
    }

    /// Assets attached to the destination release.
    #[must_use]
    pub fn release_uploaded(&self) -> usize {
        self.count(|report| report.release == TargetOutcome::Uploaded)
    }

    /// Assets copied to the archive.
    #[must_use]
    pub fn archive_uploaded(&self) -> usize {
        self.count(|report| report.archive == TargetOutcome::Uploaded)
    }

    /// Assets with at least one failure.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(AssetReport::has_failures)
    }

    /// Assets whose local copy could not be removed.
    #[must_use]
    pub fn not_cleaned(&self) -> usize {
        self.count(|report| report.stage == AssetStage::Fetched)
    }
}

impl fmt::Display for PipelineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} assets: {} fetched, {} fetch failures, {} release uploads, {} archive uploads, {} with failures",
            self.assets.len(),
            self.fetched(),
            self.fetch_failed(),
            self.release_uploaded(),
            self.archive_uploaded(),
            self.failed()
        )
    }
}

/// Errors that abort the whole run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PipelineError {
    /// Raised when local storage fills up while fetching an asset.
    #[error("local storage exhausted while fetching {asset}: {source}")]
    StorageExhausted {
        /// Asset being fetched.
        asset: String,
        /// Underlying host error.
        source: ReleaseHostError,
    },
}

/// Active archive destination for a pass.
#[derive(Debug)]
pub struct ArchiveTarget<'a, A: ArchiveBackend> {
    backend: &'a A,
    session: &'a ArchiveSession,
    folder: &'a str,
}

impl<'a, A: ArchiveBackend> ArchiveTarget<'a, A> {
    /// Targets `folder` through an authenticated `backend` session.
    #[must_use]
    pub const fn new(backend: &'a A, session: &'a ArchiveSession, folder: &'a str) -> Self {
        Self {
            backend,
            session,
            folder,
        }
    }
}

/// Moves the assets of one release through fetch, fan-out and cleanup.
pub struct AssetPipeline<'a, H: ReleaseHost, A: ArchiveBackend> {
    host: &'a H,
    scratch: &'a Utf8Path,
    mode: ProcessingMode,
    release: Option<&'a DestinationRelease>,
    archive: Option<ArchiveTarget<'a, A>>,
}

impl<'a, H: ReleaseHost, A: ArchiveBackend> AssetPipeline<'a, H, A> {
    /// Creates a pipeline writing into `scratch` with no active targets.
    #[must_use]
    pub const fn new(host: &'a H, scratch: &'a Utf8Path, mode: ProcessingMode) -> Self {
        Self {
            host,
            scratch,
            mode,
            release: None,
            archive: None,
        }
    }

    /// Activates uploads to `release`.
    #[must_use]
    pub const fn with_release(mut self, release: Option<&'a DestinationRelease>) -> Self {
        self.release = release;
        self
    }

    /// Activates uploads to the archive.
    #[must_use]
    pub const fn with_archive(mut self, archive: Option<ArchiveTarget<'a, A>>) -> Self {
        self.archive = archive;
        self
    }

    /// Processes `assets` in order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StorageExhausted`] when local storage runs out.
    /// Every other failure is recorded on the returned reports.
    pub async fn run(&self, assets: &[AssetDescriptor]) -> Result<PipelineSummary, PipelineError> {
        let mut reports = Vec::with_capacity(assets.len());
        match self.mode {
            ProcessingMode::Stream => {
                for asset in assets {
                    let mut report = self.fetch(asset).await?;
                    if report.stage == AssetStage::Fetched {
                        self.fan_out(&mut report).await;
                    }
                    reports.push(report);
                }
            }
            ProcessingMode::Batch => {
                for asset in assets {
                    match self.fetch(asset).await {
                        Ok(report) => reports.push(report),
                        Err(err) => {
                            self.discard_fetched(&reports).await;
                            return Err(err);
                        }
                    }
                }
                for report in &mut reports {
                    if report.stage == AssetStage::Fetched {
                        self.fan_out(report).await;
                    }
                }
            }
        }

        let summary = PipelineSummary { assets: reports };
        info!(mode = %self.mode, summary = %summary, "asset pipeline finished");
        Ok(summary)
    }

    fn local_path(&self, name: &str) -> Utf8PathBuf {
        self.scratch.join(name)
    }

    async fn fetch(&self, asset: &AssetDescriptor) -> Result<AssetReport, PipelineError> {
        let mut report = AssetReport::pending(&asset.name);
        let path = self.local_path(&asset.name);
        match self.host.download_asset(asset, &path).await {
            Ok(bytes) => {
                debug!(asset = %asset.name, bytes, "asset fetched");
                report.stage = AssetStage::Fetched;
                report.bytes = Some(bytes);
            }
            Err(err) if err.is_storage_full() => {
                remove_quietly(&path).await;
                return Err(PipelineError::StorageExhausted {
                    asset: asset.name.clone(),
                    source: err,
                });
            }
            Err(err) => {
                warn!(asset = %asset.name, error = %err, "asset fetch failed; skipping");
                remove_quietly(&path).await;
                report.stage = AssetStage::FetchFailed;
                report.fetch_error = Some(err.to_string());
            }
        }
        Ok(report)
    }

    async fn fan_out(&self, report: &mut AssetReport) {
        let path = self.local_path(&report.name);

        if let Some(release) = self.release {
            report.release = match self.host.upload_asset(release, &path).await {
                Ok(handle) => {
                    info!(asset = %report.name, tag = %release.tag, id = handle.id, "uploaded to release");
                    TargetOutcome::Uploaded
                }
                Err(err) => {
                    warn!(asset = %report.name, tag = %release.tag, error = %err, "release upload failed");
                    TargetOutcome::Failed(err.to_string())
                }
            };
        }

        if let Some(target) = &self.archive {
            report.archive = match target.backend.upload_file(target.session, &path, target.folder)
            {
                Ok(()) => {
                    info!(asset = %report.name, folder = target.folder, "uploaded to archive");
                    TargetOutcome::Uploaded
                }
                Err(err) => {
                    warn!(asset = %report.name, folder = target.folder, error = %err, "archive upload failed");
                    TargetOutcome::Failed(err.to_string())
                }
            };
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => report.stage = AssetStage::Cleaned,
            Err(err) => {
                warn!(asset = %report.name, path = %path, error = %err, "failed to delete local copy");
            }
        }
    }

    async fn discard_fetched(&self, reports: &[AssetReport]) {
        for report in reports {
            if report.stage == AssetStage::Fetched {
                remove_quietly(&self.local_path(&report.name)).await;
            }
        }
    }
}

async fn remove_quietly(path: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path, error = %err, "failed to delete partial download");
    }
}

#[cfg(test)]
mod tests;
