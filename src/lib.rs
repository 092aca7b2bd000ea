//! Core library for the tagmirror release mirroring tool.
//!
//! The crate mirrors the latest release of one or more upstream repositories
//! into a destination repository's releases and an archive folder, recording
//! the last synced tag per source in a version-controlled tracker so repeated
//! runs only act on new tags.

pub mod archive;
pub mod command;
pub mod config;
pub mod host;
pub mod logging;
pub mod mirror;
pub mod pipeline;
pub mod source;
pub mod test_support;
pub mod tracker;

pub use archive::{
    ArchiveBackend, ArchiveError, ArchiveSession, CookieFieldExtractor, CredentialError,
    CredentialExtractor, PcsArchive,
};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, MirrorConfig, MirrorSettings};
pub use host::{GithubClient, ReleaseHost, ReleaseHostError};
pub use logging::{LoggingError, init_logging};
pub use mirror::{BatchReport, MirrorError, MirrorOrchestrator, SourceOutcome, SourceReport};
pub use pipeline::{AssetPipeline, PipelineError, PipelineSummary, ProcessingMode};
pub use source::{NamingRules, RepoId, UpstreamSource};
pub use tracker::{GitIdentity, GitTracker, TrackerError, TrackerLayout, TrackerStore};
