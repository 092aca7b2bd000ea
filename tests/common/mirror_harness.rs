//! Shared orchestrator wiring for integration tests.

use tagmirror::test_support::{FakeReleaseHost, MemoryTracker, RecordingArchive};
use tagmirror::{
    MirrorOrchestrator, MirrorSettings, NamingRules, ProcessingMode, RepoId, TrackerLayout,
    UpstreamSource,
};

pub struct MirrorHarness {
    pub host: FakeReleaseHost,
    pub archive: RecordingArchive,
    pub tracker: MemoryTracker,
    pub settings: MirrorSettings,
}

impl MirrorHarness {
    pub fn new(sources: &[&str]) -> Self {
        Self {
            host: FakeReleaseHost::new(),
            archive: RecordingArchive::new(),
            tracker: MemoryTracker::new(),
            settings: settings(sources),
        }
    }

    pub fn orchestrator(
        &self,
    ) -> MirrorOrchestrator<FakeReleaseHost, RecordingArchive, MemoryTracker> {
        MirrorOrchestrator::new(
            self.host.clone(),
            self.archive.clone(),
            self.tracker.clone(),
            &self.settings,
        )
    }
}

pub fn repo(value: &str) -> RepoId {
    value
        .parse()
        .unwrap_or_else(|err| panic!("repo id {value}: {err}"))
}

pub fn settings(sources: &[&str]) -> MirrorSettings {
    MirrorSettings {
        destination: repo("mirror/releases"),
        sources: sources
            .iter()
            .map(|value| UpstreamSource::new(repo(value)))
            .collect(),
        naming: NamingRules {
            namespace_tags: true,
            prefix_display_names: true,
            per_source_folders: true,
            append_tag_to_archive: true,
            archive_root: String::from("/apps/release-sync"),
        },
        tracker_layout: TrackerLayout::Multi,
        mode: ProcessingMode::Stream,
        archive_credential: Some(String::from("BDUSS=token")),
    }
}
