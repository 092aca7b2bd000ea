//! Tests for the asset pipeline.

use super::*;
use crate::test_support::{FakeReleaseHost, RecordingArchive, asset_url, release_descriptor};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct PipelineFixture {
    _tmp: TempDir,
    scratch: Utf8PathBuf,
    host: FakeReleaseHost,
    archive: RecordingArchive,
    session: ArchiveSession,
    release: DestinationRelease,
}

impl PipelineFixture {
    fn leftover_files(&self) -> usize {
        std::fs::read_dir(&self.scratch)
            .unwrap_or_else(|err| panic!("read scratch: {err}"))
            .count()
    }
}

#[fixture]
fn fixture() -> PipelineFixture {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let scratch = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    PipelineFixture {
        _tmp: tmp,
        scratch,
        host: FakeReleaseHost::new(),
        archive: RecordingArchive::new(),
        session: ArchiveSession::new("token"),
        release: DestinationRelease {
            tag: String::from("tools-v1.0.0"),
            name: String::from("[tools] Release v1.0.0"),
            upload_url: String::from("https://uploads.test/mirror/releases/tools-v1.0.0"),
            html_url: None,
        },
    }
}

fn assets(names: &[&str]) -> Vec<AssetDescriptor> {
    let release = release_descriptor("v1.0.0", names);
    release.assets
}

#[rstest]
#[case("stream", ProcessingMode::Stream)]
#[case(" BATCH ", ProcessingMode::Batch)]
fn modes_parse_case_insensitively(#[case] raw: &str, #[case] expected: ProcessingMode) {
    assert_eq!(raw.parse::<ProcessingMode>(), Ok(expected));
}

#[rstest]
fn unknown_mode_is_rejected() {
    let err = "parallel"
        .parse::<ProcessingMode>()
        .expect_err("unknown mode should fail");
    assert!(err.to_string().contains("parallel"));
}

#[rstest]
#[case(ProcessingMode::Stream)]
#[case(ProcessingMode::Batch)]
#[tokio::test]
async fn every_asset_reaches_both_targets_and_is_cleaned(
    fixture: PipelineFixture,
    #[case] mode: ProcessingMode,
) {
    fixture
        .host
        .publish("alice/tools", release_descriptor("v1.0.0", &["a.zip", "b.zip"]));
    let pipeline = AssetPipeline::new(&fixture.host, &fixture.scratch, mode)
        .with_release(Some(&fixture.release))
        .with_archive(Some(ArchiveTarget::new(
            &fixture.archive,
            &fixture.session,
            "/apps/tools/v1.0.0",
        )));

    let summary = pipeline
        .run(&assets(&["a.zip", "b.zip"]))
        .await
        .unwrap_or_else(|err| panic!("pipeline: {err}"));

    assert_eq!(summary.release_uploaded(), 2);
    assert_eq!(summary.archive_uploaded(), 2);
    assert_eq!(summary.failed(), 0);
    assert!(
        summary
            .assets
            .iter()
            .all(|report| report.stage == AssetStage::Cleaned)
    );
    let uploads = fixture.host.uploads();
    assert_eq!(
        uploads.iter().map(|upload| upload.name.as_str()).collect::<Vec<_>>(),
        ["a.zip", "b.zip"]
    );
    assert_eq!(uploads.first().map(|upload| upload.contents.clone()), Some(b"a.zip body".to_vec()));
    assert!(
        fixture
            .archive
            .files()
            .iter()
            .all(|file| file.folder == "/apps/tools/v1.0.0")
    );
    assert_eq!(fixture.leftover_files(), 0);
}

#[rstest]
#[tokio::test]
async fn batch_mode_uploads_each_fetched_asset_once(fixture: PipelineFixture) {
    fixture
        .host
        .publish("alice/tools", release_descriptor("v1.0.0", &["a.zip", "b.zip"]));
    let pipeline = AssetPipeline::<_, RecordingArchive>::new(
        &fixture.host,
        &fixture.scratch,
        ProcessingMode::Batch,
    )
    .with_release(Some(&fixture.release));

    pipeline
        .run(&assets(&["a.zip", "b.zip"]))
        .await
        .unwrap_or_else(|err| panic!("pipeline: {err}"));

    assert_eq!(fixture.host.downloads().len(), 2);
    assert_eq!(fixture.host.uploads().len(), 2);
    assert_eq!(fixture.leftover_files(), 0);
}

#[rstest]
#[tokio::test]
async fn failed_fetch_skips_only_that_asset(fixture: PipelineFixture) {
    fixture
        .host
        .publish("alice/tools", release_descriptor("v1.0.0", &["a.zip", "b.zip", "c.zip"]));
    fixture.host.fail_download(
        &asset_url("v1.0.0", "b.zip"),
        ReleaseHostError::Fetch {
            url: asset_url("v1.0.0", "b.zip"),
            message: String::from("HTTP 500"),
        },
    );
    let pipeline = AssetPipeline::<_, RecordingArchive>::new(
        &fixture.host,
        &fixture.scratch,
        ProcessingMode::Stream,
    )
    .with_release(Some(&fixture.release));

    let summary = pipeline
        .run(&assets(&["a.zip", "b.zip", "c.zip"]))
        .await
        .unwrap_or_else(|err| panic!("pipeline: {err}"));

    assert_eq!(summary.fetch_failed(), 1);
    assert_eq!(summary.release_uploaded(), 2);
    let skipped = summary
        .assets
        .iter()
        .find(|report| report.name == "b.zip")
        .unwrap_or_else(|| panic!("b.zip report missing"));
    assert_eq!(skipped.stage, AssetStage::FetchFailed);
    assert_eq!(skipped.release, TargetOutcome::Inactive);
    assert_eq!(fixture.leftover_files(), 0);
}

#[rstest]
#[tokio::test]
async fn upload_failures_are_contained_per_target(fixture: PipelineFixture) {
    fixture
        .host
        .publish("alice/tools", release_descriptor("v1.0.0", &["a.zip", "b.zip"]));
    fixture.host.fail_upload("a.zip");
    fixture.archive.fail_upload("b.zip");
    let pipeline = AssetPipeline::new(&fixture.host, &fixture.scratch, ProcessingMode::Stream)
        .with_release(Some(&fixture.release))
        .with_archive(Some(ArchiveTarget::new(
            &fixture.archive,
            &fixture.session,
            "/apps/tools",
        )));

    let summary = pipeline
        .run(&assets(&["a.zip", "b.zip"]))
        .await
        .unwrap_or_else(|err| panic!("pipeline: {err}"));

    let [first, second] = summary.assets.as_slice() else {
        panic!("expected two reports, got {:?}", summary.assets);
    };
    assert!(matches!(first.release, TargetOutcome::Failed(_)));
    assert_eq!(first.archive, TargetOutcome::Uploaded);
    assert_eq!(second.release, TargetOutcome::Uploaded);
    assert!(matches!(second.archive, TargetOutcome::Failed(_)));
    assert_eq!(summary.failed(), 2);
    assert_eq!(fixture.leftover_files(), 0);
}

#[rstest]
#[tokio::test]
async fn inactive_targets_still_clean_up(fixture: PipelineFixture) {
    fixture
        .host
        .publish("alice/tools", release_descriptor("v1.0.0", &["a.zip"]));
    let pipeline = AssetPipeline::<_, RecordingArchive>::new(
        &fixture.host,
        &fixture.scratch,
        ProcessingMode::Stream,
    );

    let summary = pipeline
        .run(&assets(&["a.zip"]))
        .await
        .unwrap_or_else(|err| panic!("pipeline: {err}"));

    assert_eq!(fixture.host.write_count(), 0);
    assert_eq!(
        summary.assets.first().map(|report| report.stage),
        Some(AssetStage::Cleaned)
    );
    assert_eq!(fixture.leftover_files(), 0);
}

#[rstest]
#[case(ProcessingMode::Stream)]
#[case(ProcessingMode::Batch)]
#[tokio::test]
async fn storage_exhaustion_aborts_and_cleans(
    fixture: PipelineFixture,
    #[case] mode: ProcessingMode,
) {
    fixture
        .host
        .publish("alice/tools", release_descriptor("v1.0.0", &["a.zip", "b.zip", "c.zip"]));
    fixture.host.fail_download(
        &asset_url("v1.0.0", "b.zip"),
        ReleaseHostError::StorageFull {
            path: fixture.scratch.join("b.zip"),
            message: String::from("No space left on device"),
        },
    );
    let pipeline = AssetPipeline::<_, RecordingArchive>::new(&fixture.host, &fixture.scratch, mode)
        .with_release(Some(&fixture.release));

    let err = pipeline
        .run(&assets(&["a.zip", "b.zip", "c.zip"]))
        .await
        .expect_err("storage exhaustion should abort");

    let PipelineError::StorageExhausted { asset, .. } = err;
    assert_eq!(asset, "b.zip");
    assert!(
        !fixture
            .host
            .downloads()
            .contains(&asset_url("v1.0.0", "c.zip")),
        "no fetch after exhaustion"
    );
    assert_eq!(fixture.leftover_files(), 0);
}

#[rstest]
fn summary_renders_counts() {
    let summary = PipelineSummary {
        assets: vec![AssetReport {
            name: String::from("a.zip"),
            stage: AssetStage::Cleaned,
            bytes: Some(3),
            fetch_error: None,
            release: TargetOutcome::Uploaded,
            archive: TargetOutcome::Inactive,
        }],
    };
    assert_eq!(
        summary.to_string(),
        "1 assets: 1 fetched, 0 fetch failures, 1 release uploads, 0 archive uploads, 0 with failures"
    );
}
