//! Unit tests for the tracker store.

use super::*;
use crate::test_support::{CommandInvocation, ScriptedRunner};
use chrono::TimeZone;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct TrackerFixture {
    _tmp: TempDir,
    dir: Utf8PathBuf,
    runner: ScriptedRunner,
}

impl TrackerFixture {
    fn tracker(&self, layout: TrackerLayout) -> GitTracker<ScriptedRunner> {
        GitTracker::new(self.dir.clone(), layout, identity(), self.runner.clone())
    }

    fn seed(&self, contents: &str) {
        std::fs::write(self.dir.join(STATE_FILE), contents)
            .unwrap_or_else(|err| panic!("seed tracker file: {err}"));
    }

    fn contents(&self) -> String {
        std::fs::read_to_string(self.dir.join(STATE_FILE))
            .unwrap_or_else(|err| panic!("read tracker file: {err}"))
    }
}

#[fixture]
fn tracker_fixture() -> TrackerFixture {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    TrackerFixture {
        _tmp: tmp,
        dir,
        runner: ScriptedRunner::new(),
    }
}

fn identity() -> GitIdentity {
    GitIdentity {
        git_bin: String::from("git"),
        name: String::from("mirror-bot"),
        email: String::from("mirror-bot@example.com"),
    }
}

fn record(tag: &str) -> TrackerRecord {
    TrackerRecord {
        last_tag: tag.to_owned(),
        checked_at: Utc
            .with_ymd_and_hms(2025, 7, 14, 15, 10, 0)
            .single()
            .unwrap_or_else(|| panic!("fixture timestamp should be valid")),
    }
}

#[rstest]
fn read_returns_empty_state_without_file(tracker_fixture: TrackerFixture) {
    let state = tracker_fixture.tracker(TrackerLayout::Multi).read();
    assert!(state.is_empty());
}

#[rstest]
fn read_returns_empty_state_when_directory_is_missing() {
    let tracker = GitTracker::new(
        Utf8PathBuf::from("/nonexistent/tagmirror/tracker"),
        TrackerLayout::Multi,
        identity(),
        ScriptedRunner::new(),
    );
    assert!(tracker.read().is_empty());
}

#[rstest]
#[case("{ not json")]
#[case("[1, 2, 3]")]
#[case("{\"repos\": [\"alice/tools\"]}")]
#[case("{\"repos\": {\"alice/tools\": {\"last_tag\": \"v1\", \"checked_at\": \"yesterday\"}}}")]
fn corrupt_state_is_swallowed(tracker_fixture: TrackerFixture, #[case] contents: &str) {
    tracker_fixture.seed(contents);
    let state = tracker_fixture.tracker(TrackerLayout::Multi).read();
    assert!(state.is_empty(), "corrupt document should read as empty");
}

#[rstest]
fn reads_multi_source_document(tracker_fixture: TrackerFixture) {
    tracker_fixture.seed(
        r#"{
  "repos": {
    "alice/tools": {"last_tag": "v1.2.0", "checked_at": "2025-07-14T15:10:00.123456+00:00"},
    "bob/firmware": {"last_tag": "2025.07", "checked_at": "2025-07-14T15:11:00Z"}
  }
}"#,
    );

    let state = tracker_fixture.tracker(TrackerLayout::Multi).read();

    assert_eq!(state.len(), 2);
    assert_eq!(state.last_tag("alice/tools"), Some("v1.2.0"));
    assert_eq!(state.last_tag("bob/firmware"), Some("2025.07"));
}

#[rstest]
fn reads_single_source_document(tracker_fixture: TrackerFixture) {
    tracker_fixture.seed(
        r#"{"last_tag": "v9", "upstream_repo": "alice/tools", "checked_at": "2025-07-14T15:10:00+00:00"}"#,
    );

    let state = tracker_fixture.tracker(TrackerLayout::Single).read();

    assert_eq!(state.len(), 1);
    assert_eq!(state.last_tag("alice/tools"), Some("v9"));
}

#[rstest]
fn write_renders_multi_document_and_publishes(tracker_fixture: TrackerFixture) {
    let runner = tracker_fixture.runner.clone();
    runner.push_success();
    runner.push_success();
    runner.push_success();
    let tracker = tracker_fixture.tracker(TrackerLayout::Multi);
    let mut state = TrackerState::default();
    state.record("alice/tools", record("v1.2.0"));

    tracker
        .write(&state, "alice/tools", "v1.2.0")
        .unwrap_or_else(|err| panic!("write tracker: {err}"));

    let contents = tracker_fixture.contents();
    assert!(contents.starts_with("{\n  \"repos\": {\n"), "got: {contents}");
    let reread = parse_state(&contents).unwrap_or_else(|| panic!("written state should parse"));
    assert_eq!(reread, state);

    let commands = runner
        .invocations()
        .iter()
        .map(CommandInvocation::command_string)
        .collect::<Vec<_>>();
    assert_eq!(
        commands,
        [
            "git add state.json",
            "git -c user.name=mirror-bot -c user.email=mirror-bot@example.com commit -m chore(tracker): alice/tools -> v1.2.0",
            "git push",
        ]
    );
    assert!(
        runner
            .invocations()
            .iter()
            .all(|call| call.dir.as_deref() == Some(tracker_fixture.dir.as_path())),
        "git must run inside the tracker checkout"
    );
}

#[rstest]
fn write_renders_single_document(tracker_fixture: TrackerFixture) {
    for _ in 0..3 {
        tracker_fixture.runner.push_success();
    }
    let tracker = tracker_fixture.tracker(TrackerLayout::Single);
    let mut state = TrackerState::default();
    state.record("alice/tools", record("v9"));

    tracker
        .write(&state, "alice/tools", "v9")
        .unwrap_or_else(|err| panic!("write tracker: {err}"));

    let value: serde_json::Value = serde_json::from_str(&tracker_fixture.contents())
        .unwrap_or_else(|err| panic!("parse written tracker: {err}"));
    assert_eq!(value["last_tag"], "v9");
    assert_eq!(value["upstream_repo"], "alice/tools");
    assert!(value.get("repos").is_none());

    let invocations = tracker_fixture.runner.invocations();
    let commit = invocations
        .get(1)
        .unwrap_or_else(|| panic!("commit invocation missing"));
    assert!(commit.command_string().ends_with("-m chore(tracker): v9"));
}

#[rstest]
fn push_rejection_is_a_persistence_error(tracker_fixture: TrackerFixture) {
    tracker_fixture.runner.push_success();
    tracker_fixture.runner.push_success();
    tracker_fixture
        .runner
        .push_output(Some(1), "", "! [rejected] main -> main (fetch first)");
    let tracker = tracker_fixture.tracker(TrackerLayout::Multi);
    let mut state = TrackerState::default();
    state.record("alice/tools", record("v2"));

    let err = tracker
        .write(&state, "alice/tools", "v2")
        .expect_err("push rejection should fail");

    let TrackerError::Publish { step, stderr, .. } = err else {
        panic!("expected Publish error, got {err:?}");
    };
    assert_eq!(step, "push");
    assert!(stderr.contains("rejected"));
}

#[rstest]
fn missing_git_is_a_persistence_error(tracker_fixture: TrackerFixture) {
    let tracker = tracker_fixture.tracker(TrackerLayout::Multi);
    let mut state = TrackerState::default();
    state.record("alice/tools", record("v2"));

    let err = tracker
        .write(&state, "alice/tools", "v2")
        .expect_err("runner failure should surface");

    assert!(matches!(err, TrackerError::Runner(_)));
}

#[rstest]
fn single_layout_requires_changed_record() {
    let err = render_state(&TrackerState::default(), TrackerLayout::Single, "alice/tools")
        .expect_err("missing record should fail");
    assert!(matches!(err, TrackerError::Render { .. }));
}

#[rstest]
#[case("multi", TrackerLayout::Multi)]
#[case(" Single ", TrackerLayout::Single)]
fn layouts_parse_case_insensitively(#[case] raw: &str, #[case] expected: TrackerLayout) {
    assert_eq!(raw.parse::<TrackerLayout>(), Ok(expected));
}
