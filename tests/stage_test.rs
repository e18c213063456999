mod common;

use anvil::build_log::{DeltaRecorder, LogSnapshot, LogSource, SkipReason, Status};
use anvil::stage::{Command, StageManager};
use common::*;
use parking_lot::Mutex;
use std::sync::Arc;

fn spans() -> Arc<Mutex<Vec<Span>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn test_failed_clean_skips_build() {
    let project = Project::new();
    let recorded = spans();
    let session = project.session(
        root_module(vec![rule("bad", "fail"), rule("ok", "timed")]),
        test_registry(recorded.clone()),
        &[":bad", ":ok"],
        2,
    );
    let root = LogSource::root(Command::Rebuild.name());
    let outcome = StageManager::new(Arc::new(session), root.clone())
        .run(&Command::Rebuild.stages())
        .await;

    let clean = outcome.stage("clean").unwrap();
    assert_eq!(clean.status, Status::Failed);
    let build = outcome.stage("build").unwrap();
    assert_eq!(build.status, Status::Skipped);
    assert_eq!(build.skip_reason, Some(SkipReason::PreviousStageFailed));
    assert!(build.report.is_none(), "a skipped stage never schedules");
    assert!(recorded.lock().is_empty());

    assert_eq!(outcome.result, Status::Failed);
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(root.status(), Status::Failed);
    assert!(root.is_closed());
    let build_log = root.find_child("build").unwrap();
    assert_eq!(build_log.skip_reason(), Some(SkipReason::PreviousStageFailed));
    assert!(build_log.children().is_empty());
}

#[tokio::test]
async fn test_unchanged_build_stage_is_skipped() {
    let project = Project::new();
    project.write("src/a.txt", "A");
    let rules = || vec![rule("copied", "copy_files").with_srcs(["src/a.txt"])];

    let first = project.session(root_module(rules()), test_registry(spans()), &[":copied"], 2);
    let outcome = StageManager::new(Arc::new(first), LogSource::root("build"))
        .run(&Command::Build.stages())
        .await;
    assert_eq!(outcome.result, Status::Succeeded);

    let second = project.session(root_module(rules()), test_registry(spans()), &[":copied"], 2);
    let root = LogSource::root("build");
    let outcome = StageManager::new(Arc::new(second), root.clone())
        .run(&Command::Build.stages())
        .await;
    let stage = outcome.stage("build").unwrap();
    assert_eq!(stage.status, Status::Skipped);
    assert_eq!(stage.skip_reason, Some(SkipReason::Unchanged));
    assert_eq!(outcome.result, Status::Skipped);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(root.status(), Status::Skipped);
}

#[tokio::test]
async fn test_stage_without_test_rules_is_not_applicable() {
    let project = Project::new();
    project.write("src/a.txt", "A");
    let session = project.session(
        root_module(vec![
            rule("files", "file_set").with_srcs(["src/*.txt"]),
            rule("copied", "copy_files").with_srcs([":files"]),
            rule("bundle", "concat_files")
                .with_srcs([":copied"])
                .with_param("out", serde_json::json!("bundle.txt")),
        ]),
        test_registry(spans()),
        &[":bundle"],
        2,
    );
    let root = LogSource::root("test");
    let outcome = StageManager::new(Arc::new(session), root.clone())
        .run(&Command::Test.stages())
        .await;

    assert_eq!(outcome.stage("build").unwrap().status, Status::Succeeded);
    let test = outcome.stage("test").unwrap();
    assert_eq!(test.status, Status::Skipped);
    assert_eq!(test.skip_reason, Some(SkipReason::NotApplicable));
    assert_eq!(
        root.find_child("test").unwrap().skip_reason(),
        Some(SkipReason::NotApplicable)
    );
    assert_eq!(outcome.result, Status::Succeeded);
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn test_graph_error_fails_stage_and_skips_rest() {
    let project = Project::new();
    let session = project.session(
        root_module(vec![rule("a", "file_set").with_deps(["/nowhere:x"])]),
        test_registry(spans()),
        &[":a"],
        2,
    );
    let root = LogSource::root("test");
    let outcome = StageManager::new(Arc::new(session), root.clone())
        .run(&Command::Test.stages())
        .await;

    let build = outcome.stage("build").unwrap();
    assert_eq!(build.status, Status::Failed);
    assert!(build.error.as_ref().unwrap().contains("/nowhere:x"));
    assert!(root.find_child("build").unwrap().exception().is_some());
    assert_eq!(
        outcome.stage("test").unwrap().skip_reason,
        Some(SkipReason::PreviousStageFailed)
    );
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn test_recorded_deltas_rebuild_the_log_tree() {
    let project = Project::new();
    project.write("src/a.txt", "A");
    let session = project.session(
        root_module(vec![
            rule("copied", "copy_files").with_srcs(["src/a.txt"]),
            rule("check", "shell_test")
                .with_srcs([":copied"])
                .with_param("command", serde_json::json!(["grep", "-q", "A"])),
        ]),
        test_registry(spans()),
        &[":check"],
        2,
    );
    let root = LogSource::root("test");
    let recorder = Arc::new(DeltaRecorder::new());
    root.add_sink(recorder.clone());

    let outcome = StageManager::new(Arc::new(session), root.clone())
        .run(&Command::Test.stages())
        .await;
    assert_eq!(outcome.result, Status::Succeeded);

    let mut mirror = LogSnapshot::new("test");
    mirror.apply(&recorder.take().unwrap());
    let live = root.snapshot();

    assert_eq!(mirror.status, live.status);
    assert!(mirror.closed);
    for stage in ["build", "test"] {
        for rule in ["/:copied", "/:check"] {
            let path = [stage, rule];
            let mirrored = mirror.find(&path).unwrap();
            let actual = live.find(&path).unwrap();
            assert_eq!(mirrored.status, actual.status, "{:?}", path);
            assert_eq!(mirrored.skip_reason, actual.skip_reason, "{:?}", path);
            assert_eq!(mirrored.output.len(), actual.output.len(), "{:?}", path);
        }
    }
    assert_eq!(
        mirror.find(&["test", "/:copied"]).unwrap().skip_reason,
        Some(SkipReason::NotApplicable)
    );
    assert!(mirror.is_finished());
}
