//! Composite build tests.
//!
//! These tests run tasks whose dependencies cross build boundaries and
//! verify ordering, failure propagation and cancellation across builds.

use std::collections::BTreeMap;
use std::thread;

use weave::core::TaskPath;
use weave::engine::ExecutionFailure;
use weave::orchestration::{CompositeBuild, TaskState};
use weave::Error;

use crate::fixtures::{
    execution_log, failing_action, lib_and_app, position, recording_action, settings, Gate,
};

fn states(composite: &CompositeBuild) -> BTreeMap<String, TaskState> {
    composite
        .task_states()
        .into_iter()
        .map(|(path, state)| (path.to_string(), state))
        .collect()
}

/// Test: Cross-build dependency order
/// Given app:compile depending on lib:jar
/// When app:test is requested
/// Then lib runs first and unrequested tasks stay untouched
#[test]
fn test_dependencies_run_before_dependents_across_builds() {
    let log = execution_log();
    let composite = lib_and_app(&log);

    let outcome = composite.run(&[TaskPath::new("app:test")]).unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.results.len(), 2);

    assert!(position(&log, "lib:compile") < position(&log, "lib:jar"));
    assert!(position(&log, "lib:jar") < position(&log, "app:compile"));
    assert!(position(&log, "app:compile") < position(&log, "app:test"));
    assert_eq!(log.lock().unwrap().len(), 4);

    let states = states(&composite);
    assert_eq!(states["app:test"], TaskState::Success);
    assert_eq!(states["app:lint"], TaskState::Waiting);
}

/// Test: Only builds reached by the request take part
#[test]
fn test_unrelated_builds_are_not_run() {
    let log = execution_log();
    let composite = lib_and_app(&log);

    let outcome = composite.run(&[TaskPath::new("lib:jar")]).unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.results.keys().collect::<Vec<_>>(), vec!["lib"]);
    assert!(!log.lock().unwrap().contains(&"app:compile".to_string()));
}

/// Test: Builds can depend on each other in both directions
/// Given app:package -> lib:bundle -> app:classes
/// When app:package is requested
/// Then all three run in dependency order
#[test]
fn test_interleaved_dependencies_between_two_builds() {
    let log = execution_log();
    let composite = CompositeBuild::new(settings(2));
    let app = composite.add_build("app").unwrap();
    let lib = composite.add_build("lib").unwrap();
    app.register("classes", Vec::<&str>::new(), recording_action(&log, "app:classes"))
        .unwrap();
    lib.register("bundle", ["app:classes"], recording_action(&log, "lib:bundle"))
        .unwrap();
    app.register("package", ["lib:bundle"], recording_action(&log, "app:package"))
        .unwrap();

    let outcome = composite.run(&[TaskPath::new("app:package")]).unwrap();
    assert!(outcome.is_success());
    assert!(position(&log, "app:classes") < position(&log, "lib:bundle"));
    assert!(position(&log, "lib:bundle") < position(&log, "app:package"));
}

/// Test: Shared upstream task in a diamond runs once
#[test]
fn test_diamond_across_builds_runs_shared_task_once() {
    let log = execution_log();
    let composite = CompositeBuild::new(settings(2));
    let core = composite.add_build("core").unwrap();
    let left = composite.add_build("left").unwrap();
    let right = composite.add_build("right").unwrap();
    let top = composite.add_build("top").unwrap();
    core.register("base", Vec::<&str>::new(), recording_action(&log, "core:base"))
        .unwrap();
    left.register("x", ["core:base"], recording_action(&log, "left:x"))
        .unwrap();
    right
        .register("y", ["core:base"], recording_action(&log, "right:y"))
        .unwrap();
    top.register("all", ["left:x", "right:y"], recording_action(&log, "top:all"))
        .unwrap();

    let outcome = composite.run(&[TaskPath::new("top:all")]).unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.results.len(), 4);

    let log_entries = log.lock().unwrap().clone();
    assert_eq!(log_entries.iter().filter(|e| *e == "core:base").count(), 1);
    assert_eq!(log_entries.last().map(String::as_str), Some("top:all"));
}

/// Test: Upstream failure
/// Given lib:compile failing
/// When app:test and app:lint are requested
/// Then app:test is skipped as an external failure and app:lint still runs
#[test]
fn test_upstream_failure_skips_dependents_only() {
    let log = execution_log();
    let composite = CompositeBuild::new(settings(2));
    let lib = composite.add_build("lib").unwrap();
    lib.register("compile", Vec::<&str>::new(), failing_action("missing symbol"))
        .unwrap();
    let app = composite.add_build("app").unwrap();
    app.register("test", ["lib:compile"], recording_action(&log, "app:test"))
        .unwrap();
    app.register("lint", Vec::<&str>::new(), recording_action(&log, "app:lint"))
        .unwrap();

    let outcome = composite
        .run(&[TaskPath::new("app:test"), TaskPath::new("app:lint")])
        .unwrap();
    assert!(!outcome.is_success());

    let failures = outcome.failures();
    assert!(failures.contains(&(
        "lib",
        &ExecutionFailure::TaskFailed {
            path: TaskPath::new("lib:compile"),
            message: "missing symbol".to_string(),
        }
    )));
    assert!(failures.contains(&(
        "app",
        &ExecutionFailure::ExternalFailed {
            path: TaskPath::new("lib:compile"),
        }
    )));

    let states = states(&composite);
    assert_eq!(states["lib:compile"], TaskState::Failed);
    assert_eq!(states["app:test"], TaskState::Failed);
    assert_eq!(states["app:lint"], TaskState::Success);
    assert_eq!(*log.lock().unwrap(), vec!["app:lint"]);
}

/// Test: Stopping a composite run cancels every build
#[test]
fn test_stop_cancels_all_builds() {
    let log = execution_log();
    let gate = Gate::new();
    let composite = CompositeBuild::new(settings(2));
    let lib = composite.add_build("lib").unwrap();
    lib.register("compile", Vec::<&str>::new(), gate.action()).unwrap();
    lib.register("jar", ["compile"], recording_action(&log, "lib:jar"))
        .unwrap();
    let app = composite.add_build("app").unwrap();
    app.register("compile", ["lib:jar"], recording_action(&log, "app:compile"))
        .unwrap();

    let outcome = thread::scope(|scope| {
        let run = scope.spawn(|| composite.run(&[TaskPath::new("app:compile")]));
        gate.wait_entered();
        composite.stop();
        gate.release();
        run.join().unwrap()
    })
    .unwrap();

    assert!(!outcome.is_success());
    for build in ["lib", "app"] {
        assert!(
            outcome.results[build]
                .failures()
                .contains(&ExecutionFailure::Stopped),
            "{} was not stopped",
            build
        );
    }
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(states(&composite)["lib:compile"], TaskState::Success);
}

/// Test: Requests naming unknown builds or tasks fail before anything runs
#[test]
fn test_unknown_requests_rejected() {
    let log = execution_log();
    let composite = lib_and_app(&log);

    assert!(matches!(
        composite.run(&[TaskPath::new("docs:site")]),
        Err(Error::UnknownBuild(_))
    ));
    assert!(matches!(
        composite.run(&[TaskPath::new("app:deploy")]),
        Err(Error::NotScheduled { .. })
    ));
    assert!(matches!(
        composite.run(&[TaskPath::new("unqualified")]),
        Err(Error::Validation(_))
    ));
    assert!(log.lock().unwrap().is_empty());
}

/// Test: A second run reuses finished work
#[test]
fn test_second_run_does_not_repeat_tasks() {
    let log = execution_log();
    let composite = lib_and_app(&log);

    assert!(composite.run(&[TaskPath::new("app:test")]).unwrap().is_success());
    assert!(composite.run(&[TaskPath::new("app:test")]).unwrap().is_success());
    assert_eq!(log.lock().unwrap().len(), 4);

    for build in composite.build_names() {
        let build = composite.build(&build).unwrap();
        assert!(!build.controller().has_active_work_graph());
    }
}
