//! Session protocol and exported node tests.
//!
//! These tests verify the coordinator's contract with its callers: one
//! session per build at a time, thread ownership, idempotent scheduling and
//! listener semantics on exported task nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use weave::core::TaskPath;
use weave::engine::{ExecutionFailure, ExecutionResult, WorkPlan};
use weave::orchestration::{LateListenerPolicy, SessionPhase, TaskState};
use weave::Error;

use crate::fixtures::{execution_log, failing_action, recording_action, Gate, TestBuild};

fn counting_listener(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test: Locating a path twice yields the same node
#[test]
fn test_locate_returns_same_instance() {
    let build = TestBuild::new("build");
    let first = build.node("build:a");
    let second = build.node("build:a");

    assert!(first.ptr_eq(&second));
    assert_eq!(build.controller.registry().len(), 1);
}

/// Test: End-to-end run with session exclusivity
/// Given a session blocked in run_work on another thread
/// When a second session is requested
/// Then it fails until run_work returns, and succeeds right after
#[test]
fn test_end_to_end_session_exclusivity() {
    let build = TestBuild::new("p");
    let gate = Gate::new();
    build
        .engine
        .register("build:a", Vec::<&str>::new(), gate.action())
        .unwrap();
    let node = build.node("p:build:a");
    assert_eq!(node.task_state(), TaskState::Waiting);

    let controller = build.controller.clone();
    let scheduled = node.clone();
    let runner = thread::spawn(move || -> weave::Result<ExecutionResult> {
        let mut session = controller.new_work_graph()?;
        assert!(session.schedule(&[scheduled])?);
        session.finalize_graph()?;
        session.run_work()
    });

    gate.wait_entered();
    assert_eq!(node.task_state(), TaskState::Waiting);
    match build.controller.new_work_graph() {
        Err(Error::WorkGraphInUse { build }) => assert_eq!(build, "p"),
        other => panic!("expected WorkGraphInUse, got {:?}", other),
    }

    gate.release();
    let result = runner.join().unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(node.task_state(), TaskState::Success);
    assert!(build.controller.new_work_graph().is_ok());
}

/// Test: Scheduling from a non-owner thread
/// Given a session with `a` scheduled
/// When another thread schedules `b`
/// Then it fails with NotOwner and the plan still holds only `a`
#[test]
fn test_non_owner_schedule_leaves_plan_unmodified() {
    let build = TestBuild::new("app");
    build.engine.register_noop("a", Vec::<&str>::new()).unwrap();
    build.engine.register_noop("b", Vec::<&str>::new()).unwrap();
    let a = build.node("app:a");
    let b = build.node("app:b");

    let mut session = build.controller.new_work_graph().unwrap();
    assert!(session.schedule(&[a]).unwrap());

    let session = thread::scope(|scope| {
        scope
            .spawn(move || {
                let result = session.schedule(&[b]);
                assert!(matches!(result, Err(Error::NotOwner { .. })));
                assert!(matches!(session.finalize_graph(), Err(Error::NotOwner { .. })));
                session
            })
            .join()
            .unwrap()
    });

    let plan = session.plan().unwrap();
    assert_eq!(plan.entry_tasks(), vec![TaskPath::new("app:a")]);
    assert!(!plan.contains(&TaskPath::new("app:b")));
    assert_eq!(session.phase(), SessionPhase::Scheduling);
}

/// Test: Scheduling the same node twice adds nothing the second time
#[test]
fn test_schedule_same_node_twice() {
    let build = TestBuild::new("app");
    build.engine.register_noop("a", Vec::<&str>::new()).unwrap();
    let a = build.node("app:a");

    let mut session = build.controller.new_work_graph().unwrap();
    assert!(session.schedule(&[a.clone()]).unwrap());
    assert!(!session.schedule(&[a.clone()]).unwrap());
    assert!(!session.schedule(&[a.clone(), a]).unwrap());
    assert!(session.run_work().unwrap().is_success());
}

/// Test: Scheduling a dependency of an already scheduled task is a no-op
#[test]
fn test_schedule_already_required_dependency() {
    let build = TestBuild::new("app");
    build.engine.register_noop("compile", Vec::<&str>::new()).unwrap();
    build.engine.register_noop("test", ["compile"]).unwrap();

    let mut session = build.controller.new_work_graph().unwrap();
    assert!(session.schedule(&[build.node("app:test")]).unwrap());
    assert!(!session.schedule(&[build.node("app:compile")]).unwrap());
}

/// Test: Unknown task paths are never scheduled
#[test]
fn test_unknown_path_not_scheduled() {
    let build = TestBuild::new("app");
    let ghost = build.node("app:ghost");

    let err = ghost.task().unwrap_err();
    assert!(err.to_string().contains("app:ghost"));
    assert!(err.is_protocol_violation());

    let mut session = build.controller.new_work_graph().unwrap();
    assert!(matches!(
        session.schedule(&[ghost]),
        Err(Error::NotScheduled { .. })
    ));
    assert!(session.plan().is_none());
}

/// Test: Terminal task states never revert
/// Given a successful and a failed task
/// When both are scheduled again in a later session
/// Then neither runs again and both keep their state
#[test]
fn test_task_state_is_monotonic() {
    let build = TestBuild::new("app");
    let log = execution_log();
    build
        .engine
        .register("ok", Vec::<&str>::new(), recording_action(&log, "ok"))
        .unwrap();
    build
        .engine
        .register("broken", Vec::<&str>::new(), failing_action("compilation failed"))
        .unwrap();
    let ok = build.node("app:ok");
    let broken = build.node("app:broken");

    let mut first = build.controller.new_work_graph().unwrap();
    first.schedule(&[ok.clone(), broken.clone()]).unwrap();
    first.finalize_graph().unwrap();
    let result = first.run_work().unwrap();
    assert_eq!(
        result.failures(),
        &[ExecutionFailure::TaskFailed {
            path: TaskPath::new("app:broken"),
            message: "compilation failed".to_string(),
        }]
    );
    assert_eq!(ok.task_state(), TaskState::Success);
    assert_eq!(broken.task_state(), TaskState::Failed);

    let mut second = build.controller.new_work_graph().unwrap();
    assert!(second.schedule(&[ok.clone(), broken.clone()]).unwrap());
    let result = second.run_work().unwrap();
    assert!(!result.is_success());

    assert_eq!(ok.task_state(), TaskState::Success);
    assert_eq!(broken.task_state(), TaskState::Failed);
    assert_eq!(*log.lock().unwrap(), vec!["ok"]);
}

/// Test: A finished task scheduled again still notifies new listeners
/// Given a task that completed in an earlier session
/// When a listener is added and the task is scheduled in a new session
/// Then the listener runs exactly once without the task running again
#[test]
fn test_rescheduled_finished_task_fires_new_listeners() {
    let build = TestBuild::new("app");
    let log = execution_log();
    build
        .engine
        .register("a", Vec::<&str>::new(), recording_action(&log, "app:a"))
        .unwrap();
    let a = build.node("app:a");

    let mut first = build.controller.new_work_graph().unwrap();
    first.schedule(&[a.clone()]).unwrap();
    assert!(first.run_work().unwrap().is_success());

    let fired = Arc::new(AtomicUsize::new(0));
    a.on_complete(counting_listener(&fired));
    assert_eq!(a.pending_listeners(), 1);

    let mut second = build.controller.new_work_graph().unwrap();
    assert!(second.schedule(&[a.clone()]).unwrap());
    assert!(second.run_work().unwrap().is_success());

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(a.pending_listeners(), 0);
    assert_eq!(*log.lock().unwrap(), vec!["app:a"]);
    assert_eq!(a.task_state(), TaskState::Success);
}

/// Test: Listener fire-once semantics through real executions
#[test]
fn test_listeners_fire_once_per_registration() {
    let build = TestBuild::new("app");
    build.engine.register_noop("a", Vec::<&str>::new()).unwrap();
    let a = build.node("app:a");

    let once = Arc::new(AtomicUsize::new(0));
    let twice = Arc::new(AtomicUsize::new(0));
    a.on_complete(counting_listener(&once));
    a.on_complete(counting_listener(&twice));
    a.on_complete(counting_listener(&twice));

    let mut session = build.controller.new_work_graph().unwrap();
    session.schedule(&[a.clone()]).unwrap();
    session.run_work().unwrap();

    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert_eq!(twice.load(Ordering::SeqCst), 2);
    assert_eq!(a.pending_listeners(), 0);

    // A later run of the finished task does not fire anything again.
    let mut session = build.controller.new_work_graph().unwrap();
    session.schedule(&[a.clone()]).unwrap();
    session.run_work().unwrap();
    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert_eq!(twice.load(Ordering::SeqCst), 2);
}

/// Test: Late listeners wait for the next completion by default
#[test]
fn test_late_listener_deferred() {
    let build = TestBuild::new("app");
    build.engine.register_noop("a", Vec::<&str>::new()).unwrap();
    let a = build.node("app:a");

    let mut session = build.controller.new_work_graph().unwrap();
    session.schedule(&[a.clone()]).unwrap();
    session.run_work().unwrap();

    let late = Arc::new(AtomicUsize::new(0));
    a.on_complete(counting_listener(&late));
    assert_eq!(late.load(Ordering::SeqCst), 0);
    assert_eq!(a.pending_listeners(), 1);
}

/// Test: Late listeners run immediately under RunIfFired
#[test]
fn test_late_listener_run_if_fired() {
    let build = TestBuild::with_policy("app", LateListenerPolicy::RunIfFired);
    build.engine.register_noop("a", Vec::<&str>::new()).unwrap();
    let a = build.node("app:a");

    let mut session = build.controller.new_work_graph().unwrap();
    session.schedule(&[a.clone()]).unwrap();
    session.run_work().unwrap();

    let late = Arc::new(AtomicUsize::new(0));
    a.on_complete(counting_listener(&late));
    assert_eq!(late.load(Ordering::SeqCst), 1);
    assert_eq!(a.pending_listeners(), 0);
}

/// Test: Skipped dependents report Failed and still fire
#[test]
fn test_skipped_dependent_fires_as_failed() {
    let build = TestBuild::new("app");
    build
        .engine
        .register("compile", Vec::<&str>::new(), failing_action("syntax error"))
        .unwrap();
    build.engine.register_noop("test", ["compile"]).unwrap();
    let test = build.node("app:test");
    let fired = Arc::new(AtomicUsize::new(0));
    test.on_complete(counting_listener(&fired));

    let mut session = build.controller.new_work_graph().unwrap();
    session.schedule(&[test.clone()]).unwrap();
    let result = session.run_work().unwrap();

    assert!(!result.is_success());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(test.task_state(), TaskState::Failed);
}

/// Test: populate_work_graph hands the plan to the caller
#[test]
fn test_populate_work_graph_then_run() {
    let build = TestBuild::new("app");
    let log = execution_log();
    let task = build
        .engine
        .register("a", Vec::<&str>::new(), recording_action(&log, "a"))
        .unwrap();

    let mut session = build.controller.new_work_graph().unwrap();
    session
        .populate_work_graph(|plan| plan.add_entry_tasks(&[task.clone()]))
        .unwrap();
    session.finalize_graph().unwrap();
    assert!(session.run_work().unwrap().is_success());
    assert_eq!(*log.lock().unwrap(), vec!["a"]);
}

/// Test: A session cannot be used after run_work
#[test]
fn test_session_released_after_run() {
    let build = TestBuild::new("app");
    let mut session = build.controller.new_work_graph().unwrap();
    assert!(session.run_work().unwrap().is_success());
    assert_eq!(session.phase(), SessionPhase::Released);

    assert!(matches!(
        session.schedule(&[]),
        Err(Error::SessionReleased { .. })
    ));
    assert!(matches!(
        session.populate_work_graph(|_| Ok(())),
        Err(Error::SessionReleased { .. })
    ));
}

/// Test: Stopping from another thread while run_work blocks
#[test]
fn test_stop_handle_cancels_running_session() {
    let build = TestBuild::new("app");
    let gate = Gate::new();
    build
        .engine
        .register("slow", Vec::<&str>::new(), gate.action())
        .unwrap();
    build.engine.register_noop("after", ["slow"]).unwrap();
    build.engine.register_noop("other", Vec::<&str>::new()).unwrap();
    let after = build.node("app:after");

    let controller = build.controller.clone();
    let scheduled = after.clone();
    let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
    let runner = thread::spawn(move || -> weave::Result<ExecutionResult> {
        let mut session = controller.new_work_graph()?;
        session.schedule(&[scheduled])?;
        handle_tx.send(session.stop_handle()).unwrap();
        session.run_work()
    });

    let stop = handle_rx.recv().unwrap();
    gate.wait_entered();
    stop.stop();
    gate.release();

    let result = runner.join().unwrap().unwrap();
    assert!(result.failures().contains(&ExecutionFailure::Stopped));
    assert_eq!(after.task_state(), TaskState::Failed);
    assert!(!build.controller.has_active_work_graph());
}
