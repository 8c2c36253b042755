//! Work plan of the in-memory engine.
//!
//! A `LocalPlan` expands entry tasks and everything they depend on into a
//! DAG (edges point from a dependency to its dependent), then executes it
//! on scoped worker threads. Dependencies on other builds appear as
//! placeholder nodes that settle once the other build's exported node
//! leaves the `Waiting` state.

use crossbeam_channel::{unbounded, Receiver, Sender};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::core::{Task, TaskPath};
use crate::engine::local::{BuildInner, LocalTaskNode, NodeStatus, TaskAction};
use crate::engine::{CompletionCallback, ExecutionFailure, ExecutionResult, TaskNode, WorkPlan};
use crate::error::{Error, Result};
use crate::orchestration::{ExportedTaskNode, TaskState};
use crate::util::lock;
use crate::{wlog_debug, wlog_trace, wlog_warn};

#[derive(Clone)]
enum PlanNode {
    Local {
        node: Arc<LocalTaskNode>,
        action: TaskAction,
    },
    External(ExportedTaskNode),
}

impl PlanNode {
    fn path(&self) -> &TaskPath {
        match self {
            PlanNode::Local { node, .. } => node.task().path(),
            PlanNode::External(exported) => exported.path(),
        }
    }
}

#[derive(Default)]
struct PlanGraph {
    graph: DiGraph<PlanNode, ()>,
    index: HashMap<TaskPath, NodeIndex>,
    entry: Vec<TaskPath>,
    finalized: bool,
}

enum Event {
    Finished {
        index: NodeIndex,
        outcome: std::result::Result<(), String>,
    },
    External {
        index: NodeIndex,
    },
    Stop,
}

type SharedCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Execution plan of a [`LocalBuild`](crate::engine::LocalBuild).
pub struct LocalPlan {
    build: Arc<BuildInner>,
    graph: Mutex<PlanGraph>,
    callbacks: Mutex<Vec<SharedCallback>>,
    stopped: AtomicBool,
    wake: Mutex<Option<Sender<Event>>>,
}

impl LocalPlan {
    pub(crate) fn new(build: Arc<BuildInner>) -> Self {
        Self {
            build,
            graph: Mutex::new(PlanGraph::default()),
            callbacks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            wake: Mutex::new(None),
        }
    }

    /// Entry tasks in the order they were first added.
    pub fn entry_tasks(&self) -> Vec<TaskPath> {
        lock(&self.graph).entry.clone()
    }

    /// Every task in the plan, entry tasks and their dependencies.
    pub fn task_paths(&self) -> Vec<TaskPath> {
        let mut paths: Vec<_> = lock(&self.graph).index.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn contains(&self, path: &TaskPath) -> bool {
        lock(&self.graph).index.contains_key(path)
    }

    pub fn is_finalized(&self) -> bool {
        lock(&self.graph).finalized
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Lock the plan for execution, rejecting dependency cycles.
    pub(crate) fn finalize(&self) -> Result<()> {
        let mut plan = lock(&self.graph);
        if plan.finalized {
            return Ok(());
        }
        toposort(&plan.graph, None).map_err(|cycle| {
            Error::Engine(format!(
                "dependency cycle detected at task {}",
                plan.graph[cycle.node_id()].path()
            ))
        })?;
        plan.finalized = true;
        wlog_debug!(
            "[{}] finalized plan with {} tasks",
            self.build.name(),
            plan.graph.node_count()
        );
        Ok(())
    }

    /// Collect the nodes needed for `tasks` that the plan does not contain yet.
    fn expand(&self, plan: &PlanGraph, tasks: &[Task]) -> Result<Vec<(PlanNode, Vec<TaskPath>)>> {
        let mut added = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<TaskPath> = tasks.iter().map(|task| task.path().clone()).collect();

        while let Some(path) = stack.pop() {
            if plan.index.contains_key(&path) || !seen.insert(path.clone()) {
                continue;
            }
            if path.is_in_build(self.build.name()) {
                let definition = self.build.definition(&path).ok_or_else(|| {
                    Error::Engine(format!(
                        "task '{}' not found in build '{}'",
                        path,
                        self.build.name()
                    ))
                })?;
                stack.extend(definition.dependencies.iter().cloned());
                added.push((
                    PlanNode::Local {
                        node: self.build.node_for(&definition.task),
                        action: definition.action,
                    },
                    definition.dependencies,
                ));
            } else {
                let exported = self.build.resolve_external(&path)?;
                added.push((PlanNode::External(exported), Vec::new()));
            }
        }
        Ok(added)
    }

    /// Run the plan, blocking until every node has settled.
    pub(crate) fn execute(&self, max_workers: usize) -> ExecutionResult {
        if let Err(err) = self.finalize() {
            return ExecutionResult::failed(vec![ExecutionFailure::PlanRejected {
                message: err.to_string(),
            }]);
        }
        let graph = lock(&self.graph).graph.clone();
        let (tx, rx) = unbounded();
        *lock(&self.wake) = Some(tx.clone());

        wlog_debug!(
            "[{}] executing {} tasks with {} workers",
            self.build.name(),
            graph.node_count(),
            max_workers
        );
        let mut execution = Execution::new(self, &graph);
        execution.run(max_workers.max(1), tx, rx);

        *lock(&self.wake) = None;
        let result = ExecutionResult::failed(execution.failures);
        wlog_debug!(
            "[{}] execution finished, success={}",
            self.build.name(),
            result.is_success()
        );
        result
    }

    fn notify_complete(&self, task: &Task) {
        let callbacks = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback(task);
        }
    }
}

impl WorkPlan for LocalPlan {
    fn add_entry_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut plan = lock(&self.graph);
        if plan.finalized {
            return Err(Error::Engine(format!(
                "cannot add tasks to the finalized plan of build '{}'",
                self.build.name()
            )));
        }

        let added = self.expand(&plan, tasks)?;
        for (node, _) in &added {
            let path = node.path().clone();
            let index = plan.graph.add_node(node.clone());
            plan.index.insert(path, index);
        }
        for (node, dependencies) in &added {
            let to = plan.index[node.path()];
            for dependency in dependencies {
                let from = plan.index[dependency];
                plan.graph.add_edge(from, to, ());
            }
            if let PlanNode::Local { node, .. } = node {
                node.require();
            }
        }
        for task in tasks {
            if !plan.entry.contains(task.path()) {
                plan.entry.push(task.path().clone());
            }
        }
        wlog_trace!(
            "[{}] added {} entry tasks, {} new nodes",
            self.build.name(),
            tasks.len(),
            added.len()
        );
        Ok(())
    }

    fn on_complete(&self, callback: CompletionCallback) {
        lock(&self.callbacks).push(Arc::from(callback));
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(wake) = lock(&self.wake).as_ref() {
            let _ = wake.send(Event::Stop);
        }
        wlog_debug!("[{}] stop requested", self.build.name());
    }
}

/// Book-keeping for one execution of a plan.
struct Execution<'a> {
    plan: &'a LocalPlan,
    graph: &'a DiGraph<PlanNode, ()>,
    remaining: Vec<usize>,
    settled: Vec<bool>,
    settled_count: usize,
    ready: VecDeque<NodeIndex>,
    running: usize,
    failures: Vec<ExecutionFailure>,
}

impl<'a> Execution<'a> {
    fn new(plan: &'a LocalPlan, graph: &'a DiGraph<PlanNode, ()>) -> Self {
        let remaining: Vec<usize> = graph
            .node_indices()
            .map(|index| graph.neighbors_directed(index, Direction::Incoming).count())
            .collect();
        let ready = graph
            .node_indices()
            .filter(|index| remaining[index.index()] == 0)
            .collect();
        Self {
            plan,
            graph,
            settled: vec![false; graph.node_count()],
            remaining,
            settled_count: 0,
            ready,
            running: 0,
            failures: Vec::new(),
        }
    }

    fn run(&mut self, max_workers: usize, tx: Sender<Event>, rx: Receiver<Event>) {
        let graph = self.graph;
        thread::scope(|scope| loop {
            let stopping = self.plan.is_stopped();
            if !stopping {
                while self.running < max_workers {
                    let Some(index) = self.ready.pop_front() else {
                        break;
                    };
                    match &graph[index] {
                        PlanNode::Local { node, action } => {
                            if node.is_complete() {
                                // Ran in an earlier plan of this build.
                                let success = node.is_successful();
                                if !success {
                                    self.failures.push(ExecutionFailure::TaskFailed {
                                        path: node.task().path().clone(),
                                        message: "did not succeed in an earlier execution"
                                            .to_string(),
                                    });
                                }
                                self.plan.notify_complete(node.task());
                                self.settle(index, success);
                                continue;
                            }
                            node.start();
                            self.running += 1;
                            let tx = tx.clone();
                            let action = Arc::clone(action);
                            scope.spawn(move || {
                                let outcome = catch_unwind(AssertUnwindSafe(|| action()))
                                    .unwrap_or_else(|_| Err("task action panicked".to_string()));
                                let _ = tx.send(Event::Finished { index, outcome });
                            });
                        }
                        PlanNode::External(exported) => {
                            let tx = tx.clone();
                            exported.on_complete(move || {
                                let _ = tx.send(Event::External { index });
                            });
                            // The other build may have finished before the listener was added.
                            self.settle_external(index, exported);
                        }
                    }
                }
            }

            if self.settled_count == graph.node_count() {
                break;
            }
            if stopping && self.running == 0 {
                self.skip_unsettled();
                break;
            }

            match rx.recv() {
                Ok(Event::Finished { index, outcome }) => {
                    self.running -= 1;
                    self.finish_local(index, outcome);
                }
                Ok(Event::External { index }) => {
                    if let PlanNode::External(exported) = &graph[index] {
                        self.settle_external(index, exported);
                    }
                }
                Ok(Event::Stop) => {}
                Err(_) => break,
            }
        });
    }

    fn finish_local(&mut self, index: NodeIndex, outcome: std::result::Result<(), String>) {
        let graph = self.graph;
        let PlanNode::Local { node, .. } = &graph[index] else {
            return;
        };
        let success = match outcome {
            Ok(()) => {
                node.finish(NodeStatus::Succeeded);
                true
            }
            Err(message) => {
                wlog_warn!("task {} failed: {}", node.task().path(), message);
                node.finish(NodeStatus::Failed);
                self.failures.push(ExecutionFailure::TaskFailed {
                    path: node.task().path().clone(),
                    message,
                });
                false
            }
        };
        self.plan.notify_complete(node.task());
        self.settle(index, success);
    }

    fn settle_external(&mut self, index: NodeIndex, exported: &ExportedTaskNode) {
        if self.settled[index.index()] {
            return;
        }
        match exported.task_state() {
            TaskState::Waiting => {}
            TaskState::Success => self.settle(index, true),
            TaskState::Failed => {
                self.failures.push(ExecutionFailure::ExternalFailed {
                    path: exported.path().clone(),
                });
                self.settle(index, false);
            }
        }
    }

    /// Mark a node settled and release or skip its dependents.
    fn settle(&mut self, index: NodeIndex, success: bool) {
        let graph = self.graph;
        let mut pending = vec![(index, success)];
        while let Some((index, success)) = pending.pop() {
            if self.settled[index.index()] {
                continue;
            }
            self.settled[index.index()] = true;
            self.settled_count += 1;

            for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
                if self.settled[dependent.index()] {
                    continue;
                }
                if success {
                    self.remaining[dependent.index()] -= 1;
                    if self.remaining[dependent.index()] == 0 {
                        self.ready.push_back(dependent);
                    }
                } else {
                    self.skip(dependent);
                    pending.push((dependent, false));
                }
            }
        }
    }

    fn skip(&self, index: NodeIndex) {
        if let PlanNode::Local { node, .. } = &self.graph[index] {
            wlog_trace!("skipping {}", node.task().path());
            node.finish(NodeStatus::Skipped);
            self.plan.notify_complete(node.task());
        }
    }

    fn skip_unsettled(&mut self) {
        let unsettled: Vec<_> = self
            .graph
            .node_indices()
            .filter(|index| !self.settled[index.index()])
            .collect();
        if unsettled.is_empty() {
            return;
        }
        for index in unsettled {
            self.skip(index);
            self.settled[index.index()] = true;
            self.settled_count += 1;
        }
        self.failures.push(ExecutionFailure::Stopped);
    }
}
