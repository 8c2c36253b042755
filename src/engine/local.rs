//! In-memory execution engine for a single build.
//!
//! `LocalBuild` keeps the build's task definitions and per-task execution
//! state. Tasks are named relative to the build; dependencies without a
//! build prefix are local, prefixed ones belong to other builds and are
//! reached through an [`ExternalTaskResolver`].

use dashmap::DashMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use crate::core::{Task, TaskId, TaskPath};
use crate::engine::plan::LocalPlan;
use crate::engine::{
    BuildLifecycle, ExecutionResult, ExternalTaskResolver, TaskNode, TaskNodeFactory,
};
use crate::error::{Error, Result};
use crate::orchestration::ExportedTaskNode;
use crate::util::lock;
use crate::{wlog_debug, wlog_trace};

/// The work a task performs. An `Err` carries the failure message.
pub type TaskAction = Arc<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct TaskDefinition {
    pub(crate) task: Task,
    pub(crate) dependencies: Vec<TaskPath>,
    pub(crate) action: TaskAction,
}

/// Execution state of a task within one build invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeStatus {
    Unscheduled,
    Required,
    Executing,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Engine node for one task. Terminal states never revert.
pub(crate) struct LocalTaskNode {
    task: Task,
    status: Mutex<NodeStatus>,
}

impl LocalTaskNode {
    fn new(task: Task) -> Self {
        Self {
            task,
            status: Mutex::new(NodeStatus::Unscheduled),
        }
    }

    pub(crate) fn status(&self) -> NodeStatus {
        *lock(&self.status)
    }

    /// Mark the task as part of a plan. Returns false if it already was, or has finished.
    pub(crate) fn require(&self) -> bool {
        let mut status = lock(&self.status);
        if *status == NodeStatus::Unscheduled {
            *status = NodeStatus::Required;
            true
        } else {
            false
        }
    }

    pub(crate) fn start(&self) {
        let mut status = lock(&self.status);
        if !status.is_terminal() {
            *status = NodeStatus::Executing;
        }
    }

    pub(crate) fn finish(&self, outcome: NodeStatus) {
        let mut status = lock(&self.status);
        if !status.is_terminal() {
            *status = outcome;
        }
    }
}

impl TaskNode for LocalTaskNode {
    fn task(&self) -> &Task {
        &self.task
    }

    fn is_required(&self) -> bool {
        matches!(self.status(), NodeStatus::Required | NodeStatus::Executing)
    }

    fn is_executed(&self) -> bool {
        matches!(self.status(), NodeStatus::Succeeded | NodeStatus::Failed)
    }

    fn is_successful(&self) -> bool {
        self.status() == NodeStatus::Succeeded
    }

    fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }
}

pub(crate) struct BuildInner {
    name: String,
    max_workers: usize,
    definitions: RwLock<BTreeMap<TaskPath, TaskDefinition>>,
    nodes: DashMap<TaskId, Arc<LocalTaskNode>>,
    resolver: OnceLock<Weak<dyn ExternalTaskResolver>>,
    scheduling_rounds: AtomicUsize,
}

impl BuildInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn definition(&self, path: &TaskPath) -> Option<TaskDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub(crate) fn node_for(&self, task: &Task) -> Arc<LocalTaskNode> {
        self.nodes
            .entry(task.id())
            .or_insert_with(|| Arc::new(LocalTaskNode::new(task.clone())))
            .clone()
    }

    pub(crate) fn resolve_external(&self, path: &TaskPath) -> Result<ExportedTaskNode> {
        let resolver = self
            .resolver
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                Error::Engine(format!(
                    "build '{}' cannot reach task '{}': no composite build attached",
                    self.name, path
                ))
            })?;
        resolver.locate_external(path)
    }
}

/// A single build's tasks and its execution engine.
#[derive(Clone)]
pub struct LocalBuild {
    inner: Arc<BuildInner>,
}

impl LocalBuild {
    /// Create an empty build running at most `max_workers` tasks at once.
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            inner: Arc::new(BuildInner {
                name: name.into(),
                max_workers: max_workers.max(1),
                definitions: RwLock::new(BTreeMap::new()),
                nodes: DashMap::new(),
                resolver: OnceLock::new(),
                scheduling_rounds: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Attach the resolver used for dependencies on other builds.
    ///
    /// Only the first resolver sticks. Returns false if one was already set.
    pub fn set_resolver(&self, resolver: Weak<dyn ExternalTaskResolver>) -> bool {
        self.inner.resolver.set(resolver).is_ok()
    }

    /// Register a task named `name` relative to this build.
    ///
    /// Dependencies without a build prefix refer to tasks of this build.
    pub fn register<I, S>(&self, name: &str, depends_on: I, action: TaskAction) -> Result<Task>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let path = TaskPath::qualified(&self.inner.name, name);
        let dependencies = depends_on
            .into_iter()
            .map(|dep| self.qualify(dep.as_ref()))
            .collect::<Vec<_>>();

        let mut definitions = self
            .inner
            .definitions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if definitions.contains_key(&path) {
            return Err(Error::Validation(format!(
                "task '{}' is already registered",
                path
            )));
        }
        let task = Task::new(path.clone());
        wlog_trace!("[{}] registered {} deps={:?}", self.inner.name, path, dependencies);
        definitions.insert(
            path,
            TaskDefinition {
                task: task.clone(),
                dependencies,
                action,
            },
        );
        Ok(task)
    }

    /// Register a task whose action always succeeds.
    pub fn register_noop<I, S>(&self, name: &str, depends_on: I) -> Result<Task>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.register(name, depends_on, Arc::new(|| Ok(())))
    }

    fn qualify(&self, dependency: &str) -> TaskPath {
        if dependency.contains(':') {
            TaskPath::new(dependency)
        } else {
            TaskPath::qualified(&self.inner.name, dependency)
        }
    }

    /// All registered task paths, sorted.
    pub fn task_paths(&self) -> Vec<TaskPath> {
        self.inner
            .definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn dependencies_of(&self, path: &TaskPath) -> Option<Vec<TaskPath>> {
        self.inner.definition(path).map(|def| def.dependencies)
    }

    /// Dependencies on other builds reachable from `path` through local tasks.
    pub fn external_dependencies(&self, path: &TaskPath) -> Result<Vec<TaskPath>> {
        let mut external = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![path.clone()];

        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if !current.is_in_build(&self.inner.name) {
                external.push(current);
                continue;
            }
            let definition = self.inner.definition(&current).ok_or_else(|| {
                Error::Engine(format!(
                    "task '{}' not found in build '{}'",
                    current, self.inner.name
                ))
            })?;
            stack.extend(definition.dependencies);
        }

        external.sort();
        Ok(external)
    }

    /// Local tasks ordered so that each comes after its local dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskPath>> {
        let definitions = self
            .inner
            .definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut graph: DiGraph<TaskPath, ()> = DiGraph::new();
        let index: HashMap<TaskPath, NodeIndex> = definitions
            .keys()
            .map(|path| (path.clone(), graph.add_node(path.clone())))
            .collect();
        for (path, definition) in definitions.iter() {
            for dep in &definition.dependencies {
                if let Some(&from) = index.get(dep) {
                    graph.add_edge(from, index[path], ());
                }
            }
        }
        let sorted = toposort(&graph, None).map_err(|cycle| {
            Error::Engine(format!(
                "dependency cycle detected at task {}",
                graph[cycle.node_id()]
            ))
        })?;
        Ok(sorted.into_iter().map(|i| graph[i].clone()).collect())
    }

    /// Number of times a scheduling round was prepared.
    pub fn scheduling_rounds(&self) -> usize {
        self.inner.scheduling_rounds.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBuild")
            .field("name", &self.inner.name)
            .field("tasks", &self.task_paths().len())
            .field("max_workers", &self.inner.max_workers)
            .finish()
    }
}

impl TaskNodeFactory for LocalBuild {
    fn tasks(&self) -> Vec<Task> {
        self.inner
            .definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|def| def.task.clone())
            .collect()
    }

    fn find_task(&self, path: &TaskPath) -> Option<Task> {
        self.inner.definition(path).map(|def| def.task)
    }

    fn get_or_create_node(&self, task: &Task) -> Arc<dyn TaskNode> {
        self.inner.node_for(task)
    }
}

impl BuildLifecycle for LocalBuild {
    type Plan = LocalPlan;

    fn prepare_to_schedule_tasks(&self) {
        let round = self.inner.scheduling_rounds.fetch_add(1, Ordering::SeqCst) + 1;
        wlog_debug!("[{}] preparing scheduling round {}", self.inner.name, round);
    }

    fn new_work_graph(&self) -> LocalPlan {
        LocalPlan::new(Arc::clone(&self.inner))
    }

    fn populate_work_graph<F>(&self, plan: &LocalPlan, action: F) -> Result<()>
    where
        F: FnOnce(&LocalPlan) -> Result<()>,
    {
        if plan.is_finalized() {
            return Err(Error::Engine(format!(
                "work graph of build '{}' is already finalized",
                self.inner.name
            )));
        }
        action(plan)
    }

    fn finalize_work_graph(&self, plan: &LocalPlan) -> Result<()> {
        plan.finalize()
    }

    fn execute_tasks(&self, plan: &LocalPlan) -> ExecutionResult {
        plan.execute(self.inner.max_workers)
    }
}
