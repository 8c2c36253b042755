//! Exported task nodes.
//!
//! An `ExportedTaskNode` is a build's handle for one of its tasks, handed
//! out to consumers in other builds before the task is known to have run.
//! It binds lazily to the engine's node for the task, reports a ternary
//! state, and runs completion listeners exactly once per registration.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::core::{Task, TaskPath};
use crate::engine::{TaskNode, TaskNodeFactory};
use crate::error::{Error, Result};
use crate::util::lock;
use crate::wlog_trace;

/// What a consumer may assume about an exported task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not scheduled yet, or scheduled and still running.
    Waiting,
    /// Executed successfully; its outputs are available.
    Success,
    /// Finished without usable output: it failed, was skipped, or never had to run.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Waiting)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Waiting => write!(f, "waiting"),
            TaskState::Success => write!(f, "success"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// How a listener registered after the node already fired is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateListenerPolicy {
    /// Keep the listener until the node fires again.
    #[default]
    Defer,
    /// Run the listener right away on the registering thread.
    RunIfFired,
}

pub type CompletionListener = Box<dyn FnOnce() + Send>;

struct NodeState {
    task_node: Option<Arc<dyn TaskNode>>,
    listeners: Vec<CompletionListener>,
    fired: bool,
}

struct NodeInner {
    path: TaskPath,
    factory: Arc<dyn TaskNodeFactory>,
    late_listeners: LateListenerPolicy,
    state: Mutex<NodeState>,
}

/// A build's shareable handle for one task path.
///
/// Clones share the same node; identity is checked with [`ptr_eq`](Self::ptr_eq).
#[derive(Clone)]
pub struct ExportedTaskNode {
    inner: Arc<NodeInner>,
}

impl ExportedTaskNode {
    pub(crate) fn new(
        path: TaskPath,
        factory: Arc<dyn TaskNodeFactory>,
        late_listeners: LateListenerPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                path,
                factory,
                late_listeners,
                state: Mutex::new(NodeState {
                    task_node: None,
                    listeners: Vec::new(),
                    fired: false,
                }),
            }),
        }
    }

    pub fn path(&self) -> &TaskPath {
        &self.inner.path
    }

    /// Whether the node is bound to an engine task yet.
    pub fn is_bound(&self) -> bool {
        lock(&self.inner.state).task_node.is_some()
    }

    /// Number of listeners waiting for the next completion.
    pub fn pending_listeners(&self) -> usize {
        lock(&self.inner.state).listeners.len()
    }

    pub fn ptr_eq(&self, other: &ExportedTaskNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Bind to `task` unless already bound.
    pub(crate) fn maybe_bind_task(&self, task: &Task) {
        let mut state = lock(&self.inner.state);
        if state.task_node.is_none() {
            state.task_node = Some(self.inner.factory.get_or_create_node(task));
        }
    }

    /// Bind to the engine task with this node's path, if the engine knows one.
    fn bind(&self, state: &mut NodeState) -> Option<Arc<dyn TaskNode>> {
        if state.task_node.is_none() {
            let task = self.inner.factory.find_task(&self.inner.path)?;
            state.task_node = Some(self.inner.factory.get_or_create_node(&task));
        }
        state.task_node.clone()
    }

    /// The engine task behind this node.
    ///
    /// Fails with [`Error::NotScheduled`] when the engine knows no task with
    /// this path.
    pub fn task(&self) -> Result<Task> {
        let mut state = lock(&self.inner.state);
        let node = self.bind(&mut state).ok_or_else(|| Error::NotScheduled {
            path: self.inner.path.clone(),
        })?;
        Ok(node.task().clone())
    }

    pub fn task_state(&self) -> TaskState {
        let mut state = lock(&self.inner.state);
        let Some(node) = self.bind(&mut state) else {
            // Assume not scheduled yet
            return TaskState::Waiting;
        };
        if node.is_executed() && node.is_successful() {
            TaskState::Success
        } else if node.is_complete() {
            // Failed, skipped or stopped: dependents must not use its output
            TaskState::Failed
        } else {
            TaskState::Waiting
        }
    }

    /// Run `listener` after the listeners already registered, on the next completion.
    pub fn on_complete(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = lock(&self.inner.state);
        if state.fired && self.inner.late_listeners == LateListenerPolicy::RunIfFired {
            drop(state);
            listener();
            return;
        }
        state.listeners.push(Box::new(listener));
    }

    /// Run and drop every registered listener.
    ///
    /// Listeners run outside the node lock, in registration order.
    pub(crate) fn fire_completed(&self) {
        let listeners = {
            let mut state = lock(&self.inner.state);
            state.fired = true;
            std::mem::take(&mut state.listeners)
        };
        wlog_trace!(
            "{} completed, running {} listeners",
            self.inner.path,
            listeners.len()
        );
        for listener in listeners {
            listener();
        }
    }

    /// True unless the bound task is already required by a plan.
    pub(crate) fn should_schedule(&self) -> bool {
        let state = lock(&self.inner.state);
        match &state.task_node {
            None => true,
            Some(node) => !node.is_required(),
        }
    }
}

impl std::fmt::Debug for ExportedTaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ExportedTaskNode")
            .field("path", &self.inner.path)
            .field("bound", &state.task_node.is_some())
            .field("listeners", &state.listeners.len())
            .field("fired", &state.fired)
            .finish()
    }
}
