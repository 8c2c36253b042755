//! Task identity registry.
//!
//! Maps task paths to their canonical [`ExportedTaskNode`]. Lookups create
//! missing nodes atomically, so concurrent callers asking for the same
//! unseen path always receive the same node.

use dashmap::DashMap;
use std::sync::Arc;

use crate::core::{TaskIdentity, TaskPath};
use crate::engine::TaskNodeFactory;
use crate::orchestration::exported::{ExportedTaskNode, LateListenerPolicy};
use crate::wlog_trace;

pub struct TaskRegistry {
    nodes: DashMap<TaskPath, ExportedTaskNode>,
    factory: Arc<dyn TaskNodeFactory>,
    late_listeners: LateListenerPolicy,
}

impl TaskRegistry {
    pub fn new(factory: Arc<dyn TaskNodeFactory>, late_listeners: LateListenerPolicy) -> Self {
        Self {
            nodes: DashMap::new(),
            factory,
            late_listeners,
        }
    }

    /// Get or create the node for `identity`'s path.
    ///
    /// Identities carrying a concrete task bind the node eagerly. Never fails;
    /// an unknown path yields an unbound node.
    pub fn locate(&self, identity: &TaskIdentity) -> ExportedTaskNode {
        let node = self
            .nodes
            .entry(identity.task_path().clone())
            .or_insert_with(|| {
                wlog_trace!("registry: new node {}", identity.task_path());
                ExportedTaskNode::new(
                    identity.task_path().clone(),
                    Arc::clone(&self.factory),
                    self.late_listeners,
                )
            })
            .clone();
        if let TaskIdentity::Task(task) = identity {
            node.maybe_bind_task(task);
        }
        node
    }

    /// Existing node for `path`, without creating one.
    pub fn get(&self, path: &TaskPath) -> Option<ExportedTaskNode> {
        self.nodes.get(path).map(|entry| entry.value().clone())
    }

    /// Whether `node` is the canonical node this registry holds for its path.
    pub fn owns(&self, node: &ExportedTaskNode) -> bool {
        self.nodes
            .get(node.path())
            .is_some_and(|entry| entry.value().ptr_eq(node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn paths(&self) -> Vec<TaskPath> {
        let mut paths: Vec<_> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        paths.sort();
        paths
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("nodes", &self.nodes.len())
            .field("late_listeners", &self.late_listeners)
            .finish()
    }
}
