//! Interfaces between the coordinator and an execution engine.
//!
//! The coordinator never runs tasks. It drives an engine through
//! [`BuildLifecycle`] and [`WorkPlan`], and reads task progress through
//! [`TaskNodeFactory`] and [`TaskNode`]. [`LocalBuild`] is an in-memory
//! engine implementing all of them.

mod local;
mod plan;

pub use local::{LocalBuild, TaskAction};
pub use plan::LocalPlan;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{Task, TaskPath};
use crate::error::Result;
use crate::orchestration::ExportedTaskNode;

/// The engine's view of a single task's progress.
pub trait TaskNode: Send + Sync {
    fn task(&self) -> &Task;
    /// The task is part of a plan and has not finished yet.
    fn is_required(&self) -> bool;
    /// The task's action ran, successfully or not.
    fn is_executed(&self) -> bool;
    fn is_successful(&self) -> bool;
    /// The task will not change state again in this build.
    fn is_complete(&self) -> bool;
}

/// Source of the tasks an engine knows about.
pub trait TaskNodeFactory: Send + Sync {
    fn tasks(&self) -> Vec<Task>;

    fn find_task(&self, path: &TaskPath) -> Option<Task> {
        self.tasks().into_iter().find(|task| task.path() == path)
    }

    fn get_or_create_node(&self, task: &Task) -> Arc<dyn TaskNode>;
}

/// Called by a plan once per finished task.
pub type CompletionCallback = Box<dyn Fn(&Task) + Send + Sync>;

/// An engine-side execution plan.
pub trait WorkPlan: Send + Sync + 'static {
    /// Add tasks the build must run, together with whatever they depend on.
    fn add_entry_tasks(&self, tasks: &[Task]) -> Result<()>;

    fn on_complete(&self, callback: CompletionCallback);

    /// Request cancellation of pending and running work.
    fn stop(&self);
}

/// The build lifecycle operations the coordinator relies on.
pub trait BuildLifecycle: Send + Sync + 'static {
    type Plan: WorkPlan;

    fn prepare_to_schedule_tasks(&self);

    fn new_work_graph(&self) -> Self::Plan;

    /// Apply a structural change to `plan`.
    fn populate_work_graph<F>(&self, plan: &Self::Plan, action: F) -> Result<()>
    where
        F: FnOnce(&Self::Plan) -> Result<()>;

    /// Lock `plan` for execution.
    fn finalize_work_graph(&self, plan: &Self::Plan) -> Result<()>;

    /// Run `plan`, blocking until every node has finished or been skipped.
    fn execute_tasks(&self, plan: &Self::Plan) -> ExecutionResult;
}

/// Locates exported task nodes owned by other builds.
pub trait ExternalTaskResolver: Send + Sync {
    fn locate_external(&self, path: &TaskPath) -> Result<ExportedTaskNode>;
}

/// A reason an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionFailure {
    /// A task's action reported an error.
    TaskFailed {
        path: TaskPath,
        message: String,
    },
    /// A task of another build this build depends on did not succeed.
    ExternalFailed { path: TaskPath },
    /// The engine refused to execute the plan.
    PlanRejected { message: String },
    /// The plan was stopped before all work ran.
    Stopped,
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionFailure::TaskFailed { path, message } => {
                write!(f, "task {} failed: {}", path, message)
            }
            ExecutionFailure::ExternalFailed { path } => {
                write!(f, "dependency {} did not succeed", path)
            }
            ExecutionFailure::PlanRejected { message } => {
                write!(f, "plan rejected: {}", message)
            }
            ExecutionFailure::Stopped => write!(f, "execution was stopped"),
        }
    }
}

/// Outcome of executing a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    failures: Vec<ExecutionFailure>,
}

impl ExecutionResult {
    pub fn succeeded() -> Self {
        Self::default()
    }

    pub fn failed(failures: Vec<ExecutionFailure>) -> Self {
        Self { failures }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[ExecutionFailure] {
        &self.failures
    }
}
