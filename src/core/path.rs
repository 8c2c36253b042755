//! Task paths and task identities.
//!
//! A task path is the stable, build-qualified name of a task inside the
//! composite build. Its first `:`-separated segment names the build that
//! owns the task, e.g. `app:compile` belongs to build `app`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::task::Task;

/// Globally unique, build-qualified task path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPath(Arc<str>);

impl TaskPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    /// Join a build name and a task name into a qualified path.
    pub fn qualified(build: &str, name: &str) -> Self {
        Self::new(format!("{}:{}", build, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the build owning this task, if the path is qualified.
    pub fn build_name(&self) -> Option<&str> {
        self.0.split_once(':').map(|(build, _)| build)
    }

    /// The path relative to its owning build.
    pub fn local_name(&self) -> &str {
        self.0.split_once(':').map_or(&self.0, |(_, rest)| rest)
    }

    /// Check whether this path belongs to the named build.
    pub fn is_in_build(&self, build: &str) -> bool {
        self.build_name() == Some(build)
    }
}

impl std::fmt::Display for TaskPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for TaskPath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// A reference to a task, either concrete or by path only.
///
/// Path-only identities name tasks that may not be known to this process
/// yet; the registry binds them lazily once the engine knows the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskIdentity {
    /// A task already known to the engine.
    Task(Task),
    /// A task known only by its path.
    Path(TaskPath),
}

impl TaskIdentity {
    pub fn task_path(&self) -> &TaskPath {
        match self {
            TaskIdentity::Task(task) => task.path(),
            TaskIdentity::Path(path) => path,
        }
    }
}

impl From<Task> for TaskIdentity {
    fn from(task: Task) -> Self {
        TaskIdentity::Task(task)
    }
}

impl From<TaskPath> for TaskIdentity {
    fn from(path: TaskPath) -> Self {
        TaskIdentity::Path(path)
    }
}
