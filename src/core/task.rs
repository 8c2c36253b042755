//! Task references shared between the coordinator and the engine.
//!
//! A `Task` is the engine's concrete handle for a unit of work. The
//! coordinator never runs tasks itself; it only passes these handles back
//! to the engine as entry points.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::path::TaskPath;

/// Unique identifier for a task instance.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A concrete task known to an execution engine.
///
/// Two tasks are the same task when their ids match; the path is carried
/// along so completions can be routed back to exported nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    path: TaskPath,
}

impl Task {
    /// Create a task with a freshly generated id.
    pub fn new(path: TaskPath) -> Self {
        Self {
            id: TaskId::new(),
            path,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn path(&self) -> &TaskPath {
        &self.path
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.id.short())
    }
}
