//! Core domain models shared by the coordinator and the engine.
//!
//! This module contains task paths and identities, the concrete task
//! reference, and the cross-build mutation lock.

pub mod lock;
pub mod path;
pub mod task;

pub use lock::ProjectStateLock;
pub use path::{TaskIdentity, TaskPath};
pub use task::{Task, TaskId};
