pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod log;
pub mod manifest;
pub mod orchestration;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{
    BuildWorkGraphController, CompositeBuild, ExportedTaskNode, TaskState, WorkGraph,
};
