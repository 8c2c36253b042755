//! Coordination of work graphs across the builds of a composite build.
//!
//! Each build owns a [`BuildWorkGraphController`]: a registry of
//! [`ExportedTaskNode`]s other builds can wait on, and a single session slot
//! for running its [`WorkGraph`]. [`CompositeBuild`] wires several builds
//! together and drives them in parallel.

mod composite;
mod controller;
mod exported;
mod registry;
mod session;

pub use composite::{CompositeBuild, CompositeOutcome, CompositeSettings, IncludedBuild};
pub use controller::BuildWorkGraphController;
pub use exported::{CompletionListener, ExportedTaskNode, LateListenerPolicy, TaskState};
pub use registry::TaskRegistry;
pub use session::{SessionId, SessionPhase, StopHandle, WorkGraph};
