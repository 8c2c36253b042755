//! Per-build work graph coordinator.

use std::sync::{Arc, Mutex};

use crate::core::{ProjectStateLock, TaskIdentity};
use crate::engine::{BuildLifecycle, TaskNodeFactory};
use crate::error::{Error, Result};
use crate::orchestration::exported::{ExportedTaskNode, LateListenerPolicy};
use crate::orchestration::registry::TaskRegistry;
use crate::orchestration::session::{SessionId, WorkGraph};
use crate::util::lock;
use crate::wlog_debug;

pub(crate) struct ControllerShared<L: BuildLifecycle> {
    pub(crate) build_name: String,
    pub(crate) lifecycle: Arc<L>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) mutation_lock: ProjectStateLock,
    current: Mutex<Option<SessionId>>,
}

impl<L: BuildLifecycle> ControllerShared<L> {
    /// Free the session slot if `session` still holds it.
    pub(crate) fn release(&self, session: SessionId) {
        let mut current = lock(&self.current);
        if *current == Some(session) {
            *current = None;
            wlog_debug!("[{}] released session {}", self.build_name, session.short());
        }
    }
}

/// Hands out exported task nodes for one build and runs its work graph
/// sessions, one at a time.
pub struct BuildWorkGraphController<L: BuildLifecycle> {
    shared: Arc<ControllerShared<L>>,
}

impl<L: BuildLifecycle> BuildWorkGraphController<L> {
    /// `mutation_lock` must be the lock shared by every build of the composite.
    pub fn new(
        build_name: impl Into<String>,
        lifecycle: Arc<L>,
        factory: Arc<dyn TaskNodeFactory>,
        mutation_lock: ProjectStateLock,
        late_listeners: LateListenerPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                build_name: build_name.into(),
                lifecycle,
                registry: Arc::new(TaskRegistry::new(factory, late_listeners)),
                mutation_lock,
                current: Mutex::new(None),
            }),
        }
    }

    pub fn build_name(&self) -> &str {
        &self.shared.build_name
    }

    pub fn lifecycle(&self) -> &Arc<L> {
        &self.shared.lifecycle
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.shared.registry
    }

    /// The canonical exported node for `identity`.
    pub fn locate_task(&self, identity: &TaskIdentity) -> ExportedTaskNode {
        self.shared.registry.locate(identity)
    }

    /// Open a session owned by the calling thread.
    ///
    /// Fails with [`Error::WorkGraphInUse`] while another session holds the slot.
    pub fn new_work_graph(&self) -> Result<WorkGraph<L>> {
        let mut current = lock(&self.shared.current);
        if current.is_some() {
            return Err(Error::WorkGraphInUse {
                build: self.shared.build_name.clone(),
            });
        }
        let id = SessionId::new();
        *current = Some(id);
        drop(current);

        wlog_debug!("[{}] opened session {}", self.shared.build_name, id.short());
        Ok(WorkGraph::new(id, Arc::clone(&self.shared)))
    }

    pub fn has_active_work_graph(&self) -> bool {
        lock(&self.shared.current).is_some()
    }
}

impl<L: BuildLifecycle> Clone for BuildWorkGraphController<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: BuildLifecycle> std::fmt::Debug for BuildWorkGraphController<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildWorkGraphController")
            .field("build", &self.shared.build_name)
            .field("registry", &self.shared.registry)
            .field("active", &self.has_active_work_graph())
            .finish()
    }
}
