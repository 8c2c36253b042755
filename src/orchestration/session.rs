//! Work-graph sessions.
//!
//! A [`WorkGraph`] is one schedule, finalize, execute cycle against the
//! engine. It is owned by the thread that opened it and holds its
//! controller's session slot until [`WorkGraph::run_work`] returns.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use uuid::Uuid;

use crate::core::Task;
use crate::engine::{BuildLifecycle, ExecutionResult, WorkPlan};
use crate::error::{Error, Result};
use crate::orchestration::controller::ControllerShared;
use crate::orchestration::exported::ExportedTaskNode;
use crate::orchestration::registry::TaskRegistry;
use crate::{wlog_debug, wlog_trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Created,
    Scheduling,
    Finalized,
    Executed,
    Released,
}

/// Stops a session's plan from any thread.
pub struct StopHandle<P> {
    plan: Arc<OnceLock<P>>,
}

impl<P: WorkPlan> StopHandle<P> {
    /// Forward cancellation to the plan, if the session created one.
    pub fn stop(&self) {
        if let Some(plan) = self.plan.get() {
            plan.stop();
        }
    }
}

impl<P> Clone for StopHandle<P> {
    fn clone(&self) -> Self {
        Self {
            plan: Arc::clone(&self.plan),
        }
    }
}

impl<P> std::fmt::Debug for StopHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("has_plan", &self.plan.get().is_some())
            .finish()
    }
}

/// Frees the controller's session slot when dropped.
struct ReleaseSlot<L: BuildLifecycle> {
    controller: Arc<ControllerShared<L>>,
    session: SessionId,
}

impl<L: BuildLifecycle> Drop for ReleaseSlot<L> {
    fn drop(&mut self) {
        self.controller.release(self.session);
    }
}

/// One unit of work against a build's engine.
pub struct WorkGraph<L: BuildLifecycle> {
    id: SessionId,
    owner: ThreadId,
    controller: Arc<ControllerShared<L>>,
    plan: Arc<OnceLock<L::Plan>>,
    phase: SessionPhase,
}

impl<L: BuildLifecycle> WorkGraph<L> {
    pub(crate) fn new(id: SessionId, controller: Arc<ControllerShared<L>>) -> Self {
        Self {
            id,
            owner: thread::current().id(),
            controller,
            plan: Arc::new(OnceLock::new()),
            phase: SessionPhase::Created,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The engine plan, once the first scheduling or population created it.
    pub fn plan(&self) -> Option<&L::Plan> {
        self.plan.get()
    }

    pub fn stop_handle(&self) -> StopHandle<L::Plan> {
        StopHandle {
            plan: Arc::clone(&self.plan),
        }
    }

    /// Add the tasks behind `nodes` as entry tasks of the plan.
    ///
    /// Returns `Ok(false)` without touching the plan when every node is
    /// already required.
    pub fn schedule(&mut self, nodes: &[ExportedTaskNode]) -> Result<bool> {
        self.assert_is_owner()?;

        let mut tasks: Vec<Task> = Vec::new();
        for node in nodes {
            if !self.controller.registry.owns(node) {
                return Err(Error::ForeignNode {
                    path: node.path().clone(),
                });
            }
            if node.should_schedule() {
                let task = node.task()?;
                if !tasks.contains(&task) {
                    tasks.push(task);
                }
            }
        }
        if tasks.is_empty() {
            wlog_trace!(
                "[{}] session {}: nothing new to schedule",
                self.controller.build_name,
                self.id.short()
            );
            return Ok(false);
        }

        let controller = Arc::clone(&self.controller);
        controller.mutation_lock.with_mutable_state(|| {
            let plan = self.create_plan();
            controller
                .lifecycle
                .populate_work_graph(plan, |plan| plan.add_entry_tasks(&tasks))
        })?;
        wlog_debug!(
            "[{}] session {}: scheduled {} tasks",
            self.controller.build_name,
            self.id.short(),
            tasks.len()
        );
        Ok(true)
    }

    /// Hand the plan to `action` through the engine, creating it if needed.
    pub fn populate_work_graph<F>(&mut self, action: F) -> Result<()>
    where
        F: FnOnce(&L::Plan) -> Result<()>,
    {
        self.assert_is_owner()?;
        let controller = Arc::clone(&self.controller);
        let plan = self.create_plan();
        controller.lifecycle.populate_work_graph(plan, action)
    }

    pub fn finalize_graph(&mut self) -> Result<()> {
        self.assert_is_owner()?;
        if let Some(plan) = self.plan.get() {
            self.controller.lifecycle.finalize_work_graph(plan)?;
        }
        self.phase = SessionPhase::Finalized;
        Ok(())
    }

    /// Execute the plan and release the session slot.
    ///
    /// The slot is released whatever the outcome, including a panic in the
    /// engine. The session cannot be used afterwards.
    pub fn run_work(&mut self) -> Result<ExecutionResult> {
        self.assert_is_owner()?;
        let _slot = ReleaseSlot {
            controller: Arc::clone(&self.controller),
            session: self.id,
        };
        self.phase = SessionPhase::Executed;

        let result = match self.plan.get() {
            Some(plan) => self.controller.lifecycle.execute_tasks(plan),
            None => {
                wlog_trace!(
                    "[{}] session {}: no plan, nothing to execute",
                    self.controller.build_name,
                    self.id.short()
                );
                ExecutionResult::succeeded()
            }
        };
        self.phase = SessionPhase::Released;
        Ok(result)
    }

    pub fn stop(&self) {
        if let Some(plan) = self.plan.get() {
            plan.stop();
        }
    }

    fn assert_is_owner(&self) -> Result<()> {
        if self.phase == SessionPhase::Released {
            return Err(Error::SessionReleased { session: self.id });
        }
        if thread::current().id() != self.owner {
            return Err(Error::NotOwner { session: self.id });
        }
        Ok(())
    }

    fn create_plan(&mut self) -> &L::Plan {
        if self.phase == SessionPhase::Created {
            self.phase = SessionPhase::Scheduling;
        }
        let controller = &self.controller;
        self.plan.get_or_init(|| {
            controller.lifecycle.prepare_to_schedule_tasks();
            let plan = controller.lifecycle.new_work_graph();
            let registry = Arc::clone(&controller.registry);
            plan.on_complete(Box::new(move |task: &Task| node_completed(&registry, task)));
            plan
        })
    }
}

/// Fire the listeners of the exported node for a finished task, if anyone asked for it.
fn node_completed(registry: &TaskRegistry, task: &Task) {
    if let Some(node) = registry.get(task.path()) {
        node.fire_completed();
    }
}

impl<L: BuildLifecycle> Drop for WorkGraph<L> {
    fn drop(&mut self) {
        if self.phase != SessionPhase::Released {
            wlog_debug!(
                "[{}] session {} dropped in phase {:?}",
                self.controller.build_name,
                self.id.short(),
                self.phase
            );
            self.controller.release(self.id);
        }
    }
}

impl<L: BuildLifecycle> std::fmt::Debug for WorkGraph<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGraph")
            .field("id", &self.id)
            .field("build", &self.controller.build_name)
            .field("phase", &self.phase)
            .field("has_plan", &self.plan.get().is_some())
            .finish()
    }
}
