//! Composite builds.
//!
//! A [`CompositeBuild`] groups several [`LocalBuild`]s whose tasks depend on
//! each other. Every included build gets its own coordinator; all of them
//! share one [`ProjectStateLock`] for structural plan changes. A run opens
//! one session per participating build, each on its own thread, and the
//! builds learn about each other's progress through exported task nodes.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{ProjectStateLock, TaskIdentity, TaskPath};
use crate::engine::{
    ExecutionFailure, ExecutionResult, ExternalTaskResolver, LocalBuild, LocalPlan,
};
use crate::error::{Error, Result};
use crate::orchestration::controller::BuildWorkGraphController;
use crate::orchestration::exported::{ExportedTaskNode, LateListenerPolicy, TaskState};
use crate::orchestration::session::StopHandle;
use crate::util::lock;
use crate::{wlog, wlog_debug, wlog_error};

/// Settings applied to every build added to a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeSettings {
    pub max_workers: usize,
    pub late_listeners: LateListenerPolicy,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CompositeSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_workers: config.effective_workers(),
            late_listeners: config.late_listeners,
        }
    }
}

/// A build taking part in a composite: its engine and its coordinator.
#[derive(Debug, Clone)]
pub struct IncludedBuild {
    engine: LocalBuild,
    controller: BuildWorkGraphController<LocalBuild>,
}

impl IncludedBuild {
    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn engine(&self) -> &LocalBuild {
        &self.engine
    }

    pub fn controller(&self) -> &BuildWorkGraphController<LocalBuild> {
        &self.controller
    }
}

#[derive(Default)]
struct BuildIndex {
    builds: RwLock<BTreeMap<String, IncludedBuild>>,
}

impl BuildIndex {
    fn get(&self, name: &str) -> Option<IncludedBuild> {
        self.builds
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn names(&self) -> Vec<String> {
        self.builds
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl ExternalTaskResolver for BuildIndex {
    fn locate_external(&self, path: &TaskPath) -> Result<ExportedTaskNode> {
        let name = path
            .build_name()
            .ok_or_else(|| Error::UnknownBuild(path.to_string()))?;
        let build = self
            .get(name)
            .ok_or_else(|| Error::UnknownBuild(name.to_string()))?;
        Ok(build
            .controller
            .locate_task(&TaskIdentity::Path(path.clone())))
    }
}

/// Per-build results of a composite run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompositeOutcome {
    pub results: BTreeMap<String, ExecutionResult>,
}

impl CompositeOutcome {
    pub fn is_success(&self) -> bool {
        self.results.values().all(ExecutionResult::is_success)
    }

    /// Every failure, tagged with the build that reported it.
    pub fn failures(&self) -> Vec<(&str, &ExecutionFailure)> {
        self.results
            .iter()
            .flat_map(|(build, result)| {
                result
                    .failures()
                    .iter()
                    .map(move |failure| (build.as_str(), failure))
            })
            .collect()
    }
}

pub struct CompositeBuild {
    index: Arc<BuildIndex>,
    mutation_lock: ProjectStateLock,
    settings: CompositeSettings,
    /// Parent token of the current run; each session watches a child of it.
    cancel: Mutex<CancellationToken>,
}

impl CompositeBuild {
    pub fn new(settings: CompositeSettings) -> Self {
        Self {
            index: Arc::new(BuildIndex::default()),
            mutation_lock: ProjectStateLock::new(),
            settings,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn settings(&self) -> CompositeSettings {
        self.settings
    }

    pub fn mutation_lock(&self) -> &ProjectStateLock {
        &self.mutation_lock
    }

    /// Include a new, empty build and return its engine for task registration.
    pub fn add_build(&self, name: &str) -> Result<LocalBuild> {
        if name.is_empty() || name.contains(':') {
            return Err(Error::Validation(format!("invalid build name '{}'", name)));
        }
        let mut builds = self
            .index
            .builds
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if builds.contains_key(name) {
            return Err(Error::Validation(format!(
                "build '{}' is already included",
                name
            )));
        }

        let engine = LocalBuild::new(name, self.settings.max_workers);
        let index: Arc<dyn ExternalTaskResolver> = self.index.clone();
        let resolver: Weak<dyn ExternalTaskResolver> = Arc::downgrade(&index);
        engine.set_resolver(resolver);
        let controller = BuildWorkGraphController::new(
            name,
            Arc::new(engine.clone()),
            Arc::new(engine.clone()),
            self.mutation_lock.clone(),
            self.settings.late_listeners,
        );
        builds.insert(
            name.to_string(),
            IncludedBuild {
                engine: engine.clone(),
                controller,
            },
        );
        wlog_debug!("composite: included build '{}'", name);
        Ok(engine)
    }

    pub fn build(&self, name: &str) -> Result<IncludedBuild> {
        self.index
            .get(name)
            .ok_or_else(|| Error::UnknownBuild(name.to_string()))
    }

    pub fn build_names(&self) -> Vec<String> {
        self.index.names()
    }

    /// The exported node for a qualified task path.
    pub fn locate(&self, path: &TaskPath) -> Result<ExportedTaskNode> {
        self.index.locate_external(path)
    }

    /// Group `requested` and every external dependency they reach by build.
    pub fn plan_work(&self, requested: &[TaskPath]) -> Result<BTreeMap<String, Vec<TaskPath>>> {
        let mut work: BTreeMap<String, Vec<TaskPath>> = BTreeMap::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TaskPath> = requested.iter().cloned().collect();

        while let Some(path) = queue.pop_front() {
            if !seen.insert(path.clone()) {
                continue;
            }
            let name = path.build_name().ok_or_else(|| {
                Error::Validation(format!("task path '{}' does not name a build", path))
            })?;
            let build = self.build(name)?;
            if build.engine.dependencies_of(&path).is_none() {
                return Err(Error::NotScheduled { path });
            }
            queue.extend(build.engine.external_dependencies(&path)?);
            work.entry(name.to_string()).or_default().push(path);
        }
        Ok(work)
    }

    /// Run `requested` and everything they depend on, across builds.
    ///
    /// Blocks until every participating build has finished.
    pub fn run(&self, requested: &[TaskPath]) -> Result<CompositeOutcome> {
        let work = self.plan_work(requested)?;
        let mut participants = Vec::with_capacity(work.len());
        for (name, paths) in work {
            participants.push((self.build(&name)?, paths));
        }

        let cancel = {
            let mut current = lock(&self.cancel);
            *current = CancellationToken::new();
            current.clone()
        };
        wlog!(
            "composite: running {} tasks across {} builds",
            requested.len(),
            participants.len()
        );

        let results: Vec<(String, Result<ExecutionResult>)> = thread::scope(|scope| {
            let handles: Vec<_> = participants
                .iter()
                .map(|(build, paths)| {
                    let cancel = &cancel;
                    let handle = thread::Builder::new()
                        .name(build.name().to_string())
                        .spawn_scoped(scope, move || run_build(build, paths, cancel));
                    if handle.is_err() {
                        cancel.cancel();
                    }
                    (build.name().to_string(), handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = match handle {
                        Ok(handle) => handle.join().unwrap_or_else(|_| {
                            Err(Error::TaskJoin(format!("build '{}' panicked", name)))
                        }),
                        Err(err) => Err(Error::Io(err)),
                    };
                    (name, result)
                })
                .collect()
        });

        let mut outcome = CompositeOutcome::default();
        let mut first_error = None;
        for (name, result) in results {
            match result {
                Ok(result) => {
                    outcome.results.insert(name, result);
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                wlog!("composite: finished, success={}", outcome.is_success());
                Ok(outcome)
            }
        }
    }

    /// Stop every running session. Sessions started later in the same run stop right away.
    pub fn stop(&self) {
        wlog_debug!("composite: cancelling the current run");
        lock(&self.cancel).cancel();
    }

    /// Final state of every registered task, in build then path order.
    pub fn task_states(&self) -> Vec<(TaskPath, TaskState)> {
        let mut states = Vec::new();
        for name in self.index.names() {
            if let Some(build) = self.index.get(&name) {
                for path in build.engine.task_paths() {
                    let node = build
                        .controller
                        .locate_task(&TaskIdentity::Path(path.clone()));
                    states.push((path, node.task_state()));
                }
            }
        }
        states
    }
}

fn run_build(
    build: &IncludedBuild,
    paths: &[TaskPath],
    cancel: &CancellationToken,
) -> Result<ExecutionResult> {
    let result = drive_session(build, paths, cancel);
    if let Err(err) = &result {
        wlog_error!("composite: build '{}' failed: {}", build.name(), err);
        cancel.cancel();
    }
    result
}

fn drive_session(
    build: &IncludedBuild,
    paths: &[TaskPath],
    cancel: &CancellationToken,
) -> Result<ExecutionResult> {
    let mut session = build.controller.new_work_graph()?;
    let nodes: Vec<_> = paths
        .iter()
        .map(|path| build.controller.locate_task(&TaskIdentity::Path(path.clone())))
        .collect();
    session.schedule(&nodes)?;
    session.finalize_graph()?;

    // The plan exists now, so a forwarded stop always reaches it.
    let token = cancel.child_token();
    let finished = CancellationToken::new();
    let stop = session.stop_handle();
    if token.is_cancelled() {
        stop.stop();
    }
    let watcher = tokio::runtime::Builder::new_current_thread().build()?;
    thread::scope(|scope| {
        scope.spawn(|| forward_cancellation(&watcher, &token, &finished, &stop));
        // Releases the watcher even if the run unwinds.
        let _finished = finished.clone().drop_guard();
        session.run_work()
    })
}

/// Block until `token` or `finished` is cancelled. Only `token` stops the plan.
fn forward_cancellation(
    watcher: &tokio::runtime::Runtime,
    token: &CancellationToken,
    finished: &CancellationToken,
    stop: &StopHandle<LocalPlan>,
) {
    let cancelled = watcher.block_on(async {
        tokio::select! {
            biased;
            _ = token.cancelled() => true,
            _ = finished.cancelled() => false,
        }
    });
    if cancelled {
        wlog_debug!("composite: stop forwarded to session");
        stop.stop();
    }
}

impl Default for CompositeBuild {
    fn default() -> Self {
        Self::new(CompositeSettings::default())
    }
}

impl std::fmt::Debug for CompositeBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBuild")
            .field("builds", &self.index.names())
            .field("settings", &self.settings)
            .finish()
    }
}
