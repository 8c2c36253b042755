//! Build manifests.
//!
//! A manifest describes the builds of a composite build and their tasks in
//! TOML:
//!
//! ```toml
//! [[build]]
//! name = "lib"
//!
//! [[build.task]]
//! name = "jar"
//! command = "echo packaging"
//!
//! [[build]]
//! name = "app"
//!
//! [[build.task]]
//! name = "compile"
//! depends_on = ["lib:jar"]
//! sleep_ms = 50
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use crate::config::expand_tilde;
use crate::core::TaskPath;
use crate::engine::TaskAction;
use crate::orchestration::{CompositeBuild, CompositeSettings};
use crate::{wlog_debug, wlog_warn, Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "build")]
    pub builds: Vec<BuildSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub name: String,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Shell command run with `sh -c`; a non-zero exit fails the task.
    pub command: Option<String>,
    /// Time the task takes before running its command.
    pub sleep_ms: Option<u64>,
    #[serde(default)]
    pub fail: bool,
}

impl TaskSpec {
    fn action(&self, path: &TaskPath) -> TaskAction {
        let path = path.clone();
        let command = self.command.clone();
        let sleep = self.sleep_ms.map(Duration::from_millis);
        let fail = self.fail;
        Arc::new(move || {
            if let Some(sleep) = sleep {
                std::thread::sleep(sleep);
            }
            if let Some(command) = &command {
                run_command(&path, command)?;
            }
            if fail {
                return Err("task is configured to fail".to_string());
            }
            Ok(())
        })
    }
}

fn run_command(path: &TaskPath, command: &str) -> std::result::Result<(), String> {
    wlog_debug!("{}: running `{}`", path, command);
    let output = Command::new("sh")
        .args(["-c", command])
        .output()
        .map_err(|e| format!("failed to spawn `{}`: {}", command, e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        wlog_warn!("{}: `{}` exited with {}", path, command, output.status);
        return Err(format!(
            "`{}` exited with {}: {}",
            command,
            output.status,
            stderr.trim()
        ));
    }
    Ok(())
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(&path.to_string_lossy());
        wlog_debug!("Manifest::load path={}", path.display());
        Self::parse(&fs::read_to_string(&path)?)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check names and that every dependency names a declared task.
    pub fn validate(&self) -> Result<()> {
        let mut declared: HashMap<&str, HashSet<&str>> = HashMap::new();
        for build in &self.builds {
            if build.name.is_empty() || build.name.contains(':') {
                return Err(Error::Validation(format!(
                    "invalid build name '{}'",
                    build.name
                )));
            }
            if declared.contains_key(build.name.as_str()) {
                return Err(Error::Validation(format!(
                    "build '{}' is declared twice",
                    build.name
                )));
            }
            let tasks = declared.entry(build.name.as_str()).or_default();
            for task in &build.tasks {
                if task.name.is_empty() || task.name.contains(':') {
                    return Err(Error::Validation(format!(
                        "invalid task name '{}' in build '{}'",
                        task.name, build.name
                    )));
                }
                if !tasks.insert(task.name.as_str()) {
                    return Err(Error::Validation(format!(
                        "task '{}:{}' is declared twice",
                        build.name, task.name
                    )));
                }
            }
        }

        for build in &self.builds {
            for task in &build.tasks {
                for dependency in &task.depends_on {
                    let (dep_build, dep_task) = match dependency.split_once(':') {
                        Some((dep_build, dep_task)) => (dep_build, dep_task),
                        None => (build.name.as_str(), dependency.as_str()),
                    };
                    let known = declared
                        .get(dep_build)
                        .is_some_and(|tasks| tasks.contains(dep_task));
                    if !known {
                        return Err(Error::Validation(format!(
                            "task '{}:{}' depends on unknown task '{}'",
                            build.name, task.name, dependency
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Build a composite with every build and task of the manifest registered.
    pub fn to_composite(&self, settings: CompositeSettings) -> Result<CompositeBuild> {
        self.validate()?;
        let composite = CompositeBuild::new(settings);
        for build in &self.builds {
            let engine = composite.add_build(&build.name)?;
            for task in &build.tasks {
                let path = TaskPath::qualified(&build.name, &task.name);
                engine.register(&task.name, &task.depends_on, task.action(&path))?;
            }
        }
        wlog_debug!(
            "Manifest loaded into composite with {} builds",
            self.builds.len()
        );
        Ok(composite)
    }
}
