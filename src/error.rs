use thiserror::Error;

use crate::core::TaskPath;
use crate::orchestration::SessionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("The work graph of build '{build}' is currently in use by another session.")]
    WorkGraphInUse { build: String },

    #[error("Current thread is not the owner of work graph {session}.")]
    NotOwner { session: SessionId },

    #[error("Work graph {session} has already been released.")]
    SessionReleased { session: SessionId },

    #[error("Task node '{path}' was not created by this build's registry.")]
    ForeignNode { path: TaskPath },

    #[error("Task '{path}' was never scheduled for execution.")]
    NotScheduled { path: TaskPath },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Unknown build: {0}")]
    UnknownBuild(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether this error reports misuse of the coordinator protocol by the caller.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::WorkGraphInUse { .. }
                | Error::NotOwner { .. }
                | Error::SessionReleased { .. }
                | Error::ForeignNode { .. }
                | Error::NotScheduled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
