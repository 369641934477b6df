//! Error taxonomy for execution sessions.
//!
//! The `Display` text of every [`ExecError`] is exactly what the client sees
//! after the `e` channel tag, so wording changes here are protocol changes.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a single build or run step did not succeed.
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("Failed to start process: {0}")]
    Spawn(#[source] io::Error),

    #[error("Command failed with exit code {0}")]
    Exit(i32),

    #[error("Command terminated by signal {0}")]
    Signal(i32),

    #[error("Failed to read process output: {0}")]
    Io(#[source] io::Error),
}

/// Terminal failure of an execution session.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Error: Missing UUID")]
    MissingToken,

    #[error("Error: Missing code or language")]
    MissingCodeOrLanguage,

    #[error("Error: Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Execution not confirmed by the user.")]
    Rejected,

    #[error("Error: Custom folder {} does not exist", .0.display())]
    MissingCustomDir(PathBuf),

    #[error("Error: Unsupported language {0}")]
    UnsupportedLanguage(String),

    #[error("Error: {0}")]
    Workspace(#[source] io::Error),

    #[error("Compilation failed: {0}")]
    Build(#[source] StepFailure),

    #[error("Run failed: {0}")]
    Run(#[source] StepFailure),

    #[error("Execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("client disconnected")]
    Disconnected,
}

/// Classification carried by the `Failed` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    MissingFields,
    InvalidRequest,
    Rejected,
    UnsupportedLanguage,
    WorkspaceError,
    BuildFailure,
    RunFailure,
    Timeout,
    Disconnected,
}

impl ExecError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecError::MissingToken | ExecError::MissingCodeOrLanguage => {
                FailureKind::MissingFields
            }
            ExecError::InvalidRequest(_) => FailureKind::InvalidRequest,
            ExecError::Rejected => FailureKind::Rejected,
            ExecError::MissingCustomDir(_) | ExecError::Workspace(_) => {
                FailureKind::WorkspaceError
            }
            ExecError::UnsupportedLanguage(_) => FailureKind::UnsupportedLanguage,
            ExecError::Build(_) => FailureKind::BuildFailure,
            ExecError::Run(_) => FailureKind::RunFailure,
            ExecError::Timeout(_) => FailureKind::Timeout,
            ExecError::Disconnected => FailureKind::Disconnected,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::MissingFields => "missing-fields",
            FailureKind::InvalidRequest => "invalid-request",
            FailureKind::Rejected => "rejected",
            FailureKind::UnsupportedLanguage => "unsupported-language",
            FailureKind::WorkspaceError => "workspace-error",
            FailureKind::BuildFailure => "build-failure",
            FailureKind::RunFailure => "run-failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("refusing to bind non-loopback address {0}")]
    NotLoopback(std::net::IpAddr),

    #[error("execution deadline must be greater than zero")]
    ZeroDeadline,

    #[error("trusted token must not be empty")]
    EmptyToken,
}
