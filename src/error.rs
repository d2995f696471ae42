use std::path::PathBuf;

use crate::failures::FailureReport;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that abort a test case.
///
/// These are the fatal tier: the harness itself cannot proceed. Mismatches
/// between the subject's behavior and the test's expectations are never
/// raised directly; they are collected in a [`crate::FailureList`] and only
/// surface here as [`HarnessError::Assertions`] when the list is presented.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("script must contain at least one step")]
    EmptyScript,

    #[error("invalid signal number {0}")]
    InvalidSignal(i32),

    #[error("unknown signal name {0:?}")]
    UnknownSignal(String),

    #[error("{action} cannot be delivered to {subject}")]
    UnsupportedAction { action: String, subject: String },

    #[error("failed to start {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} has not been started")]
    NotStarted(String),

    #[error("elevated privilege is unavailable: {0}")]
    PrivilegeUnavailable(String),

    #[error("module {0} is already loaded (unload it before loading again)")]
    DoubleLoad(String),

    #[error("module {0} is not loaded")]
    NotLoaded(String),

    #[error("artifact not found: {0}")]
    ArtifactMissing(PathBuf),

    #[error("failed to build {target}: {reason}")]
    BuildFailed { target: String, reason: String },

    #[error("failed to load {module}: {reason}")]
    LoadFailed { module: String, reason: String },

    #[error("failed to unload {module}: {reason}")]
    UnloadFailed { module: String, reason: String },

    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("{0} is an unsupported log level, choose one of: emerg, alert, crit, err, warn, notice, info, debug")]
    UnsupportedSeverity(String),

    #[error("directory {0} not found")]
    DirectoryNotFound(String),

    #[error("{0}")]
    Assertions(FailureReport),

    #[error("test failures were already presented for this test case")]
    FailuresAlreadyPresented,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OS error: {0}")]
    Os(#[from] nix::Error),
}

impl HarnessError {
    /// Creates a command failure from anything printable.
    pub fn command(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the accumulated-assertion outcome, false for every fatal error.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Self::Assertions(_))
    }
}
