//! Error handling for svcmod.
use thiserror::Error;

use crate::status::ModuleStatus;

/// Failure category of a [`ModuleError`], for callers that branch on the kind rather
/// than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleErrorKind {
    SpawnFailed,
    PidTimeout,
    StartTestFailed,
    SignalFailed,
    StopTimeout,
    RightsCheckFailed,
    RightsFixFailed,
    InvalidStateTransition,
    Watch,
    WorkerGone,
    MutexPoison,
}

/// Defines all possible errors a module lifecycle operation can surface.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The service process could not be launched.
    #[error("Failed to spawn module '{module}': {source}")]
    SpawnFailed {
        /// The module that failed to spawn.
        module: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The pid file never held a valid pid within the configured bound.
    #[error("Module '{module}' did not write a valid pid to {path} within {timeout:?}")]
    PidTimeout {
        module: String,
        path: String,
        timeout: std::time::Duration,
    },

    /// The process launched but the start test rejected it.
    #[error("Start test for module '{module}' failed: {detail}")]
    StartTestFailed { module: String, detail: String },

    /// A stop or reload signal could not be delivered.
    #[error("Failed to signal module '{module}' (PID {pid}): {source}")]
    SignalFailed {
        module: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The process was signalled but kept running past the stop timeout.
    #[error("Module '{module}' (PID {pid}) did not exit within {timeout:?}")]
    StopTimeout {
        module: String,
        pid: u32,
        timeout: std::time::Duration,
    },

    /// Filesystem rights are wrong or could not be inspected.
    #[error("Rights check for module '{module}' failed: {detail}")]
    RightsCheckFailed { module: String, detail: String },

    /// Filesystem rights were wrong and could not be corrected.
    #[error("Failed to fix rights on {path} for module '{module}': {source}")]
    RightsFixFailed {
        module: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation was requested that the current state does not allow.
    #[error("Module '{module}' cannot {operation} while {status}")]
    InvalidStateTransition {
        module: String,
        operation: &'static str,
        status: ModuleStatus,
    },

    /// The filesystem notification backend failed.
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    /// The worker thread that runs a module's operations has stopped.
    #[error("Operation worker for module '{0}' is no longer running")]
    WorkerGone(String),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl ModuleError {
    /// Returns the failure category.
    pub fn kind(&self) -> ModuleErrorKind {
        match self {
            ModuleError::SpawnFailed { .. } => ModuleErrorKind::SpawnFailed,
            ModuleError::PidTimeout { .. } => ModuleErrorKind::PidTimeout,
            ModuleError::StartTestFailed { .. } => ModuleErrorKind::StartTestFailed,
            ModuleError::SignalFailed { .. } => ModuleErrorKind::SignalFailed,
            ModuleError::StopTimeout { .. } => ModuleErrorKind::StopTimeout,
            ModuleError::RightsCheckFailed { .. } => ModuleErrorKind::RightsCheckFailed,
            ModuleError::RightsFixFailed { .. } => ModuleErrorKind::RightsFixFailed,
            ModuleError::InvalidStateTransition { .. } => {
                ModuleErrorKind::InvalidStateTransition
            }
            ModuleError::Watch(_) => ModuleErrorKind::Watch,
            ModuleError::WorkerGone(_) => ModuleErrorKind::WorkerGone,
            ModuleError::MutexPoisonError(_) => ModuleErrorKind::MutexPoison,
        }
    }
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ModuleError`.
impl<T> From<std::sync::PoisonError<T>> for ModuleError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ModuleError::MutexPoisonError(err.to_string())
    }
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A value parsed but does not make sense.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A `${VAR}` reference names an unset variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}

/// Converts a nix errno into the equivalent `std::io::Error`.
pub(crate) fn errno_to_io(err: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}
