//! Lifecycle status of a supervised module.
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// The externally visible state of a [`Module`](crate::module::Module).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ModuleStatus {
    /// Not running. Initial state.
    #[default]
    Stopped,
    /// A `start` is in flight.
    Starting,
    /// The process is confirmed alive and watched.
    Running,
    /// A `stop` is in flight.
    Stopping,
    /// A `reload` is in flight.
    Reloading,
    /// The last operation failed or the process died unexpectedly. Left only via `start`.
    Error,
}

impl ModuleStatus {
    /// True while an operation owns the module.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ModuleStatus::Starting | ModuleStatus::Stopping | ModuleStatus::Reloading
        )
    }

    /// States from which `start` is allowed.
    pub fn can_start(self) -> bool {
        matches!(self, ModuleStatus::Stopped | ModuleStatus::Error)
    }
}

/// A status transition delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub module: String,
    pub from: ModuleStatus,
    pub to: ModuleStatus,
    /// Pid being watched after the transition (set only when `to` is `Running`).
    pub pid: Option<u32>,
}
