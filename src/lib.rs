//! svcmod supervises local services that announce themselves through a pid file.
//! Each service is a [`module::Module`]: a small state machine that launches the
//! service, waits for its pid, optionally probes it, and watches it for crashes.
//! Filesystem rights the service depends on can be verified and corrected before
//! launch.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants.
pub mod constants;

/// Error handling.
pub mod error;

/// Per-module operation workers.
pub mod executor;

/// Shared filesystem notification service.
pub mod fswatch;

/// Module state machine.
pub mod module;

/// Pid file parsing and waiting.
pub mod pidfile;

/// Process liveness and crash watching.
pub mod process;

/// Filesystem rights checks.
pub mod rights;

/// Service launch and signalling.
pub mod service;


/// Module status values.
pub mod status;

/// Host-level owner of all modules.
pub mod supervisor;
