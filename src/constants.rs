//! Constants and default configuration values for svcmod.
//!
//! This module centralizes timing bounds, signal defaults and file names used
//! across the supervisor so every wait in the crate has a named upper bound.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "svcmod.yaml";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for launch, stop, reload and probe commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// Pid File Handshake
// ============================================================================

/// How long `start` waits for the spawned process to write its pid.
pub const DEFAULT_PID_TIMEOUT: Duration = Duration::from_secs(5);

/// Coarse re-read interval used between filesystem notifications.
///
/// Covers directories that cannot be watched and notifications that coalesce
/// a partial write with the final one.
pub const PID_FILE_RECHECK_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Process Liveness
// ============================================================================

/// Interval between liveness checks of a running module.
pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between liveness checks while waiting for a signalled process to exit.
pub const PROCESS_EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop` waits for the process to exit after the stop signal.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after SIGKILL escalation before giving up.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long `reload` lets the service settle before re-validating its pid.
pub const DEFAULT_RELOAD_GRACE: Duration = Duration::from_millis(500);

/// Signal used to stop a module when none is configured.
pub const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";

/// Signal used to reload a module when none is configured.
pub const DEFAULT_RELOAD_SIGNAL: &str = "SIGHUP";

// ============================================================================
// Start Tests
// ============================================================================

/// Upper bound for a single start test when the config does not set one.
pub const DEFAULT_START_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between attempts of retrying probes (tcp, http).
pub const PROBE_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound for a stop/reload command run in place of a signal.
pub const CONTROL_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
