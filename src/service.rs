//! How a module's service is launched and signalled.
//!
//! [`ServiceProcess`] is injected into each [`Module`](crate::module::Module); the
//! module never knows whether a stop is a signal or a vendor control script.
use nix::sys::signal::Signal;
use std::{
    collections::HashMap,
    io,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
};
use tracing::{debug, warn};

use crate::config::ModuleConfig;
use crate::constants::{CONTROL_COMMAND_TIMEOUT, DEFAULT_SHELL, SHELL_COMMAND_FLAG};
use crate::error::{ConfigError, errno_to_io};
use crate::process::{send_signal, wait_with_timeout};

/// Launch and control strategy for one service.
pub trait ServiceProcess: Send + Sync {
    /// Launches the service. The returned child is the launcher, which may or may
    /// not be the process that ends up writing the pid file.
    fn spawn(&self, module: &str) -> io::Result<Child>;

    /// Asks the process to terminate. An error whose OS code is `ESRCH` means the
    /// process was already gone.
    fn stop(&self, module: &str, pid: u32) -> io::Result<()>;

    /// Asks the process to reload its configuration.
    fn reload(&self, module: &str, pid: u32) -> io::Result<()>;

    /// Last-resort termination after a stop timed out.
    fn kill(&self, _module: &str, pid: u32) -> io::Result<()> {
        send_signal(pid, Signal::SIGKILL).map_err(errno_to_io)
    }
}

/// A service launched through `sh -c` and controlled with signals or commands.
#[derive(Debug, Clone)]
pub struct ShellService {
    pub command: String,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stop_signal: Signal,
    pub reload_signal: Signal,
    pub stop_command: Option<String>,
    pub reload_command: Option<String>,
}

impl ShellService {
    /// A service with default signals and no extra environment.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
            working_dir: None,
            stop_signal: Signal::SIGTERM,
            reload_signal: Signal::SIGHUP,
            stop_command: None,
            reload_command: None,
        }
    }

    pub fn from_config(config: &ModuleConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            command: config.command.clone(),
            env: config.env.clone().unwrap_or_default(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            stop_signal: config.stop_signal()?,
            reload_signal: config.reload_signal()?,
            stop_command: config.stop_command.clone(),
            reload_command: config.reload_command.clone(),
        })
    }

    fn shell(&self, command: &str) -> Command {
        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG).arg(command).envs(&self.env);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn run_control_command(
        &self,
        label: &str,
        module: &str,
        pid: u32,
        command: &str,
    ) -> io::Result<()> {
        debug!("Running {label} command for '{module}': `{command}`");
        let mut child = self
            .shell(command)
            .env("SVCMOD_PID", pid.to_string())
            .env("SVCMOD_MODULE", module)
            .stdin(Stdio::null())
            .spawn()?;

        match wait_with_timeout(&mut child, CONTROL_COMMAND_TIMEOUT)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(io::Error::other(format!(
                "{label} command exited with {status}"
            ))),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{label} command timed out after {CONTROL_COMMAND_TIMEOUT:?}"),
                ))
            }
        }
    }
}

impl ServiceProcess for ShellService {
    fn spawn(&self, module: &str) -> io::Result<Child> {
        debug!("Launching '{module}': `{}`", self.command);
        let mut cmd = self.shell(&self.command);
        cmd.stdin(Stdio::null());
        // Keep terminal signals aimed at the supervisor away from the service.
        cmd.process_group(0);
        cmd.spawn()
    }

    fn stop(&self, module: &str, pid: u32) -> io::Result<()> {
        match &self.stop_command {
            Some(command) => self.run_control_command("stop", module, pid, command),
            None => {
                debug!("Sending {} to '{module}' (PID {pid})", self.stop_signal);
                send_signal(pid, self.stop_signal).map_err(errno_to_io)
            }
        }
    }

    fn reload(&self, module: &str, pid: u32) -> io::Result<()> {
        match &self.reload_command {
            Some(command) => self.run_control_command("reload", module, pid, command),
            None => {
                debug!("Sending {} to '{module}' (PID {pid})", self.reload_signal);
                send_signal(pid, self.reload_signal).map_err(errno_to_io)
            }
        }
    }
}

/// Waits for the launcher in the background so it never lingers as a zombie.
pub fn reap_in_background(module: &str, mut child: Child) {
    let module = module.to_string();
    let launcher_pid = child.id();
    let spawned = thread::Builder::new()
        .name(format!("reap-{launcher_pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => debug!("Launcher {launcher_pid} of '{module}' exited with {status}"),
            Err(err) => warn!("Failed to reap launcher {launcher_pid} of '{module}': {err}"),
        });
    if let Err(err) = spawned {
        warn!("Could not start reaper for launcher {launcher_pid}: {err}");
    }
}
