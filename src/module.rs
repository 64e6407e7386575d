//! The per-service supervisor state machine.
//!
//! A [`Module`] owns one service process at a time. Its operations (`start`,
//! `stop`, `reload`, `run_start_tests`) block for as long as the service takes
//! to settle, so hosts run them on a [`ModuleExecutor`](crate::executor::ModuleExecutor)
//! rather than on their primary thread. Only one operation may own a module at
//! a time; a second request fails fast with `InvalidStateTransition`.
//!
//! `status` and the watched pid live behind one mutex and are changed together,
//! so `watched_pid.is_some() == (status == Running)` holds for every observer.
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    process::Child,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::config::ModuleConfig;
use crate::constants::{
    DEFAULT_PID_TIMEOUT, DEFAULT_RELOAD_GRACE, DEFAULT_START_TEST_TIMEOUT,
    DEFAULT_STOP_TIMEOUT, KILL_GRACE_PERIOD, PROCESS_POLL_INTERVAL,
};
use crate::error::{ConfigError, ModuleError};
use crate::fswatch::FsWatchService;
use crate::pidfile::{PidFileWatcher, read_pid, remove_if_matches};
use crate::process::{HealthCheck, ProcessWatcher, is_pid_alive, wait_for_exit};
use crate::rights::{RightsChecker, RightsRequirement};
use crate::service::{ServiceProcess, ShellService, reap_in_background};
use crate::start_test::{ProbeOutcome, StartTest, StartTestRunner, probe_from_config};
use crate::status::{ModuleStatus, StatusChange};

/// Serialized lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Reload,
    RunStartTests,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Reload => "reload",
            Operation::RunStartTests => "run start tests",
        }
    }

    fn allowed_from(self, status: ModuleStatus) -> bool {
        match self {
            Operation::Start => status.can_start(),
            Operation::Stop | Operation::Reload | Operation::RunStartTests => {
                status == ModuleStatus::Running
            }
        }
    }
}

/// Timing and policy knobs of a module.
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub pid_timeout: Duration,
    pub stop_timeout: Duration,
    pub reload_grace: Duration,
    pub poll_interval: Duration,
    pub kill_on_timeout: bool,
    pub auto_run: bool,
    pub health_interval: Option<Duration>,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            pid_timeout: DEFAULT_PID_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            reload_grace: DEFAULT_RELOAD_GRACE,
            poll_interval: PROCESS_POLL_INTERVAL,
            kill_on_timeout: false,
            auto_run: false,
            health_interval: None,
        }
    }
}

/// What a rights check-and-fix pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RightsFixOutcome {
    /// The module declares no rights requirements.
    NothingToCheck,
    AlreadyCorrect,
    Fixed(Vec<PathBuf>),
}

/// Point-in-time view of a module, for display.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    pub name: String,
    pub status: ModuleStatus,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct ModuleState {
    status: ModuleStatus,
    watched_pid: Option<u32>,
    watcher: Option<ProcessWatcher>,
    last_error: Option<String>,
}

struct ModuleInner {
    name: String,
    service: Arc<dyn ServiceProcess>,
    watch: FsWatchService,
    settings: ModuleSettings,
    rights: RightsChecker,
    start_test: Option<Arc<dyn StartTest>>,
    start_test_timeout: Duration,
    pid_file: RwLock<PathBuf>,
    should_run_start_tests: AtomicBool,
    busy: AtomicBool,
    state: Mutex<ModuleState>,
    listeners: Mutex<Vec<Sender<StatusChange>>>,
}

/// Builder for [`Module`].
pub struct ModuleBuilder {
    name: String,
    pid_file: PathBuf,
    service: Arc<dyn ServiceProcess>,
    watch: Option<FsWatchService>,
    settings: ModuleSettings,
    rights: Vec<RightsRequirement>,
    start_test: Option<Arc<dyn StartTest>>,
    start_test_timeout: Duration,
    run_start_tests: Option<bool>,
}

impl ModuleBuilder {
    pub fn new(
        name: impl Into<String>,
        pid_file: impl Into<PathBuf>,
        service: Arc<dyn ServiceProcess>,
    ) -> Self {
        Self {
            name: name.into(),
            pid_file: pid_file.into(),
            service,
            watch: None,
            settings: ModuleSettings::default(),
            rights: Vec::new(),
            start_test: None,
            start_test_timeout: DEFAULT_START_TEST_TIMEOUT,
            run_start_tests: None,
        }
    }

    /// Shares a process-wide watch service. Without one the module waits on a
    /// private, never-started service and falls back to periodic re-reads.
    pub fn watch_service(mut self, watch: FsWatchService) -> Self {
        self.watch = Some(watch);
        self
    }

    pub fn settings(mut self, settings: ModuleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn rights(mut self, rights: Vec<RightsRequirement>) -> Self {
        self.rights = rights;
        self
    }

    /// Installs a start test. Start tests run during `start` unless disabled
    /// with [`run_start_tests`](Self::run_start_tests).
    pub fn start_test(mut self, test: Arc<dyn StartTest>, timeout: Duration) -> Self {
        self.start_test = Some(test);
        self.start_test_timeout = timeout;
        self
    }

    pub fn run_start_tests(mut self, enabled: bool) -> Self {
        self.run_start_tests = Some(enabled);
        self
    }

    pub fn build(self) -> Module {
        let run_start_tests = self.run_start_tests.unwrap_or(self.start_test.is_some());
        let rights = RightsChecker::new(self.name.clone(), self.rights);
        Module {
            inner: Arc::new(ModuleInner {
                name: self.name,
                service: self.service,
                watch: self.watch.unwrap_or_default(),
                settings: self.settings,
                rights,
                start_test: self.start_test,
                start_test_timeout: self.start_test_timeout,
                pid_file: RwLock::new(self.pid_file),
                should_run_start_tests: AtomicBool::new(run_start_tests),
                busy: AtomicBool::new(false),
                state: Mutex::new(ModuleState::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Exclusive right to run one operation against a module. Released on drop.
pub struct OperationGuard {
    module: Module,
    operation: Operation,
}

impl OperationGuard {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Runs the operation this guard was issued for.
    pub fn run(self) -> Result<(), ModuleError> {
        let module = self.module.clone();
        let operation = self.operation;
        match operation {
            Operation::Start => module.run_start(self),
            Operation::Stop => module.run_stop(self),
            Operation::Reload => module.run_reload(self),
            Operation::RunStartTests => module.run_start_tests_guarded(self),
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.module.inner.busy.store(false, Ordering::SeqCst);
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One supervised service. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    /// Builds a module that launches `config.command` through the shell.
    pub fn from_config(
        name: &str,
        config: &ModuleConfig,
        watch: FsWatchService,
    ) -> Result<Self, ConfigError> {
        let settings = ModuleSettings {
            pid_timeout: config.pid_timeout()?,
            stop_timeout: config.stop_timeout()?,
            reload_grace: config.reload_grace()?,
            poll_interval: PROCESS_POLL_INTERVAL,
            kill_on_timeout: config.kill_on_timeout.unwrap_or(false),
            auto_run: config.auto_run.unwrap_or(false),
            health_interval: config.health_interval()?,
        };

        let rights = config
            .rights
            .iter()
            .flatten()
            .map(RightsRequirement::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let service = Arc::new(ShellService::from_config(config)?);
        let mut builder = ModuleBuilder::new(name, &config.pid_file, service)
            .watch_service(watch)
            .settings(settings)
            .rights(rights);

        if let Some(test) = &config.start_test {
            builder = builder.start_test(probe_from_config(test)?, test.timeout()?);
        }
        if let Some(enabled) = config.run_start_tests {
            builder = builder.run_start_tests(enabled);
        }

        Ok(builder.build())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pid_file(&self) -> PathBuf {
        match self.inner.pid_file.read() {
            Ok(path) => path.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Changes the pid file. An operation already in flight keeps the old path.
    pub fn set_pid_file(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        match self.inner.pid_file.write() {
            Ok(mut guard) => *guard = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }

    pub fn should_run_start_tests(&self) -> bool {
        self.inner.should_run_start_tests.load(Ordering::SeqCst)
    }

    pub fn set_should_run_start_tests(&self, should: bool) {
        self.inner
            .should_run_start_tests
            .store(should, Ordering::SeqCst);
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.inner.settings
    }

    pub fn rights_checker(&self) -> &RightsChecker {
        &self.inner.rights
    }

    pub fn status(&self) -> ModuleStatus {
        self.lock_state().status
    }

    /// The pid being watched; set exactly while the status is `Running`.
    pub fn watched_pid(&self) -> Option<u32> {
        self.lock_state().watched_pid
    }

    /// Detail of the most recent failure, including crashes.
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    /// Whether an operation currently owns the module.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ModuleSnapshot {
        let state = self.lock_state();
        ModuleSnapshot {
            name: self.inner.name.clone(),
            status: state.status,
            pid: state.watched_pid,
            pid_file: self.pid_file(),
            last_error: state.last_error.clone(),
        }
    }

    /// Returns a channel that receives every status transition from now on.
    pub fn subscribe(&self) -> Receiver<StatusChange> {
        let (tx, rx) = mpsc::channel();
        self.add_listener(tx);
        rx
    }

    /// Adds a listener sender, letting several modules feed one channel.
    pub fn add_listener(&self, listener: Sender<StatusChange>) {
        match self.inner.listeners.lock() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// External override. Only `Stopped` and `Error` can be forced; forcing
    /// either one stops watching the current process without signalling it.
    /// Setting `Running` on a running module is a no-op.
    pub fn set_status(&self, status: ModuleStatus) -> Result<(), ModuleError> {
        let _busy = self.acquire("override status")?;
        let mut state = self.lock_state();
        match status {
            ModuleStatus::Stopped | ModuleStatus::Error => {
                if let Some(watcher) = state.watcher.take() {
                    watcher.disarm();
                }
                info!("Status of '{}' overridden to {status}", self.inner.name);
                self.transition(&mut state, status, None);
                Ok(())
            }
            ModuleStatus::Running if state.status == ModuleStatus::Running => Ok(()),
            _ => Err(ModuleError::InvalidStateTransition {
                module: self.inner.name.clone(),
                operation: "override status",
                status: state.status,
            }),
        }
    }

    /// Claims the module for `operation`, failing fast when another operation
    /// owns it or the current status does not allow `operation`.
    pub fn begin(&self, operation: Operation) -> Result<OperationGuard, ModuleError> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.invalid(operation.name()));
        }
        let guard = OperationGuard {
            module: self.clone(),
            operation,
        };

        let status = self.status();
        if !operation.allowed_from(status) {
            drop(guard);
            return Err(ModuleError::InvalidStateTransition {
                module: self.inner.name.clone(),
                operation: operation.name(),
                status,
            });
        }
        Ok(guard)
    }

    /// Launches the service and waits until it is confirmed running.
    pub fn start(&self) -> Result<(), ModuleError> {
        self.begin(Operation::Start)?.run()
    }

    /// Stops the service and waits until it has exited.
    pub fn stop(&self) -> Result<(), ModuleError> {
        self.begin(Operation::Stop)?.run()
    }

    /// Asks the service to reload and re-validates its pid afterwards.
    pub fn reload(&self) -> Result<(), ModuleError> {
        self.begin(Operation::Reload)?.run()
    }

    /// Runs the start test against the running process without changing status.
    pub fn run_start_tests(&self) -> Result<(), ModuleError> {
        self.begin(Operation::RunStartTests)?.run()
    }

    /// Checks the module's filesystem rights and corrects them when wrong.
    pub fn check_fix_rights(&self) -> Result<RightsFixOutcome, ModuleError> {
        let rights = &self.inner.rights;
        if rights.is_empty() {
            return Ok(RightsFixOutcome::NothingToCheck);
        }

        let report = rights.check()?;
        if report.is_correct() {
            debug!("Rights for '{}' are correct", self.inner.name);
            return Ok(RightsFixOutcome::AlreadyCorrect);
        }

        warn!(
            "Rights for '{}' are wrong: {}",
            self.inner.name,
            report.describe_wrong()
        );
        rights.fix(&report).map(RightsFixOutcome::Fixed)
    }

    /// Verifies and fixes rights, then starts the module if a fix was needed and
    /// the module is configured to auto-run. Failures are logged and recorded in
    /// [`last_error`](Self::last_error).
    pub fn check_fix_rights_and_run_if_needed(&self) {
        if self.check_fix_rights_for_run()
            && let Err(err) = self.start()
        {
            error!("Failed to start '{}' after fixing rights: {err}", self.inner.name);
        }
    }

    /// The rights half of
    /// [`check_fix_rights_and_run_if_needed`](Self::check_fix_rights_and_run_if_needed).
    /// Returns `true` when a fix was applied and the module should now be started,
    /// leaving the start to the caller.
    pub fn check_fix_rights_for_run(&self) -> bool {
        match self.check_fix_rights() {
            Ok(RightsFixOutcome::Fixed(paths)) => {
                info!(
                    "Corrected rights on {} path(s) for '{}'",
                    paths.len(),
                    self.inner.name
                );
                if !self.inner.settings.auto_run {
                    debug!("'{}' is not configured to auto-run", self.inner.name);
                }
                self.inner.settings.auto_run
            }
            Ok(_) => false,
            Err(err) => {
                error!("{err}");
                self.lock_state().last_error = Some(err.to_string());
                false
            }
        }
    }

    fn run_start(&self, _guard: OperationGuard) -> Result<(), ModuleError> {
        let name = &self.inner.name;
        info!("Starting module: {name}");
        self.set_transitional(ModuleStatus::Starting);

        let pid = match self.launch() {
            Ok(pid) => pid,
            Err(err) => {
                error!("Failed to start '{name}': {err}");
                self.fail(&err);
                return Err(err);
            }
        };

        let mut state = self.lock_state();
        match self.arm_watcher(pid) {
            Ok(watcher) => {
                state.watcher = Some(watcher);
                state.last_error = None;
                self.transition(&mut state, ModuleStatus::Running, Some(pid));
                info!("Module '{name}' is running with PID {pid}");
                Ok(())
            }
            Err(source) => {
                let err = ModuleError::SpawnFailed {
                    module: name.clone(),
                    source: io::Error::other(format!("cannot watch PID {pid}: {source}")),
                };
                state.last_error = Some(err.to_string());
                self.transition(&mut state, ModuleStatus::Error, None);
                Err(err)
            }
        }
    }

    /// Everything `start` does between `Starting` and `Running`.
    fn launch(&self) -> Result<u32, ModuleError> {
        let name = &self.inner.name;

        if !self.inner.rights.is_empty() {
            let report = self.inner.rights.check()?;
            if !report.is_correct() {
                return Err(ModuleError::RightsCheckFailed {
                    module: name.clone(),
                    detail: report.describe_wrong(),
                });
            }
        }

        let pid_file = self.pid_file();
        if let Some(pid) = live_pid_in(name, &pid_file) {
            // Never launch a second copy next to a live one.
            info!("Module '{name}' already runs as PID {pid}; adopting it");
            self.confirm(pid)?;
            return Ok(pid);
        }

        // Subscribe before spawning so an early write is not missed.
        let pid_watcher = PidFileWatcher::new(
            &self.inner.watch,
            &pid_file,
            self.inner.settings.pid_timeout,
        )?;

        let mut launcher = self.inner.service.spawn(name).map_err(|source| {
            ModuleError::SpawnFailed {
                module: name.clone(),
                source,
            }
        })?;
        debug!("Launcher for '{name}' has PID {}", launcher.id());

        let pid = match pid_watcher.wait() {
            Ok(pid) => {
                reap_in_background(name, launcher);
                pid
            }
            Err(timeout) => {
                abandon_launcher(name, &mut launcher);
                return Err(ModuleError::PidTimeout {
                    module: name.clone(),
                    path: timeout.path.display().to_string(),
                    timeout: timeout.waited,
                });
            }
        };

        self.confirm(pid)?;
        Ok(pid)
    }

    /// Runs the start test on a confirmed pid, terminating it on failure.
    fn confirm(&self, pid: u32) -> Result<(), ModuleError> {
        if self.should_run_start_tests()
            && let Err(err) = self.probe(pid)
        {
            self.terminate_quietly(pid);
            return Err(err);
        }
        Ok(())
    }

    fn run_stop(&self, _guard: OperationGuard) -> Result<(), ModuleError> {
        let name = &self.inner.name;
        let pid = self.take_watched_pid(ModuleStatus::Stopping)?;
        info!("Stopping module '{name}' (PID {pid})");

        if let Err(source) = self.inner.service.stop(name, pid) {
            if source.raw_os_error() == Some(libc::ESRCH) || !is_pid_alive(pid) {
                debug!("Module '{name}' exited before it could be signalled");
                self.finish_stopped(pid);
                return Ok(());
            }
            let err = ModuleError::SignalFailed {
                module: name.clone(),
                pid,
                source,
            };
            error!("{err}");
            self.fail(&err);
            return Err(err);
        }

        let timeout = self.inner.settings.stop_timeout;
        if wait_for_exit(pid, timeout) {
            self.finish_stopped(pid);
            return Ok(());
        }

        if self.inner.settings.kill_on_timeout {
            warn!("Module '{name}' did not exit within {timeout:?}; sending SIGKILL");
            match self.inner.service.kill(name, pid) {
                Ok(()) => {
                    if wait_for_exit(pid, KILL_GRACE_PERIOD) {
                        self.finish_stopped(pid);
                        return Ok(());
                    }
                }
                Err(err) => warn!("Failed to SIGKILL '{name}' (PID {pid}): {err}"),
            }
        }

        let err = ModuleError::StopTimeout {
            module: name.clone(),
            pid,
            timeout,
        };
        error!("{err}");
        self.fail(&err);
        Err(err)
    }

    fn run_reload(&self, _guard: OperationGuard) -> Result<(), ModuleError> {
        let name = &self.inner.name;
        let pid = self.take_watched_pid(ModuleStatus::Reloading)?;
        info!("Reloading module '{name}' (PID {pid})");

        let signalled = self.inner.service.reload(name, pid);
        if signalled.is_ok() {
            thread::sleep(self.inner.settings.reload_grace);
        }

        // Some services re-exec on reload and write a new pid.
        let pid_file = self.pid_file();
        let current = match read_pid(&pid_file) {
            Ok(Some(new_pid)) if new_pid != pid && is_pid_alive(new_pid) => {
                info!("Module '{name}' now runs as PID {new_pid} after reload");
                new_pid
            }
            _ => pid,
        };

        let signal_error = signalled.err().map(|source| ModuleError::SignalFailed {
            module: name.clone(),
            pid,
            source,
        });

        if !is_pid_alive(current) {
            let err = signal_error.unwrap_or_else(|| ModuleError::SignalFailed {
                module: name.clone(),
                pid,
                source: io::Error::other("process exited while reloading"),
            });
            error!("{err}");
            self.fail(&err);
            return Err(err);
        }

        let mut state = self.lock_state();
        match self.arm_watcher(current) {
            Ok(watcher) => state.watcher = Some(watcher),
            Err(err) => {
                let err = ModuleError::SpawnFailed {
                    module: name.clone(),
                    source: io::Error::other(format!("cannot watch PID {current}: {err}")),
                };
                state.last_error = Some(err.to_string());
                self.transition(&mut state, ModuleStatus::Error, None);
                return Err(err);
            }
        }
        self.transition(&mut state, ModuleStatus::Running, Some(current));

        match signal_error {
            Some(err) => {
                warn!("Reload of '{name}' failed but the process is still running: {err}");
                state.last_error = Some(err.to_string());
                Err(err)
            }
            None => {
                info!("Module '{name}' reloaded");
                Ok(())
            }
        }
    }

    fn run_start_tests_guarded(&self, _guard: OperationGuard) -> Result<(), ModuleError> {
        let pid = self
            .watched_pid()
            .ok_or_else(|| self.invalid(Operation::RunStartTests.name()))?;
        self.probe(pid)
    }

    fn probe(&self, pid: u32) -> Result<(), ModuleError> {
        let Some(test) = &self.inner.start_test else {
            debug!("No start test configured for '{}'", self.inner.name);
            return Ok(());
        };

        let runner = StartTestRunner::new(self.inner.start_test_timeout);
        match runner.run(Arc::clone(test), &self.inner.name, pid) {
            ProbeOutcome::Passed => {
                debug!("Start test passed for '{}'", self.inner.name);
                Ok(())
            }
            ProbeOutcome::Failed(detail) => Err(ModuleError::StartTestFailed {
                module: self.inner.name.clone(),
                detail,
            }),
        }
    }

    /// Best-effort cleanup of a process that will not be supervised.
    fn terminate_quietly(&self, pid: u32) {
        let name = &self.inner.name;
        if let Err(err) = self.inner.service.stop(name, pid) {
            debug!("Could not stop rejected process {pid} of '{name}': {err}");
            return;
        }
        if !wait_for_exit(pid, self.inner.settings.stop_timeout) {
            warn!("Rejected process {pid} of '{name}' is still running");
        }
    }

    fn arm_watcher(&self, pid: u32) -> io::Result<ProcessWatcher> {
        let weak = Arc::downgrade(&self.inner);
        let on_exit = move |dead: u32| {
            if let Some(inner) = weak.upgrade() {
                Module { inner }.handle_process_exit(dead);
            }
        };
        ProcessWatcher::arm_with_health(
            pid,
            self.inner.settings.poll_interval,
            on_exit,
            self.health_check(pid),
        )
    }

    fn health_check(&self, pid: u32) -> Option<HealthCheck> {
        let interval = self.inner.settings.health_interval?;
        let test = Arc::clone(self.inner.start_test.as_ref()?);
        let runner = StartTestRunner::new(self.inner.start_test_timeout);
        let name = self.inner.name.clone();
        Some(HealthCheck {
            interval,
            check: Box::new(move || {
                if let ProbeOutcome::Failed(reason) = runner.run(Arc::clone(&test), &name, pid) {
                    warn!("Health check for '{name}' (PID {pid}) failed: {reason}");
                }
            }),
        })
    }

    /// Watcher callback. Only a death while `Running` on the watched pid is a crash;
    /// anything else was caused by an operation that already disarmed the watcher.
    fn handle_process_exit(&self, pid: u32) {
        let mut state = self.lock_state();
        if state.status != ModuleStatus::Running || state.watched_pid != Some(pid) {
            debug!(
                "Ignoring exit of PID {pid} for '{}' while {}",
                self.inner.name, state.status
            );
            return;
        }

        error!(
            "Module '{}' (PID {pid}) exited unexpectedly",
            self.inner.name
        );
        state.watcher = None;
        state.last_error = Some(format!("process {pid} exited unexpectedly"));
        self.transition(&mut state, ModuleStatus::Error, None);
    }

    /// Moves from `Running` to `to`, disarming the watcher first so the death the
    /// caller is about to cause is not reported as a crash.
    fn take_watched_pid(&self, to: ModuleStatus) -> Result<u32, ModuleError> {
        let mut state = self.lock_state();
        let Some(pid) = state.watched_pid else {
            return Err(ModuleError::InvalidStateTransition {
                module: self.inner.name.clone(),
                operation: if to == ModuleStatus::Stopping { "stop" } else { "reload" },
                status: state.status,
            });
        };
        if let Some(watcher) = state.watcher.take() {
            watcher.disarm();
        }
        self.transition(&mut state, to, None);
        Ok(pid)
    }

    fn finish_stopped(&self, pid: u32) {
        let pid_file = self.pid_file();
        match remove_if_matches(&pid_file, pid) {
            Ok(true) => debug!("Removed pid file {}", pid_file.display()),
            Ok(false) => {}
            Err(err) => warn!("Failed to remove pid file {}: {err}", pid_file.display()),
        }
        let mut state = self.lock_state();
        self.transition(&mut state, ModuleStatus::Stopped, None);
        info!("Module '{}' stopped", self.inner.name);
    }

    fn set_transitional(&self, to: ModuleStatus) {
        let mut state = self.lock_state();
        self.transition(&mut state, to, None);
    }

    fn fail(&self, err: &ModuleError) {
        let mut state = self.lock_state();
        state.last_error = Some(err.to_string());
        self.transition(&mut state, ModuleStatus::Error, None);
    }

    fn transition(&self, state: &mut ModuleState, to: ModuleStatus, pid: Option<u32>) {
        let from = state.status;
        state.status = to;
        state.watched_pid = if to == ModuleStatus::Running { pid } else { None };
        debug_assert_eq!(state.watched_pid.is_some(), to == ModuleStatus::Running);

        if from == to && pid.is_none() {
            return;
        }
        debug!("Module '{}': {from} -> {to}", self.inner.name);

        let change = StatusChange {
            module: self.inner.name.clone(),
            from,
            to,
            pid: state.watched_pid,
        };
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.retain(|listener| listener.send(change.clone()).is_ok());
        }
    }

    fn acquire(&self, operation: &'static str) -> Result<BusyGuard<'_>, ModuleError> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| BusyGuard(&self.inner.busy))
            .map_err(|_| self.invalid(operation))
    }

    fn invalid(&self, operation: &'static str) -> ModuleError {
        ModuleError::InvalidStateTransition {
            module: self.inner.name.clone(),
            operation,
            status: self.status(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ModuleState> {
        // State is only mutated in short critical sections that cannot panic midway.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns the pid file's pid when that process is still alive. A pid file
/// naming a dead process is removed so it cannot confirm a new launch.
fn live_pid_in(name: &str, pid_file: &Path) -> Option<u32> {
    match read_pid(pid_file) {
        Ok(Some(pid)) if is_pid_alive(pid) => Some(pid),
        Ok(Some(pid)) => {
            match remove_if_matches(pid_file, pid) {
                Ok(_) => debug!("Removed stale pid file {} (PID {pid})", pid_file.display()),
                Err(err) => warn!(
                    "Failed to remove stale pid file {} for '{name}': {err}",
                    pid_file.display()
                ),
            }
            None
        }
        Ok(None) => None,
        Err(err) => {
            warn!("Cannot read pid file {}: {err}", pid_file.display());
            None
        }
    }
}

/// Kills a launcher that never produced a pid and reaps it.
fn abandon_launcher(name: &str, launcher: &mut Child) {
    match launcher.try_wait() {
        Ok(Some(status)) => debug!("Launcher of '{name}' had already exited with {status}"),
        Ok(None) => {
            warn!("Killing launcher {} of '{name}' after pid timeout", launcher.id());
            let _ = launcher.kill();
            let _ = launcher.wait();
        }
        Err(err) => warn!("Failed to query launcher of '{name}': {err}"),
    }
}
