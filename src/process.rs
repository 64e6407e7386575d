//! Process liveness checks and the crash watchdog.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    io,
    process::{Child, ExitStatus},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread,
    time::{Duration, Instant},
};
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, trace, warn};

use crate::constants::PROCESS_EXIT_CHECK_INTERVAL;

/// Checks whether `pid` names a live process.
///
/// `kill(pid, 0)` decides existence: `ESRCH` is dead and `EPERM` is alive but owned by
/// someone else. An existing process that is a zombie has exited and is reported dead.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(err) => {
            warn!("Unexpected error probing PID {pid}: {err}; assuming alive");
            true
        }
    }
}

fn is_zombie(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match system.process(target) {
        Some(process) => matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        // Vanished between the two probes; the next kill(0) settles it.
        None => false,
    }
}

/// Sends `signal` to `pid`.
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
    signal::kill(Pid::from_raw(raw), signal)
}

/// Blocks until `pid` is gone or `timeout` elapses. Returns `true` if it exited.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(PROCESS_EXIT_CHECK_INTERVAL));
    }
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Periodic callback run by the watcher while the process stays alive.
pub struct HealthCheck {
    pub interval: Duration,
    pub check: Box<dyn FnMut() + Send>,
}

/// Background watchdog for a single pid.
///
/// The exit callback runs at most once, on the watcher thread. Disarming
/// (explicitly or by dropping) wakes the thread and suppresses the callback.
pub struct ProcessWatcher {
    pid: u32,
    armed: Arc<AtomicBool>,
    // Dropping the sender wakes the thread out of its poll sleep.
    _wake: Sender<()>,
}

impl ProcessWatcher {
    /// Starts watching `pid`, polling every `interval`. A pid that is already
    /// gone is reported right away.
    pub fn arm<F>(pid: u32, interval: Duration, on_exit: F) -> io::Result<Self>
    where
        F: FnOnce(u32) + Send + 'static,
    {
        Self::arm_with_health(pid, interval, on_exit, None)
    }

    pub fn arm_with_health<F>(
        pid: u32,
        interval: Duration,
        on_exit: F,
        mut health: Option<HealthCheck>,
    ) -> io::Result<Self>
    where
        F: FnOnce(u32) + Send + 'static,
    {
        let armed = Arc::new(AtomicBool::new(true));
        let (wake, woken) = mpsc::channel::<()>();
        let thread_armed = Arc::clone(&armed);

        thread::Builder::new()
            .name(format!("watch-{pid}"))
            .spawn(move || {
                let mut last_health = Instant::now();
                loop {
                    if !is_pid_alive(pid) {
                        if thread_armed.swap(false, Ordering::SeqCst) {
                            debug!("Watched process {pid} is gone");
                            on_exit(pid);
                        }
                        return;
                    }

                    if let Some(health) = health.as_mut()
                        && last_health.elapsed() >= health.interval
                    {
                        (health.check)();
                        last_health = Instant::now();
                    }

                    match woken.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            trace!("Watched process {pid} still alive");
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            debug!("Watcher for process {pid} disarmed");
                            return;
                        }
                    }

                    if !thread_armed.load(Ordering::SeqCst) {
                        return;
                    }
                }
            })?;

        Ok(Self {
            pid,
            armed,
            _wake: wake,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the exit callback can still fire.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Stops watching. The exit callback will not fire after this returns unless
    /// it had already started.
    pub fn disarm(self) {
        drop(self);
    }
}

impl Drop for ProcessWatcher {
    fn drop(&mut self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}
