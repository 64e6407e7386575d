//! Pid file handshake with a freshly spawned service.
//!
//! The service writes its own pid as a single decimal number (surrounding
//! whitespace allowed). [`PidFileWatcher`] waits for that write using the shared
//! [`FsWatchService`] and re-reads the file on every notification, treating an
//! unparsable read as a write still in progress.
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::constants::PID_FILE_RECHECK_INTERVAL;
use crate::error::ModuleError;
use crate::fswatch::{FsWatchService, Subscription};

/// The pid file did not hold a valid pid before the deadline.
#[derive(Debug, Error)]
#[error("no valid pid in {} after {waited:?}", path.display())]
pub struct PidWaitTimeout {
    pub path: PathBuf,
    pub waited: Duration,
}

/// Parses pid file contents. Rejects zero and values outside the `pid_t` range.
pub fn parse_pid(contents: &str) -> Option<u32> {
    let pid: u32 = contents.trim().parse().ok()?;
    (pid > 0 && pid <= i32::MAX as u32).then_some(pid)
}

/// Reads a pid file. A missing or unparsable file yields `Ok(None)`.
pub fn read_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(parse_pid(&contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Removes the pid file if it still names `pid`. Returns whether it was removed.
pub fn remove_if_matches(path: &Path, pid: u32) -> io::Result<bool> {
    if read_pid(path)? == Some(pid) {
        fs::remove_file(path)?;
        return Ok(true);
    }
    Ok(false)
}

/// One wait for a pid file to be written. Subscribes on creation, so create it
/// before spawning the process that writes the file.
pub struct PidFileWatcher {
    path: PathBuf,
    timeout: Duration,
    subscription: Subscription,
}

impl PidFileWatcher {
    pub fn new(
        watch: &FsWatchService,
        path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, ModuleError> {
        let path = path.into();
        let subscription = watch.subscribe(&path)?;
        Ok(Self {
            path,
            timeout,
            subscription,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the file holds a valid pid or the timeout elapses.
    ///
    /// A file that is already valid when this is called is returned immediately.
    pub fn wait(self) -> Result<u32, PidWaitTimeout> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        loop {
            match read_pid(&self.path) {
                Ok(Some(pid)) => {
                    debug!(
                        "Pid file {} confirmed PID {pid} after {:?}",
                        self.path.display(),
                        started.elapsed()
                    );
                    return Ok(pid);
                }
                Ok(None) => trace!("Pid file {} not ready yet", self.path.display()),
                Err(err) => warn!("Failed to read pid file {}: {err}", self.path.display()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PidWaitTimeout {
                    path: self.path,
                    waited: self.timeout,
                });
            }

            let slice = (deadline - now).min(PID_FILE_RECHECK_INTERVAL);
            self.subscription.wait(slice);
        }
    }
}
