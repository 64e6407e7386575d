//! Process-wide filesystem notification service.
//!
//! One OS watcher serves every module. Directories are watched with reference
//! counts and each [`Subscription`] is woken when an entry with its file name
//! changes inside its directory. A subscription never fails to wait: when the
//! service is stopped or a directory cannot be watched, waits simply time out and
//! callers fall back to re-reading on their own schedule.
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    },
    thread,
    time::Duration,
};
use tracing::{debug, warn};

use crate::error::ModuleError;

struct Route {
    dir: PathBuf,
    file_name: OsString,
    sender: SyncSender<()>,
}

type Routes = Arc<Mutex<HashMap<u64, Route>>>;

#[derive(Default)]
struct WatchState {
    watcher: Option<RecommendedWatcher>,
    /// Number of live subscriptions per watched directory.
    dirs: HashMap<PathBuf, usize>,
}

struct Inner {
    // Never held while `routes` is locked; the notify callback only takes `routes`.
    state: Mutex<WatchState>,
    routes: Routes,
    next_id: AtomicU64,
}

/// Shared filesystem watch facility with an explicit start/stop lifecycle.
#[derive(Clone)]
pub struct FsWatchService {
    inner: Arc<Inner>,
}

impl Default for FsWatchService {
    fn default() -> Self {
        Self::new()
    }
}

impl FsWatchService {
    /// Creates a stopped service. Call [`start`](Self::start) before subscribing.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(WatchState::default()),
                routes: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Creates the OS watcher. Starting an already running service is a no-op.
    pub fn start(&self) -> Result<(), ModuleError> {
        let mut state = self.inner.state.lock()?;
        if state.watcher.is_some() {
            return Ok(());
        }

        let routes = Arc::clone(&self.inner.routes);
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                match result {
                    Ok(event) => dispatch(&routes, &event),
                    Err(err) => warn!("File watch backend reported an error: {err}"),
                }
            })?;

        // Re-arm directories of subscriptions taken while the service was stopped.
        for dir in state.dirs.keys() {
            if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!("Failed to watch {}: {err}", dir.display());
            }
        }

        state.watcher = Some(watcher);
        debug!("File watch service started");
        Ok(())
    }

    /// Drops the OS watcher. Existing subscriptions stay valid but stop receiving
    /// notifications until the service is started again.
    pub fn stop(&self) {
        match self.inner.state.lock() {
            Ok(mut state) => {
                if state.watcher.take().is_some() {
                    debug!("File watch service stopped");
                }
            }
            Err(err) => warn!("File watch state poisoned during stop: {err}"),
        }
    }

    /// Whether the OS watcher is active.
    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.watcher.is_some())
            .unwrap_or(false)
    }

    /// Subscribes to changes of `path`, watching its parent directory.
    pub fn subscribe(&self, path: &Path) -> Result<Subscription, ModuleError> {
        let (dir, file_name) = split_target(path);
        let (sender, receiver) = mpsc::sync_channel(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.inner.state.lock()?;
            let count = state.dirs.entry(dir.clone()).or_insert(0);
            *count += 1;
            let first = *count == 1;

            if first && let Some(watcher) = state.watcher.as_mut() {
                match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    Ok(()) => debug!("Watching directory {}", dir.display()),
                    Err(err) => warn!(
                        "Cannot watch {} ({err}); falling back to periodic re-reads",
                        dir.display()
                    ),
                }
            }
        }

        self.inner.routes.lock()?.insert(
            id,
            Route {
                dir: dir.clone(),
                file_name,
                sender,
            },
        );

        Ok(Subscription {
            id,
            dir,
            receiver,
            inner: Arc::clone(&self.inner),
        })
    }
}

fn split_target(path: &Path) -> (PathBuf, OsString) {
    let file_name = path.file_name().map(OsString::from).unwrap_or_default();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    // Backends report canonical paths (e.g. /private/tmp on macOS).
    let dir = dir.canonicalize().unwrap_or(dir);
    (dir, file_name)
}

fn dispatch(routes: &Routes, event: &Event) {
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }

    let Ok(routes) = routes.lock() else {
        return;
    };

    for route in routes.values() {
        let hit = event.paths.iter().any(|changed| {
            changed.file_name() == Some(route.file_name.as_os_str())
                && changed.parent().is_none_or(|parent| parent == route.dir)
        });
        // A full channel already holds a pending wake-up.
        if hit && let Err(TrySendError::Disconnected(())) = route.sender.try_send(()) {
            debug!("Dropped notification for closed subscription in {}", route.dir.display());
        }
    }
}

/// Per-path notification handle. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    dir: PathBuf,
    receiver: Receiver<()>,
    inner: Arc<Inner>,
}

impl Subscription {
    /// Blocks until the watched file changes or `timeout` elapses. Returns `true`
    /// when woken by a notification.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                false
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut routes) = self.inner.routes.lock() {
            routes.remove(&self.id);
        }

        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        let remaining = match state.dirs.get_mut(&self.dir) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.dirs.remove(&self.dir);
            if let Some(watcher) = state.watcher.as_mut()
                && let Err(err) = watcher.unwatch(&self.dir)
            {
                debug!("Failed to unwatch {}: {err}", self.dir.display());
            }
        }
    }
}
