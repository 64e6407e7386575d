use std::{
    collections::BTreeMap,
    io,
    sync::mpsc::{self, Receiver},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, load_config},
    error::{ConfigError, ModuleError},
    executor::{ModuleExecutor, Pending},
    fswatch::FsWatchService,
    module::{Module, ModuleSnapshot},
    status::{ModuleStatus, StatusChange},
};

/// Errors emitted while assembling or driving the supervised modules.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Unknown module: {0}")]
    UnknownModule(String),
}

/// Host-level owner of every configured module and the shared watch service.
pub struct Supervisor {
    watch: FsWatchService,
    executors: BTreeMap<String, ModuleExecutor>,
}

impl Supervisor {
    /// Loads the config at `config_path` and builds its modules.
    pub fn new(
        config_path: Option<&str>,
        module_filter: Option<&str>,
    ) -> Result<Self, SupervisorError> {
        let config = load_config(config_path)?;
        Self::from_config(&config, module_filter)
    }

    /// Builds one module and worker per configured module. With a filter only
    /// that module is built.
    pub fn from_config(
        config: &Config,
        module_filter: Option<&str>,
    ) -> Result<Self, SupervisorError> {
        if let Some(filter) = module_filter
            && !config.modules.contains_key(filter)
        {
            return Err(SupervisorError::UnknownModule(filter.to_string()));
        }

        let watch = FsWatchService::new();
        watch.start()?;

        let mut executors = BTreeMap::new();
        for (name, module_config) in &config.modules {
            if let Some(filter) = module_filter
                && name != filter
            {
                continue;
            }
            let module = Module::from_config(name, module_config, watch.clone())?;
            executors.insert(name.clone(), ModuleExecutor::new(module)?);
            debug!("Registered module '{name}'");
        }

        Ok(Self { watch, executors })
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.executors.get(name).map(ModuleExecutor::module)
    }

    pub fn executor(&self, name: &str) -> Result<&ModuleExecutor, SupervisorError> {
        self.executors
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownModule(name.to_string()))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.executors.values().map(ModuleExecutor::module)
    }

    pub fn snapshots(&self) -> Vec<ModuleSnapshot> {
        self.modules().map(Module::snapshot).collect()
    }

    /// One channel carrying the status transitions of every module.
    pub fn status_events(&self) -> Receiver<StatusChange> {
        let (tx, rx) = mpsc::channel();
        for module in self.modules() {
            module.add_listener(tx.clone());
        }
        rx
    }

    /// Verifies and fixes rights on every module, then starts the auto-run
    /// modules that are stopped or had their rights fixed. Every start runs on the
    /// module's worker. Returns the modules that failed to start.
    pub fn start(&self) -> Vec<(String, ModuleError)> {
        let mut failures = Vec::new();
        let mut pending: Vec<(String, Pending)> = Vec::new();

        for (name, executor) in &self.executors {
            let module = executor.module();
            let fixed = module.check_fix_rights_for_run();
            let status = module.status();
            let wanted = fixed || (module.settings().auto_run && status == ModuleStatus::Stopped);
            if !wanted || !status.can_start() {
                continue;
            }
            match executor.start() {
                Ok(started) => pending.push((name.clone(), started)),
                Err(err) => {
                    warn!("Could not queue start of '{name}': {err}");
                    failures.push((name.clone(), err));
                }
            }
        }

        for (name, pending) in pending {
            match pending.wait() {
                Ok(()) => info!("Module '{name}' started"),
                Err(err) => {
                    error!("Module '{name}' failed to start: {err}");
                    failures.push((name, err));
                }
            }
        }
        failures
    }

    /// Stops every running module, then releases workers and the watch service.
    pub fn shutdown(self) {
        info!("Shutting down {} module(s)", self.executors.len());

        let pending: Vec<(String, Pending)> = self
            .executors
            .iter()
            .filter(|(name, executor)| {
                let status = executor.module().status();
                if status.is_transitional() {
                    warn!("Module '{name}' is still {status}; leaving it to finish");
                }
                status == ModuleStatus::Running
            })
            .filter_map(|(name, executor)| match executor.stop() {
                Ok(pending) => Some((name.clone(), pending)),
                Err(err) => {
                    warn!("Could not queue stop of '{name}': {err}");
                    None
                }
            })
            .collect();

        for (name, pending) in pending {
            if let Err(err) = pending.wait() {
                error!("Failed to stop '{name}': {err}");
            }
        }

        for (_, executor) in self.executors {
            executor.shutdown();
        }
        self.watch.stop();
    }
}
