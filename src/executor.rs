//! Runs a module's blocking operations on a dedicated worker thread.
//!
//! `submit` claims the module on the caller's thread, so a conflicting request is
//! rejected before anything is queued. The returned [`Pending`] resolves once the
//! worker has run the operation.
use std::{
    io,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, warn};

use crate::error::ModuleError;
use crate::module::{Module, Operation, OperationGuard};

struct Job {
    guard: OperationGuard,
    reply: Sender<Result<(), ModuleError>>,
}

/// Handle to an operation queued on a [`ModuleExecutor`].
pub struct Pending {
    module: String,
    operation: Operation,
    receiver: Receiver<Result<(), ModuleError>>,
}

impl Pending {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Blocks until the operation finishes.
    pub fn wait(self) -> Result<(), ModuleError> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(ModuleError::WorkerGone(self.module.clone())))
    }

    /// Waits up to `timeout`; `None` means the operation is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ModuleError>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err(ModuleError::WorkerGone(self.module.clone())))
            }
        }
    }
}

/// Single-worker queue owning one module's lifecycle operations.
pub struct ModuleExecutor {
    module: Module,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl ModuleExecutor {
    pub fn new(module: Module) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let name = module.name().to_string();
        let worker = thread::Builder::new()
            .name(format!("module-{name}"))
            .spawn(move || {
                for job in receiver {
                    let operation = job.guard.operation();
                    debug!("Running {} for '{name}'", operation.name());
                    let result = job.guard.run();
                    if job.reply.send(result).is_err() {
                        debug!("Result of {} for '{name}' was not awaited", operation.name());
                    }
                }
                debug!("Worker for '{name}' exiting");
            })?;

        Ok(Self {
            module,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Queues `operation`. Fails immediately when the module is busy or its
    /// status does not allow the operation.
    pub fn submit(&self, operation: Operation) -> Result<Pending, ModuleError> {
        let guard = self.module.begin(operation)?;
        let (reply, receiver) = mpsc::channel();
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ModuleError::WorkerGone(self.module.name().to_string()))?;
        sender
            .send(Job { guard, reply })
            .map_err(|_| ModuleError::WorkerGone(self.module.name().to_string()))?;

        Ok(Pending {
            module: self.module.name().to_string(),
            operation,
            receiver,
        })
    }

    pub fn start(&self) -> Result<Pending, ModuleError> {
        self.submit(Operation::Start)
    }

    pub fn stop(&self) -> Result<Pending, ModuleError> {
        self.submit(Operation::Stop)
    }

    pub fn reload(&self) -> Result<Pending, ModuleError> {
        self.submit(Operation::Reload)
    }

    pub fn run_start_tests(&self) -> Result<Pending, ModuleError> {
        self.submit(Operation::RunStartTests)
    }

    /// Lets queued work finish, then joins the worker.
    pub fn shutdown(mut self) {
        self.join_worker();
    }

    fn join_worker(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Worker for '{}' panicked", self.module.name());
        }
    }
}

impl Drop for ModuleExecutor {
    fn drop(&mut self) {
        self.join_worker();
    }
}
