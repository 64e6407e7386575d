#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    process::Command,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use svcmod::{
    fswatch::FsWatchService,
    module::{Module, ModuleBuilder, ModuleSettings},
    service::ShellService,
    status::ModuleStatus,
};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Shell command that writes its own pid after `delay` seconds and then keeps running.
pub fn pid_writer(pid_file: &Path, delay: &str) -> String {
    format!(
        "sleep {delay}; echo $$ > '{}'; exec sleep 60",
        pid_file.display()
    )
}

pub fn started_watch() -> FsWatchService {
    let watch = FsWatchService::new();
    watch.start().expect("failed to start watch service");
    watch
}

pub fn quick_settings() -> ModuleSettings {
    ModuleSettings {
        pid_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(5),
        reload_grace: Duration::from_millis(200),
        poll_interval: Duration::from_millis(100),
        ..ModuleSettings::default()
    }
}

pub fn shell_module(name: &str, pid_file: &Path, command: String) -> Module {
    ModuleBuilder::new(name, pid_file, Arc::new(ShellService::new(command)))
        .watch_service(started_watch())
        .settings(quick_settings())
        .build()
}

pub fn wait_for_status(module: &Module, expected: ModuleStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if module.status() == expected {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!(
        "Timed out waiting for '{}' to become {expected}, still {}",
        module.name(),
        module.status()
    );
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_file_value(path: &Path, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.trim() == expected
        {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for value '{}' in {:?}", expected, path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Alive and not a zombie, as seen by sysinfo.
pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for PID {} to exit", pid);
}

pub fn kill_hard(pid: u32) {
    Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .expect("failed to run kill");
}
