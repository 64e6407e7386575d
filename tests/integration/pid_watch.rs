#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use common::{pid_writer, quick_settings, shell_module, started_watch};
use svcmod::{
    error::ModuleErrorKind,
    fswatch::FsWatchService,
    module::{ModuleBuilder, ModuleSettings},
    pidfile::PidFileWatcher,
    process::is_pid_alive,
    service::ShellService,
    status::ModuleStatus,
};
use tempfile::tempdir;

#[test]
fn pid_written_late_is_still_confirmed() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("late.pid");
    let module = shell_module("late", &pid_file, pid_writer(&pid_file, "0.3"));

    let started = Instant::now();
    module.start().expect("start failed");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(module.status(), ModuleStatus::Running);

    module.stop().expect("stop failed");
}

#[test]
fn watcher_returns_pid_written_by_another_thread() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("external.pid");
    let watch = started_watch();

    let watcher = PidFileWatcher::new(&watch, &pid_file, Duration::from_secs(3))
        .expect("failed to subscribe");
    let writer_path = pid_file.clone();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        fs::write(&writer_path, "4242\n").unwrap();
    });

    assert_eq!(watcher.wait().expect("pid expected"), 4242);
    writer.join().unwrap();
}

#[test]
fn missing_pid_times_out_into_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("never.pid");
    let marker = temp.path().join("launcher.pid");
    let module = ModuleBuilder::new(
        "silent",
        &pid_file,
        Arc::new(ShellService::new(format!(
            "echo $$ > '{}'; exec sleep 60",
            marker.display()
        ))),
    )
    .watch_service(started_watch())
    .settings(ModuleSettings {
        pid_timeout: Duration::from_millis(600),
        ..quick_settings()
    })
    .build();

    let started = Instant::now();
    let err = module.start().expect_err("no pid was written");
    let elapsed = started.elapsed();
    assert_eq!(err.kind(), ModuleErrorKind::PidTimeout);
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(module.status(), ModuleStatus::Error);
    assert!(module.watched_pid().is_none());
    assert!(module.last_error().unwrap().contains("never.pid"));

    // The launcher that never produced a pid is not left behind.
    let launcher: u32 = fs::read_to_string(&marker).unwrap().trim().parse().unwrap();
    common::wait_for_process_exit(launcher);
}

#[test]
fn garbage_is_ignored_until_a_valid_pid_appears() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("noisy.pid");
    let command = format!(
        "echo starting > '{pid}'; sleep 0.2; printf '' > '{pid}'; sleep 0.2; echo $$ > '{pid}'; exec sleep 60",
        pid = pid_file.display()
    );
    let module = shell_module("noisy", &pid_file, command);

    module.start().expect("start failed");
    let pid = module.watched_pid().unwrap();
    assert!(is_pid_alive(pid));
    module.stop().expect("stop failed");
}

#[test]
fn unstarted_watch_service_falls_back_to_rereads() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("poll.pid");
    let watch = FsWatchService::new();
    assert!(!watch.is_running());

    let module = ModuleBuilder::new(
        "poll",
        &pid_file,
        Arc::new(ShellService::new(pid_writer(&pid_file, "0.3"))),
    )
    .watch_service(watch)
    .settings(quick_settings())
    .build();

    module.start().expect("start failed");
    assert_eq!(module.status(), ModuleStatus::Running);
    module.stop().expect("stop failed");
}

#[test]
fn modules_share_one_watch_service() {
    let temp = tempdir().expect("failed to create tempdir");
    let watch = started_watch();

    let modules: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let pid_file = temp.path().join(format!("{name}.pid"));
            ModuleBuilder::new(
                *name,
                &pid_file,
                Arc::new(ShellService::new(pid_writer(&pid_file, "0.2"))),
            )
            .watch_service(watch.clone())
            .settings(quick_settings())
            .build()
        })
        .collect();

    let handles: Vec<_> = modules
        .iter()
        .cloned()
        .map(|module| thread::spawn(move || module.start()))
        .collect();
    for handle in handles {
        handle.join().unwrap().expect("start failed");
    }

    let mut pids: Vec<_> = modules.iter().map(|m| m.watched_pid().unwrap()).collect();
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 3);

    for module in &modules {
        module.stop().expect("stop failed");
    }
}
