#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{
    kill_hard, pid_writer, quick_settings, shell_module, started_watch, wait_for_process_exit,
    wait_for_status,
};
use svcmod::{
    error::ModuleErrorKind,
    module::{ModuleBuilder, ModuleSettings},
    pidfile::read_pid,
    process::is_pid_alive,
    service::ShellService,
    status::ModuleStatus,
};
use tempfile::tempdir;

#[test]
fn external_kill_moves_running_module_to_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("victim.pid");
    let module = shell_module("victim", &pid_file, pid_writer(&pid_file, "0"));
    let events = module.subscribe();

    module.start().expect("start failed");
    let pid = module.watched_pid().unwrap();
    kill_hard(pid);

    wait_for_status(&module, ModuleStatus::Error);
    assert!(module.watched_pid().is_none());
    assert!(
        module
            .last_error()
            .expect("crash is recorded")
            .contains(&pid.to_string())
    );

    let changes: Vec<_> = events.try_iter().collect();
    let last = changes.last().expect("transitions were published");
    assert_eq!(last.from, ModuleStatus::Running);
    assert_eq!(last.to, ModuleStatus::Error);
    assert_eq!(last.module, "victim");
}

#[test]
fn clean_stop_is_not_reported_as_crash() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("calm.pid");
    let module = shell_module("calm", &pid_file, pid_writer(&pid_file, "0"));

    module.start().expect("start failed");
    module.stop().expect("stop failed");

    thread::sleep(Duration::from_millis(400));
    assert_eq!(module.status(), ModuleStatus::Stopped);
    assert!(module.last_error().is_none());
}

#[test]
fn crashed_module_can_be_started_again() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("phoenix.pid");
    let module = shell_module("phoenix", &pid_file, pid_writer(&pid_file, "0"));

    module.start().expect("start failed");
    let first = module.watched_pid().unwrap();
    kill_hard(first);
    wait_for_status(&module, ModuleStatus::Error);

    assert_eq!(
        module.stop().expect_err("stop needs Running").kind(),
        ModuleErrorKind::InvalidStateTransition
    );

    module.start().expect("restart from Error failed");
    let second = module.watched_pid().unwrap();
    assert_ne!(first, second);
    assert!(module.last_error().is_none());
    module.stop().expect("stop failed");
}

#[test]
fn reload_follows_a_reexecuted_service() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("reexec.pid");
    let pid = pid_file.display().to_string();
    // On HUP the service hands over to a fresh process that rewrites the pid file.
    let command = format!(
        r#"trap 'sh -c "echo \$\$ > {pid}; exec sleep 60" & exit 0' HUP; echo $$ > {pid}; while true; do sleep 0.1; done"#
    );
    let module = ModuleBuilder::new("reexec", &pid_file, Arc::new(ShellService::new(command)))
        .watch_service(started_watch())
        .settings(ModuleSettings {
            reload_grace: Duration::from_millis(800),
            ..quick_settings()
        })
        .build();

    module.start().expect("start failed");
    let old = module.watched_pid().unwrap();

    module.reload().expect("reload failed");
    let new = module.watched_pid().expect("still running after reload");
    assert_ne!(old, new);
    assert_eq!(read_pid(&pid_file).unwrap(), Some(new));
    wait_for_process_exit(old);

    // The replacement is the one being watched now.
    kill_hard(new);
    wait_for_status(&module, ModuleStatus::Error);
}

#[test]
fn status_override_stops_watching_without_signalling() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("adopted.pid");
    let module = shell_module("adopted", &pid_file, pid_writer(&pid_file, "0"));

    module.start().expect("start failed");
    let pid = module.watched_pid().unwrap();

    module
        .set_status(ModuleStatus::Stopped)
        .expect("Stopped can always be forced");
    assert!(module.watched_pid().is_none());
    assert!(is_pid_alive(pid), "override does not touch the process");

    kill_hard(pid);
    wait_for_process_exit(pid);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(module.status(), ModuleStatus::Stopped);
}
