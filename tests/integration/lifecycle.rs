#[path = "common/mod.rs"]
mod common;

use std::{collections::HashMap, fs};

use common::{is_process_alive, pid_writer, shell_module, started_watch, wait_for_path};
use svcmod::{
    config::ModuleConfig,
    error::ModuleErrorKind,
    executor::ModuleExecutor,
    module::Module,
    pidfile::read_pid,
    status::ModuleStatus,
};
use tempfile::tempdir;

#[test]
fn configured_module_starts_and_stops() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("web.pid");
    let config = ModuleConfig {
        command: pid_writer(&pid_file, "0.1"),
        pid_file: pid_file.display().to_string(),
        pid_timeout: Some("3s".into()),
        stop_timeout: Some("3s".into()),
        ..ModuleConfig::default()
    };

    let module = Module::from_config("web", &config, started_watch())
        .expect("failed to build module");
    assert_eq!(module.status(), ModuleStatus::Stopped);
    assert_eq!(module.name(), "web");

    module.start().expect("start failed");
    let pid = module.watched_pid().expect("running module has a pid");
    assert_eq!(module.status(), ModuleStatus::Running);
    assert_eq!(read_pid(&pid_file).unwrap(), Some(pid));
    assert!(is_process_alive(pid));

    module.stop().expect("stop failed");
    assert_eq!(module.status(), ModuleStatus::Stopped);
    assert!(module.watched_pid().is_none());
    assert!(!is_process_alive(pid));
    assert!(!pid_file.exists(), "stop removes a pid file naming the stopped pid");
}

#[test]
fn environment_and_working_dir_reach_the_service() {
    let temp = tempdir().expect("failed to create tempdir");
    let work = temp.path().join("work");
    fs::create_dir(&work).unwrap();
    let pid_file = temp.path().join("env.pid");

    let mut env = HashMap::new();
    env.insert("GREETING".to_string(), "hello".to_string());
    let config = ModuleConfig {
        command: format!(
            "printf '%s' \"$GREETING\" > greeting; echo $$ > '{}'; exec sleep 60",
            pid_file.display()
        ),
        pid_file: pid_file.display().to_string(),
        env: Some(env),
        working_dir: Some(work.display().to_string()),
        ..ModuleConfig::default()
    };

    let module = Module::from_config("env", &config, started_watch()).unwrap();
    module.start().expect("start failed");
    assert_eq!(fs::read_to_string(work.join("greeting")).unwrap(), "hello");
    module.stop().expect("stop failed");
}

#[test]
fn stop_and_reload_commands_replace_signals() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("ctl.pid");
    let reloaded = temp.path().join("reloaded");
    let stopped = temp.path().join("stopped");
    let config = ModuleConfig {
        command: pid_writer(&pid_file, "0"),
        pid_file: pid_file.display().to_string(),
        reload_command: Some(format!("echo \"$SVCMOD_PID\" > '{}'", reloaded.display())),
        stop_command: Some(format!(
            "echo \"$SVCMOD_MODULE\" > '{}' && kill \"$SVCMOD_PID\"",
            stopped.display()
        )),
        reload_grace: Some("100ms".into()),
        ..ModuleConfig::default()
    };

    let module = Module::from_config("ctl", &config, started_watch()).unwrap();
    module.start().expect("start failed");
    let pid = module.watched_pid().unwrap();

    module.reload().expect("reload failed");
    assert_eq!(module.status(), ModuleStatus::Running);
    assert_eq!(fs::read_to_string(&reloaded).unwrap().trim(), pid.to_string());

    module.stop().expect("stop failed");
    assert_eq!(fs::read_to_string(&stopped).unwrap().trim(), "ctl");
    assert_eq!(module.status(), ModuleStatus::Stopped);
}

#[test]
fn executor_rejects_second_operation_while_first_runs() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("slow.pid");
    let module = shell_module("slow", &pid_file, pid_writer(&pid_file, "0.6"));
    let executor = ModuleExecutor::new(module.clone()).expect("failed to spawn worker");

    let pending = executor.start().expect("first start is accepted");
    for rejected in [executor.start(), executor.stop(), executor.reload()] {
        let err = rejected.err().expect("second operation must be rejected");
        assert_eq!(err.kind(), ModuleErrorKind::InvalidStateTransition);
    }
    assert!(module.set_status(ModuleStatus::Stopped).is_err());

    pending.wait().expect("start failed");
    assert_eq!(module.status(), ModuleStatus::Running);
    assert!(!module.is_busy());

    executor.stop().unwrap().wait().expect("stop failed");
    assert_eq!(module.status(), ModuleStatus::Stopped);
}

#[test]
fn start_test_failure_stops_the_launched_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("probe.pid");
    let config = ModuleConfig {
        command: pid_writer(&pid_file, "0"),
        pid_file: pid_file.display().to_string(),
        start_test: Some(svcmod::config::StartTestConfig {
            command: Some("exit 1".into()),
            timeout: Some("1s".into()),
            ..Default::default()
        }),
        ..ModuleConfig::default()
    };

    let module = Module::from_config("probe", &config, started_watch()).unwrap();
    assert!(module.should_run_start_tests());

    let err = module.start().expect_err("failing start test must fail start");
    assert_eq!(err.kind(), ModuleErrorKind::StartTestFailed);
    assert_eq!(module.status(), ModuleStatus::Error);
    assert!(module.watched_pid().is_none());

    wait_for_path(&pid_file);
    let pid = read_pid(&pid_file).unwrap().expect("service wrote a pid");
    common::wait_for_process_exit(pid);
}

#[test]
fn start_tests_can_be_disabled_then_run_explicitly() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("probe.pid");
    let flag = temp.path().join("healthy");
    let config = ModuleConfig {
        command: pid_writer(&pid_file, "0"),
        pid_file: pid_file.display().to_string(),
        run_start_tests: Some(false),
        start_test: Some(svcmod::config::StartTestConfig {
            command: Some(format!("test -f '{}'", flag.display())),
            timeout: Some("1s".into()),
            ..Default::default()
        }),
        ..ModuleConfig::default()
    };

    let module = Module::from_config("probe", &config, started_watch()).unwrap();
    assert!(!module.should_run_start_tests());
    module.start().expect("start without tests succeeds");

    let err = module.run_start_tests().expect_err("flag file is missing");
    assert_eq!(err.kind(), ModuleErrorKind::StartTestFailed);
    assert_eq!(module.status(), ModuleStatus::Running);

    fs::write(&flag, "").unwrap();
    module.run_start_tests().expect("probe passes once flag exists");

    module.stop().expect("stop failed");
}

#[test]
fn stop_timeout_escalates_only_when_configured() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("stubborn.pid");
    let command = format!(
        "trap '' TERM; echo $$ > '{}'; while true; do sleep 0.1; done",
        pid_file.display()
    );

    let base = ModuleConfig {
        command,
        pid_file: pid_file.display().to_string(),
        stop_timeout: Some("400ms".into()),
        ..ModuleConfig::default()
    };

    let patient = Module::from_config("stubborn", &base, started_watch()).unwrap();
    patient.start().expect("start failed");
    let pid = patient.watched_pid().unwrap();
    let err = patient.stop().expect_err("TERM is ignored");
    assert_eq!(err.kind(), ModuleErrorKind::StopTimeout);
    assert_eq!(patient.status(), ModuleStatus::Error);
    assert!(is_process_alive(pid));
    common::kill_hard(pid);
    common::wait_for_process_exit(pid);

    let forceful = Module::from_config(
        "stubborn",
        &ModuleConfig {
            kill_on_timeout: Some(true),
            ..base
        },
        started_watch(),
    )
    .unwrap();
    forceful.start().expect("start failed");
    let pid = forceful.watched_pid().unwrap();
    forceful.stop().expect("SIGKILL follows the timeout");
    assert_eq!(forceful.status(), ModuleStatus::Stopped);
    assert!(!is_process_alive(pid));
}
