#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::Path,
    sync::Arc,
};

use common::{pid_writer, quick_settings, started_watch};
use svcmod::{
    config::{ModuleConfig, RightsConfig},
    error::ModuleErrorKind,
    module::{Module, ModuleBuilder, ModuleSettings, RightsFixOutcome},
    rights::RightsRequirement,
    service::ShellService,
    status::ModuleStatus,
};
use tempfile::tempdir;

fn data_dir(root: &Path, mode: u32) -> std::path::PathBuf {
    let data = root.join("data");
    fs::create_dir(&data).expect("failed to create data dir");
    fs::set_permissions(&data, fs::Permissions::from_mode(mode)).unwrap();
    data
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().mode() & 0o7777
}

fn guarded_module(root: &Path, data: &Path, auto_run: bool) -> Module {
    let pid_file = root.join("guarded.pid");
    ModuleBuilder::new(
        "guarded",
        &pid_file,
        Arc::new(ShellService::new(pid_writer(&pid_file, "0"))),
    )
    .watch_service(started_watch())
    .settings(ModuleSettings {
        auto_run,
        ..quick_settings()
    })
    .rights(vec![RightsRequirement {
        path: data.to_path_buf(),
        owner: None,
        group: None,
        mode: Some(0o700),
    }])
    .build()
}

#[test]
fn wrong_mode_is_fixed_and_auto_run_module_starts() {
    let temp = tempdir().expect("failed to create tempdir");
    let data = data_dir(temp.path(), 0o755);
    let module = guarded_module(temp.path(), &data, true);

    module.check_fix_rights_and_run_if_needed();

    assert_eq!(mode_of(&data), 0o700);
    assert_eq!(module.status(), ModuleStatus::Running);
    module.stop().expect("stop failed");
}

#[test]
fn fix_without_auto_run_leaves_module_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let data = data_dir(temp.path(), 0o755);
    let module = guarded_module(temp.path(), &data, false);

    module.check_fix_rights_and_run_if_needed();

    assert_eq!(mode_of(&data), 0o700);
    assert_eq!(module.status(), ModuleStatus::Stopped);
}

#[test]
fn correct_rights_do_not_trigger_a_start() {
    let temp = tempdir().expect("failed to create tempdir");
    let data = data_dir(temp.path(), 0o700);
    let module = guarded_module(temp.path(), &data, true);

    assert_eq!(
        module.check_fix_rights().expect("check failed"),
        RightsFixOutcome::AlreadyCorrect
    );
    module.check_fix_rights_and_run_if_needed();
    assert_eq!(module.status(), ModuleStatus::Stopped);
}

#[test]
fn start_refuses_wrong_rights() {
    let temp = tempdir().expect("failed to create tempdir");
    let data = data_dir(temp.path(), 0o755);
    let module = guarded_module(temp.path(), &data, false);

    let err = module.start().expect_err("rights are wrong");
    assert_eq!(err.kind(), ModuleErrorKind::RightsCheckFailed);
    assert_eq!(module.status(), ModuleStatus::Error);
    assert_eq!(mode_of(&data), 0o755, "start only checks, it never fixes");
}

#[test]
fn check_failure_is_recorded_without_status_change() {
    let temp = tempdir().expect("failed to create tempdir");
    let missing = temp.path().join("missing");
    let module = guarded_module(temp.path(), &missing, true);

    module.check_fix_rights_and_run_if_needed();

    assert_eq!(module.status(), ModuleStatus::Stopped);
    assert!(module.last_error().unwrap().contains("missing"));
}

#[test]
fn rights_from_config_are_enforced() {
    let temp = tempdir().expect("failed to create tempdir");
    let data = data_dir(temp.path(), 0o777);
    let pid_file = temp.path().join("cfg.pid");
    let config = ModuleConfig {
        command: pid_writer(&pid_file, "0"),
        pid_file: pid_file.display().to_string(),
        auto_run: Some(true),
        rights: Some(vec![RightsConfig {
            path: data.display().to_string(),
            owner: None,
            group: None,
            mode: Some("0750".into()),
        }]),
        ..ModuleConfig::default()
    };

    let module = Module::from_config("cfg", &config, started_watch()).unwrap();
    match module.check_fix_rights().expect("fix failed") {
        RightsFixOutcome::Fixed(paths) => assert_eq!(paths, vec![data.clone()]),
        other => panic!("expected a fix, got {other:?}"),
    }
    assert_eq!(mode_of(&data), 0o750);
}
