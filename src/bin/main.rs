use serde::Serialize;
use std::{
    error::Error,
    path::PathBuf,
    sync::{Arc, mpsc},
    thread,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use svcmod::{
    cli::{Cli, Commands, parse_args},
    config::{Config, ModuleConfig, load_config},
    pidfile::read_pid,
    process::is_pid_alive,
    rights::{RightsChecker, RightsReport, RightsRequirement},
    start_test::{ProbeOutcome, StartTestRunner, probe_from_config},
    supervisor::{Supervisor, SupervisorError},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run { module } => run_foreground(&args.config, module.as_deref())?,
        Commands::Rights { module, fix, json } => {
            let config = load_config(Some(&args.config))?;
            check_rights(&config, module.as_deref(), fix, json)?;
        }
        Commands::Probe { module } => {
            let config = load_config(Some(&args.config))?;
            probe_module(&config, &module)?;
        }
        Commands::Status { module, json } => {
            let config = load_config(Some(&args.config))?;
            show_status(&config, module.as_deref(), json)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run_foreground(config_path: &str, module: Option<&str>) -> Result<(), Box<dyn Error>> {
    let supervisor = Supervisor::new(Some(config_path), module)?;
    let events = supervisor.status_events();

    thread::Builder::new()
        .name("status-log".into())
        .spawn(move || {
            for change in events {
                match change.pid {
                    Some(pid) => info!(
                        "[{}] {} -> {} (PID {pid})",
                        change.module, change.from, change.to
                    ),
                    None => info!("[{}] {} -> {}", change.module, change.from, change.to),
                }
            }
        })?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    let failures = supervisor.start();
    for (name, err) in &failures {
        warn!("Module '{name}' is not running: {err}");
    }
    info!("svcmod is supervising; press Ctrl-C to stop");

    let _ = shutdown_rx.recv();
    info!("svcmod is shutting down");
    supervisor.shutdown();
    Ok(())
}

fn selected<'a>(
    config: &'a Config,
    module: Option<&str>,
) -> Result<Vec<(&'a String, &'a ModuleConfig)>, SupervisorError> {
    let modules = match module {
        Some(name) => {
            let (key, value) = config
                .modules
                .get_key_value(name)
                .ok_or_else(|| SupervisorError::UnknownModule(name.to_string()))?;
            vec![(key, value)]
        }
        None => config.modules.iter().collect(),
    };
    Ok(modules)
}

#[derive(Serialize)]
struct RightsEntry<'a> {
    module: &'a str,
    correct: bool,
    report: RightsReport,
    fixed: Vec<PathBuf>,
}

fn check_rights(
    config: &Config,
    module: Option<&str>,
    fix: bool,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    let mut entries = Vec::new();
    let mut all_correct = true;

    for (name, module_config) in selected(config, module)? {
        let requirements = module_config
            .rights
            .iter()
            .flatten()
            .map(RightsRequirement::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let checker = RightsChecker::new(name.as_str(), requirements);

        let mut report = checker.check()?;
        let mut fixed = Vec::new();
        if fix && !report.is_correct() {
            fixed = checker.fix(&report)?;
            report = checker.check()?;
        }
        all_correct &= report.is_correct();

        entries.push(RightsEntry {
            module: name,
            correct: report.is_correct(),
            report,
            fixed,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            if entry.report.results.is_empty() {
                println!("● {} - No rights requirements", entry.module);
                continue;
            }
            let state = if entry.correct { "OK" } else { "WRONG" };
            println!("● {} - {state}", entry.module);
            for result in &entry.report.results {
                let mark = if result.is_correct() { "ok" } else { "!!" };
                println!("  [{mark}] {result}");
            }
            for path in &entry.fixed {
                println!("  fixed {}", path.display());
            }
        }
    }

    if all_correct {
        Ok(())
    } else {
        Err("some modules have wrong rights".into())
    }
}

fn probe_module(config: &Config, name: &str) -> Result<(), Box<dyn Error>> {
    let (_, module_config) = selected(config, Some(name))?
        .into_iter()
        .next()
        .ok_or_else(|| SupervisorError::UnknownModule(name.to_string()))?;
    let Some(test_config) = &module_config.start_test else {
        return Err(format!("module '{name}' has no start_test").into());
    };

    let pid_file = PathBuf::from(&module_config.pid_file);
    let pid = read_pid(&pid_file)?
        .ok_or_else(|| format!("no valid pid in {}", pid_file.display()))?;
    if !is_pid_alive(pid) {
        return Err(format!("PID {pid} of module '{name}' is not running").into());
    }

    let probe = probe_from_config(test_config)?;
    let description = probe.describe();
    let runner = StartTestRunner::new(test_config.timeout()?);
    match runner.run(Arc::clone(&probe), name, pid) {
        ProbeOutcome::Passed => {
            println!("● {name} - `{description}` passed (PID {pid})");
            Ok(())
        }
        ProbeOutcome::Failed(reason) => {
            error!("Start test for '{name}' failed: {reason}");
            Err(format!("`{description}` failed: {reason}").into())
        }
    }
}

#[derive(Serialize)]
struct StatusEntry<'a> {
    module: &'a str,
    pid_file: &'a str,
    pid: Option<u32>,
    running: bool,
}

fn show_status(config: &Config, module: Option<&str>, json: bool) -> Result<(), Box<dyn Error>> {
    let mut entries = Vec::new();
    for (name, module_config) in selected(config, module)? {
        let pid = match read_pid(&PathBuf::from(&module_config.pid_file)) {
            Ok(pid) => pid,
            Err(err) => {
                warn!("Cannot read pid file of '{name}': {err}");
                None
            }
        };
        entries.push(StatusEntry {
            module: name,
            pid_file: &module_config.pid_file,
            pid,
            running: pid.is_some_and(is_pid_alive),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        match (entry.pid, entry.running) {
            (Some(pid), true) => println!("● {} - Running (PID {pid})", entry.module),
            (Some(pid), false) => {
                println!("● {} - Stale pid file ({pid} not running)", entry.module)
            }
            (None, _) => println!("● {} - Stopped", entry.module),
        }
    }
    Ok(())
}
