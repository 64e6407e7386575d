//! Configuration management for svcmod.
use nix::sys::signal::Signal;
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_PID_TIMEOUT, DEFAULT_RELOAD_GRACE,
    DEFAULT_RELOAD_SIGNAL, DEFAULT_START_TEST_TIMEOUT, DEFAULT_STOP_SIGNAL,
    DEFAULT_STOP_TIMEOUT,
};
use crate::error::ConfigError;

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Module configurations, ordered by name.
    pub modules: BTreeMap<String, ModuleConfig>,
    /// Root directory from which relative paths are resolved.
    pub project_dir: Option<String>,
}

/// Configuration for an individual supervised module.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModuleConfig {
    /// Shell command that launches the service.
    pub command: String,
    /// Pid file the service writes once it is up.
    pub pid_file: String,
    /// How long to wait for the pid file (e.g. "5s", "500ms").
    pub pid_timeout: Option<String>,
    /// How long to wait for the process to exit after the stop signal.
    pub stop_timeout: Option<String>,
    /// Signal sent on stop (default SIGTERM).
    pub stop_signal: Option<String>,
    /// Signal sent on reload (default SIGHUP).
    pub reload_signal: Option<String>,
    /// Command run instead of sending the stop signal.
    pub stop_command: Option<String>,
    /// Command run instead of sending the reload signal.
    pub reload_command: Option<String>,
    /// Settle time after a reload before the pid is re-validated.
    pub reload_grace: Option<String>,
    /// Send SIGKILL when the process outlives the stop timeout.
    pub kill_on_timeout: Option<bool>,
    /// Start the module after a successful rights fix.
    pub auto_run: Option<bool>,
    /// Run the start test as part of `start`.
    pub run_start_tests: Option<bool>,
    /// Probe confirming the service is usable.
    pub start_test: Option<StartTestConfig>,
    /// Re-run the start test at this interval while running.
    pub health_interval: Option<String>,
    /// Extra environment variables for the launched command.
    pub env: Option<HashMap<String, String>>,
    /// Working directory for the launched command.
    pub working_dir: Option<String>,
    /// Filesystem rights the service depends on.
    pub rights: Option<Vec<RightsConfig>>,
}

/// Start test definition. Exactly one of `tcp`, `http` or `command` must be set.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StartTestConfig {
    /// `host:port` that must accept a connection.
    pub tcp: Option<String>,
    /// URL that must answer with a 2xx status.
    pub http: Option<String>,
    /// Shell command that must exit 0.
    pub command: Option<String>,
    /// Upper bound for the probe.
    pub timeout: Option<String>,
}

/// A single path whose ownership and mode the service needs.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RightsConfig {
    pub path: String,
    /// User name or numeric uid.
    pub owner: Option<String>,
    /// Group name or numeric gid.
    pub group: Option<String>,
    /// Octal permission bits, e.g. "700".
    pub mode: Option<String>,
}

impl ModuleConfig {
    pub fn pid_timeout(&self) -> Result<Duration, ConfigError> {
        optional_duration(self.pid_timeout.as_deref(), DEFAULT_PID_TIMEOUT)
    }

    pub fn stop_timeout(&self) -> Result<Duration, ConfigError> {
        optional_duration(self.stop_timeout.as_deref(), DEFAULT_STOP_TIMEOUT)
    }

    pub fn reload_grace(&self) -> Result<Duration, ConfigError> {
        optional_duration(self.reload_grace.as_deref(), DEFAULT_RELOAD_GRACE)
    }

    pub fn health_interval(&self) -> Result<Option<Duration>, ConfigError> {
        self.health_interval.as_deref().map(parse_duration).transpose()
    }

    pub fn stop_signal(&self) -> Result<Signal, ConfigError> {
        parse_signal(self.stop_signal.as_deref().unwrap_or(DEFAULT_STOP_SIGNAL))
    }

    pub fn reload_signal(&self) -> Result<Signal, ConfigError> {
        parse_signal(self.reload_signal.as_deref().unwrap_or(DEFAULT_RELOAD_SIGNAL))
    }

    /// Checks every value that is parsed lazily so errors surface at load time.
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "module '{name}' has an empty command"
            )));
        }
        if self.pid_file.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "module '{name}' has no pid_file"
            )));
        }

        self.pid_timeout()?;
        self.stop_timeout()?;
        self.reload_grace()?;
        self.health_interval()?;
        self.stop_signal()?;
        self.reload_signal()?;

        if let Some(test) = &self.start_test {
            test.timeout()?;
            let kinds = [&test.tcp, &test.http, &test.command]
                .iter()
                .filter(|kind| kind.is_some())
                .count();
            if kinds != 1 {
                return Err(ConfigError::Invalid(format!(
                    "start_test for module '{name}' must set exactly one of tcp, http or command"
                )));
            }
        }

        for rights in self.rights.iter().flatten() {
            if let Some(mode) = &rights.mode {
                parse_mode(mode)?;
            }
        }

        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.pid_file = resolve_path(base, &self.pid_file);
        if let Some(dir) = &self.working_dir {
            self.working_dir = Some(resolve_path(base, dir));
        }
        for rights in self.rights.iter_mut().flatten() {
            rights.path = resolve_path(base, &rights.path);
        }
    }
}

impl StartTestConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        optional_duration(self.timeout.as_deref(), DEFAULT_START_TEST_TIMEOUT)
    }
}

fn resolve_path(base: &Path, raw: &str) -> String {
    let path = Path::new(raw);
    if path.is_absolute() {
        raw.to_string()
    } else {
        base.join(path).to_string_lossy().to_string()
    }
}

fn optional_duration(
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    raw.map(parse_duration).unwrap_or(Ok(default))
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::Invalid("Duration value cannot be empty".into()));
    }

    let (amount_str, millis_per_unit) = if let Some(stripped) = value.strip_suffix("ms")
    {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("Invalid duration value: '{raw}'")))?;

    Ok(Duration::from_millis(amount.saturating_mul(millis_per_unit)))
}

/// Parses a signal name with or without the `SIG` prefix.
pub fn parse_signal(raw: &str) -> Result<Signal, ConfigError> {
    let upper = raw.trim().to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name)
        .map_err(|_| ConfigError::Invalid(format!("Unknown signal: '{raw}'")))
}

/// Parses octal permission bits such as `700` or `0o755`.
pub fn parse_mode(raw: &str) -> Result<u32, ConfigError> {
    let value = raw.trim();
    let digits = value.strip_prefix("0o").unwrap_or(value);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| ConfigError::Invalid(format!("Invalid octal mode: '{raw}'")))?;
    if mode > 0o7777 {
        return Err(ConfigError::Invalid(format!("Mode out of range: '{raw}'")));
    }
    Ok(mode)
}

/// Expands `${VAR}` references within a string. Bare `$VAR` is left for the
/// shell, so commands can use variables such as `$SVCMOD_PID`.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingEnvVar(var_name)),
        None => Ok(result.to_string()),
    }
}

/// Loads and parses the configuration file, expanding environment variables and
/// resolving relative paths against the config file's directory.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    let config_path = config_path
        .map(Path::new)
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)?;

    let base_path: PathBuf = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    for (name, module) in config.modules.iter_mut() {
        module.resolve_paths(&base_path);
        module.validate(name)?;
    }

    Ok(config)
}
