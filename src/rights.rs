//! Filesystem ownership and permission checks run before a module launches.
use nix::unistd::{Gid, Group, Uid, User, chown};
use serde::Serialize;
use std::{
    fmt, fs,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::PathBuf,
};
use tracing::{debug, info};

use crate::config::{RightsConfig, parse_mode};
use crate::error::{ConfigError, ModuleError, errno_to_io};

/// Ownership and mode a single path must have. `None` fields are not checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RightsRequirement {
    pub path: PathBuf,
    /// User name or numeric uid.
    pub owner: Option<String>,
    /// Group name or numeric gid.
    pub group: Option<String>,
    pub mode: Option<u32>,
}

impl TryFrom<&RightsConfig> for RightsRequirement {
    type Error = ConfigError;

    fn try_from(config: &RightsConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            path: PathBuf::from(&config.path),
            owner: config.owner.clone(),
            group: config.group.clone(),
            mode: config.mode.as_deref().map(parse_mode).transpose()?,
        })
    }
}

/// Required versus actual state of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RightsResult {
    pub path: PathBuf,
    pub expected_owner: Option<u32>,
    pub expected_group: Option<u32>,
    pub expected_mode: Option<u32>,
    pub actual_owner: u32,
    pub actual_group: u32,
    pub actual_mode: u32,
}

impl RightsResult {
    pub fn owner_ok(&self) -> bool {
        self.expected_owner.is_none_or(|uid| uid == self.actual_owner)
    }

    pub fn group_ok(&self) -> bool {
        self.expected_group.is_none_or(|gid| gid == self.actual_group)
    }

    pub fn mode_ok(&self) -> bool {
        self.expected_mode.is_none_or(|mode| mode == self.actual_mode)
    }

    pub fn is_correct(&self) -> bool {
        self.owner_ok() && self.group_ok() && self.mode_ok()
    }
}

impl fmt::Display for RightsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: owner {} group {} mode {:o}",
            self.path.display(),
            self.actual_owner,
            self.actual_group,
            self.actual_mode
        )?;
        if !self.owner_ok()
            && let Some(uid) = self.expected_owner
        {
            write!(f, ", needs owner {uid}")?;
        }
        if !self.group_ok()
            && let Some(gid) = self.expected_group
        {
            write!(f, ", needs group {gid}")?;
        }
        if !self.mode_ok()
            && let Some(mode) = self.expected_mode
        {
            write!(f, ", needs mode {mode:o}")?;
        }
        Ok(())
    }
}

/// Outcome of checking every requirement of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RightsReport {
    pub results: Vec<RightsResult>,
}

impl RightsReport {
    pub fn is_correct(&self) -> bool {
        self.results.iter().all(RightsResult::is_correct)
    }

    pub fn wrong(&self) -> impl Iterator<Item = &RightsResult> {
        self.results.iter().filter(|result| !result.is_correct())
    }

    /// One line per wrong path, for error details.
    pub fn describe_wrong(&self) -> String {
        self.wrong()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Verifies and corrects the filesystem rights a module depends on.
#[derive(Debug, Clone)]
pub struct RightsChecker {
    module: String,
    requirements: Vec<RightsRequirement>,
}

impl RightsChecker {
    pub fn new(module: impl Into<String>, requirements: Vec<RightsRequirement>) -> Self {
        Self {
            module: module.into(),
            requirements,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Reads the current state of every required path.
    ///
    /// Wrong rights are reported in the returned value, not as an error. Errors mean
    /// the check itself could not run (missing path, unknown user or group).
    pub fn check(&self) -> Result<RightsReport, ModuleError> {
        let mut results = Vec::with_capacity(self.requirements.len());

        for requirement in &self.requirements {
            let metadata = fs::metadata(&requirement.path).map_err(|err| {
                ModuleError::RightsCheckFailed {
                    module: self.module.clone(),
                    detail: format!("cannot stat {}: {err}", requirement.path.display()),
                }
            })?;

            let expected_owner = requirement
                .owner
                .as_deref()
                .map(|owner| self.resolve_uid(owner))
                .transpose()?;
            let expected_group = requirement
                .group
                .as_deref()
                .map(|group| self.resolve_gid(group))
                .transpose()?;

            results.push(RightsResult {
                path: requirement.path.clone(),
                expected_owner,
                expected_group,
                expected_mode: requirement.mode,
                actual_owner: metadata.uid(),
                actual_group: metadata.gid(),
                actual_mode: metadata.mode() & 0o7777,
            });
        }

        let report = RightsReport { results };
        debug!(
            "Rights check for '{}': {} path(s), {} wrong",
            self.module,
            report.results.len(),
            report.wrong().count()
        );
        Ok(report)
    }

    /// Applies ownership and mode corrections for every wrong entry in `report`.
    /// Returns the paths that were changed.
    pub fn fix(&self, report: &RightsReport) -> Result<Vec<PathBuf>, ModuleError> {
        let mut fixed = Vec::new();

        for result in report.wrong() {
            let fix_error = |source: std::io::Error| ModuleError::RightsFixFailed {
                module: self.module.clone(),
                path: result.path.display().to_string(),
                source,
            };

            if !result.owner_ok() || !result.group_ok() {
                let uid = result
                    .expected_owner
                    .filter(|_| !result.owner_ok())
                    .map(Uid::from_raw);
                let gid = result
                    .expected_group
                    .filter(|_| !result.group_ok())
                    .map(Gid::from_raw);
                chown(&result.path, uid, gid)
                    .map_err(errno_to_io)
                    .map_err(fix_error)?;
            }

            if let Some(mode) = result.expected_mode
                && !result.mode_ok()
            {
                fs::set_permissions(&result.path, fs::Permissions::from_mode(mode))
                    .map_err(fix_error)?;
            }

            info!("Fixed rights for '{}': {}", self.module, result);
            fixed.push(result.path.clone());
        }

        Ok(fixed)
    }

    fn resolve_uid(&self, owner: &str) -> Result<u32, ModuleError> {
        if let Ok(uid) = owner.parse::<u32>() {
            return Ok(uid);
        }
        match User::from_name(owner) {
            Ok(Some(user)) => Ok(user.uid.as_raw()),
            Ok(None) => Err(self.check_error(format!("user '{owner}' not found"))),
            Err(err) => Err(self.check_error(format!("failed to look up user '{owner}': {err}"))),
        }
    }

    fn resolve_gid(&self, group: &str) -> Result<u32, ModuleError> {
        if let Ok(gid) = group.parse::<u32>() {
            return Ok(gid);
        }
        match Group::from_name(group) {
            Ok(Some(group)) => Ok(group.gid.as_raw()),
            Ok(None) => Err(self.check_error(format!("group '{group}' not found"))),
            Err(err) => {
                Err(self.check_error(format!("failed to look up group '{group}': {err}")))
            }
        }
    }

    fn check_error(&self, detail: String) -> ModuleError {
        ModuleError::RightsCheckFailed {
            module: self.module.clone(),
            detail,
        }
    }
}
