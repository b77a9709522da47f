//! Stack file loading for aistack.
//!
//! The stack file is YAML. `${VAR}` references are expanded from the
//! declared env files first and the controller's environment second, then
//! the ordered service list is validated and turned into descriptors.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};
use tracing::{debug, warn};

use crate::{
    constants::{DEFAULT_CONFIG_FILE, DEFAULT_READY_TIMEOUT, DEFAULT_STOP_GRACE, READY_POLL_INTERVAL},
    descriptor::{ServiceCommand, ServiceDescriptor, default_log_path, default_pid_path},
    error::StackError,
    runtime,
};

/// Represents the structure of the stack file.
#[derive(Debug, Deserialize, Clone)]
pub struct StackConfig {
    /// Configuration version.
    pub version: String,
    /// Directory for service logs. Defaults to the runtime log directory.
    pub log_dir: Option<String>,
    /// Directory holding the `pids/` folder. Defaults to the runtime state directory.
    pub state_dir: Option<String>,
    /// Overall budget for a `start` run, e.g. "5m".
    pub start_timeout: Option<String>,
    /// Interval between readiness polls, e.g. "2s".
    pub poll_interval: Option<String>,
    /// Time between SIGTERM and SIGKILL when stopping, e.g. "2s".
    pub stop_grace: Option<String>,
    /// Environment shared by every service.
    pub env: Option<EnvConfig>,
    /// Services in start order.
    pub services: Vec<ServiceConfig>,
    /// Directory of the stack file; relative paths resolve against it.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    /// Unique service name.
    pub name: String,
    /// Command used to start the service.
    pub command: String,
    /// Port the service listens on.
    pub port: u16,
    /// Working directory, relative to the stack file.
    pub working_dir: Option<String>,
    /// HTTP path that must answer before the service counts as ready.
    pub readiness_path: Option<String>,
    /// Readiness budget, e.g. "120s".
    pub ready_timeout: Option<String>,
    /// Optional environment variables for the service.
    pub env: Option<EnvConfig>,
    /// Overrides `<log_dir>/<name>.log`.
    pub log_file: Option<String>,
    /// Overrides `<state_dir>/pids/<name>.pid`.
    pub pid_file: Option<String>,
    /// Regex matched against command lines when no pid file exists at stop time.
    pub stop_pattern: Option<String>,
}

/// Represents environment variables for a service.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| resolve_path(base, f))
    }
}

/// Stack-wide timings resolved from the stack file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSettings {
    /// Overall budget for a `start` run. `None` means each service only gets its own timeout.
    pub start_timeout: Option<Duration>,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            start_timeout: None,
            poll_interval: READY_POLL_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Only the env sections, read before expansion so env files can feed `${VAR}`.
#[derive(Debug, Deserialize, Default)]
struct EnvSections {
    env: Option<EnvConfig>,
    #[serde(default)]
    services: Vec<ServiceEnvSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceEnvSection {
    env: Option<EnvConfig>,
}

impl StackConfig {
    /// Parses the stack-wide timings.
    pub fn settings(&self) -> Result<StackSettings, StackError> {
        let defaults = StackSettings::default();
        Ok(StackSettings {
            start_timeout: self.start_timeout.as_deref().map(parse_duration).transpose()?,
            poll_interval: self
                .poll_interval
                .as_deref()
                .map(parse_duration)
                .transpose()?
                .unwrap_or(defaults.poll_interval),
            stop_grace: self
                .stop_grace
                .as_deref()
                .map(parse_duration)
                .transpose()?
                .unwrap_or(defaults.stop_grace),
        })
    }

    /// Validates the service list and builds descriptors in declared order.
    ///
    /// Names and ports must be unique across the stack.
    pub fn descriptors(&self) -> Result<Vec<ServiceDescriptor>, StackError> {
        let base = self.project_dir.as_path();
        let log_dir = self
            .log_dir
            .as_deref()
            .map(|dir| resolve_path(base, dir))
            .unwrap_or_else(runtime::log_dir);
        let pid_dir = self
            .state_dir
            .as_deref()
            .map(|dir| resolve_path(base, dir).join(crate::constants::PID_DIR_NAME))
            .unwrap_or_else(runtime::pid_dir);

        let shared_env = match &self.env {
            Some(env_config) => collect_env(env_config, base, "stack")?,
            None => HashMap::new(),
        };

        let mut names = HashSet::new();
        let mut ports: HashMap<u16, &str> = HashMap::new();
        let mut descriptors = Vec::with_capacity(self.services.len());

        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(StackError::DuplicateService(service.name.clone()));
            }
            if let Some(first) = ports.insert(service.port, service.name.as_str()) {
                return Err(StackError::DuplicatePort {
                    port: service.port,
                    first: first.to_string(),
                    second: service.name.clone(),
                });
            }

            let mut env = shared_env.clone();
            if let Some(env_config) = &service.env {
                env.extend(collect_env(env_config, base, &service.name)?);
            }

            let working_dir = service
                .working_dir
                .as_deref()
                .map(|dir| resolve_path(base, dir))
                .unwrap_or_else(|| base.to_path_buf());

            let mut descriptor = ServiceDescriptor::new(
                service.name.clone(),
                ServiceCommand {
                    line: service.command.clone(),
                    working_dir,
                    env,
                },
                service.port,
                &log_dir,
                &pid_dir,
            )
            .with_ready_timeout(
                service
                    .ready_timeout
                    .as_deref()
                    .map(parse_duration)
                    .transpose()?
                    .unwrap_or(DEFAULT_READY_TIMEOUT),
            );

            if let Some(path) = &service.readiness_path {
                descriptor = descriptor.with_readiness_path(path.clone());
            }
            descriptor.log_path = service
                .log_file
                .as_deref()
                .map(|file| resolve_path(base, file))
                .unwrap_or_else(|| default_log_path(&log_dir, &service.name));
            descriptor.pid_path = service
                .pid_file
                .as_deref()
                .map(|file| resolve_path(base, file))
                .unwrap_or_else(|| default_pid_path(&pid_dir, &service.name));
            if let Some(pattern) = &service.stop_pattern {
                let regex =
                    Regex::new(pattern).map_err(|source| StackError::InvalidStopPattern {
                        service: service.name.clone(),
                        source,
                    })?;
                descriptor = descriptor.with_stop_pattern(regex);
            }

            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Expands `${VAR}` references, preferring values from `file_vars`.
///
/// Bare `$VAR` is left alone so shell lines keep their own variables.
fn expand_env_vars(
    input: &str,
    file_vars: &HashMap<String, String>,
) -> Result<String, StackError> {
    let mut missing = None;
    let result = env_var_pattern().replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        if let Some(value) = file_vars.get(var_name) {
            return value.clone();
        }
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(StackError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

/// Parses an `.env` file into a map. Blank lines and `#` comments are skipped.
fn load_env_file(path: &Path, owner: &str) -> Result<HashMap<String, String>, StackError> {
    let content = fs::read_to_string(path).map_err(|e| {
        StackError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let mut resolved = HashMap::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().trim_start_matches("export ").trim().to_string();
            let mut value = value.trim();

            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            resolved.insert(key, value.to_string());
        } else {
            warn!("Ignoring malformed line in env file for '{}': {}", owner, line);
        }
    }

    Ok(resolved)
}

/// Builds the environment for one scope, giving inline `vars` precedence over `file`.
fn collect_env(
    env_config: &EnvConfig,
    base: &Path,
    owner: &str,
) -> Result<HashMap<String, String>, StackError> {
    let mut resolved = match env_config.path(base) {
        Some(path) => load_env_file(&path, owner)?,
        None => HashMap::new(),
    };

    if let Some(vars) = &env_config.vars {
        for (key, value) in vars {
            resolved.insert(key.clone(), value.clone());
        }
    }

    Ok(resolved)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, StackError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(StackError::InvalidDuration(raw.to_string()));
    }

    let invalid = || StackError::InvalidDuration(raw.to_string());

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Loads and parses the stack file, expanding `${VAR}` references.
pub fn load_config(config_path: Option<&str>) -> Result<StackConfig, StackError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        StackError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let sections: EnvSections =
        serde_yaml::from_str(&content).map_err(StackError::ConfigParseError)?;
    let mut file_vars = HashMap::new();
    let scopes = sections
        .env
        .iter()
        .chain(sections.services.iter().filter_map(|s| s.env.as_ref()));
    for env_config in scopes {
        if let Some(path) = env_config.path(&base_path) {
            file_vars.extend(load_env_file(&path, "stack")?);
        }
    }

    let expanded_content = expand_env_vars(&content, &file_vars)?;

    let mut config: StackConfig =
        serde_yaml::from_str(&expanded_content).map_err(StackError::ConfigParseError)?;
    config.project_dir = base_path;

    debug!(
        "Loaded {} service(s) from {}",
        config.services.len(),
        config_path.display()
    );
    Ok(config)
}
