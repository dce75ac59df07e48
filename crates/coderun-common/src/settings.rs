// RuntimeSettings: the configuration surface of a coderun host.
// Loaded from a JSON file, then overridden from CODERUN_* variables.

use crate::constants::{defaults, variables::settings as env_keys};
use anyhow::{Context, Result};
use coderun_sdk::{IOUtil, StringUtil};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which runner backend the process uses. Chosen once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Container,
    Remote,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "container" | "docker" => Ok(BackendKind::Container),
            "remote" => Ok(BackendKind::Remote),
            other => anyhow::bail!("unknown runner backend '{other}' (expected local, container or remote)"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Container => write!(f, "container"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

/// Settings for runners launched as local child processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalSettings {
    /// Interpreter command, resolved on `PATH` unless it is a path.
    pub interpreter: String,
    /// Script inside the support directory that hosts the runner.
    pub runner_entry: String,
    /// Bundled runner-support files copied next to every runner.
    pub support_dir: Option<PathBuf>,
    /// Module search path variable extended with the runner's directories.
    pub search_path_var: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            interpreter: defaults::INTERPRETER.to_string(),
            runner_entry: defaults::RUNNER_ENTRY.to_string(),
            support_dir: None,
            search_path_var: defaults::SEARCH_PATH_VAR.to_string(),
        }
    }
}

/// Settings for runners launched as containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSettings {
    pub docker_path: String,
    pub base_image: String,
    pub image_repository: String,
    pub network: String,
    /// Port the runner listens on inside the container.
    pub runner_port: u16,
    pub port_discovery_attempts: u32,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            docker_path: defaults::DOCKER_PATH.to_string(),
            base_image: defaults::BASE_IMAGE.to_string(),
            image_repository: defaults::IMAGE_REPOSITORY.to_string(),
            network: defaults::NETWORK.to_string(),
            runner_port: defaults::RUNNER_PORT,
            port_discovery_attempts: defaults::PORT_DISCOVERY_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    pub backend: BackendKind,

    /// Address the worker RPC service binds.
    pub worker_address: String,

    /// Address runners are told to dial. Defaults to the bound worker address.
    pub runner_worker_address: Option<String>,

    /// Defer interpreter discovery until the first local runner starts.
    pub lazy_environment: bool,

    /// Relay runner `Log` messages to the session sink.
    pub log_runner_code: bool,

    /// Relay runner `Print` output to the session sink.
    pub log_print: bool,

    /// `host:port` endpoints of remote runner managers.
    pub remote_endpoints: Vec<String>,

    pub min_interpreter_version: String,

    #[serde(with = "duration_ms")]
    pub start_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub health_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub health_interval: Duration,

    pub local: LocalSettings,

    pub container: ContainerSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            worker_address: defaults::WORKER_ADDRESS.to_string(),
            runner_worker_address: None,
            lazy_environment: false,
            log_runner_code: true,
            log_print: true,
            remote_endpoints: Vec::new(),
            min_interpreter_version: defaults::MIN_INTERPRETER_VERSION.to_string(),
            start_timeout: defaults::START_TIMEOUT,
            health_timeout: defaults::HEALTH_TIMEOUT,
            handshake_timeout: defaults::HANDSHAKE_TIMEOUT,
            health_interval: defaults::HEALTH_INTERVAL,
            local: LocalSettings::default(),
            container: ContainerSettings::default(),
        }
    }
}

impl RuntimeSettings {
    /// Load settings from `path` (or the file named by `CODERUN_SETTINGS`,
    /// or the defaults), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(env_keys::SETTINGS_FILE).map(PathBuf::from);
        let mut settings = match path.map(Path::to_path_buf).or(from_env) {
            Some(file) => IOUtil::load_object::<RuntimeSettings>(&file)
                .with_context(|| format!("failed to load settings from {}", file.display()))?,
            None => RuntimeSettings::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Apply `CODERUN_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| -> Result<Option<bool>> {
            match lookup(key) {
                Some(raw) => StringUtil::convert_to_bool(&raw)
                    .map(Some)
                    .with_context(|| format!("{key} must be a boolean, got '{raw}'")),
                None => Ok(None),
            }
        };

        if let Some(raw) = lookup(env_keys::BACKEND) {
            self.backend = raw.parse()?;
        }
        if let Some(addr) = lookup(env_keys::WORKER_ADDRESS) {
            self.worker_address = addr;
        }
        if let Some(addr) = lookup(env_keys::RUNNER_WORKER_ADDRESS) {
            self.runner_worker_address = Some(addr);
        }
        if let Some(v) = flag(env_keys::LAZY_ENVIRONMENT)? {
            self.lazy_environment = v;
        }
        if let Some(v) = flag(env_keys::LOG_RUNNER_CODE)? {
            self.log_runner_code = v;
        }
        if let Some(v) = flag(env_keys::LOG_PRINT)? {
            self.log_print = v;
        }
        if let Some(raw) = lookup(env_keys::REMOTE_ENDPOINTS) {
            self.remote_endpoints = StringUtil::split_list(&raw);
        }
        if let Some(version) = lookup(env_keys::MIN_INTERPRETER_VERSION) {
            self.min_interpreter_version = version;
        }
        if let Some(interpreter) = lookup(env_keys::INTERPRETER) {
            self.local.interpreter = interpreter;
        }
        if let Some(dir) = lookup(env_keys::SUPPORT_DIR) {
            self.local.support_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
