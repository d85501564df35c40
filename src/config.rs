use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating the configuration.
///
/// All of these are fatal at startup: the process must not serve traffic
/// with a broken configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no applications configured under [[web.apps]]")]
    NoApps,
    #[error("expected exactly one control app with remote_port = 0, found {0}")]
    ControlAppCount(usize),
    #[error("duplicate local port {0} in [[web.apps]]")]
    DuplicateLocalPort(u16),
    #[error("ssh.status_command must be set")]
    MissingStatusCommand,
}

/// Top-level configuration for the gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Cloud control-plane access
    pub control_plane: ControlPlaneConfig,

    /// Listener and idle-detection settings
    pub web: WebConfig,

    /// SSH tunnel and telemetry settings
    #[serde(default)]
    pub ssh: SshConfig,

    /// Maintenance commands run while the pod is up
    #[serde(default)]
    pub periodic_tasks: Vec<PeriodicTaskConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlPlaneConfig {
    /// Base URL of the control-plane REST API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// API key, sent as a bearer token on every request
    pub api_key: String,

    /// Name of the pod this deployment manages (exactly one)
    pub pod_name: String,

    /// Template used when the pod has to be created from scratch
    pub template_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    /// Bind address for all listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Grace period after create/resume before SSH is attempted
    #[serde(default = "default_startup_wait")]
    pub startup_wait_secs: u64,

    /// Interval for reconciling pod state against the control plane
    #[serde(default = "default_check_pod_interval")]
    pub check_pod_interval_secs: u64,

    /// Web idle timeout before a proxy's demand is cleared
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Path prefixes that must not wake the pod (polled while idle)
    #[serde(default = "default_dont_wake_paths")]
    pub dont_wake_paths: Vec<String>,

    /// One entry per proxied application, in display order
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// A single proxied application.
///
/// `remote_port == 0` marks the control app: it serves the status page and
/// shutdown APIs instead of forwarding. Exactly one app must be the control
/// app.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SshConfig {
    /// Remote login user
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Remote command whose stdout is the telemetry stream
    #[serde(default)]
    pub status_command: String,

    /// CPU utilization (percent, summed across cores) counted as activity
    #[serde(default = "default_cpu_util_threshold")]
    pub cpu_util_threshold: f64,

    /// GPU utilization (percent, summed across GPUs) counted as activity
    #[serde(default = "default_gpu_util_threshold")]
    pub gpu_util_threshold: f64,

    /// CPU/GPU idle timeout before telemetry-driven demand is cleared
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Keep the Host block in ~/.ssh/config pointed at the pod
    #[serde(default)]
    pub update_ssh_config: bool,

    /// Host alias to rewrite in ~/.ssh/config (defaults to the pod name)
    pub host_alias: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            status_command: String::new(),
            cpu_util_threshold: default_cpu_util_threshold(),
            gpu_util_threshold: default_gpu_util_threshold(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            update_ssh_config: false,
            host_alias: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PeriodicTaskConfig {
    pub name: String,
    /// Run through `sh -c`
    pub command: String,
    pub interval_secs: u64,
}

impl Config {
    /// Load and validate the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.web.apps.is_empty() {
            return Err(ConfigError::NoApps);
        }

        let control_count = self.web.apps.iter().filter(|a| a.remote_port == 0).count();
        if control_count != 1 {
            return Err(ConfigError::ControlAppCount(control_count));
        }

        let mut seen = std::collections::HashSet::new();
        for app in &self.web.apps {
            if !seen.insert(app.local_port) {
                return Err(ConfigError::DuplicateLocalPort(app.local_port));
            }
        }

        // Without a remote command the tunnel would open a plain shell
        // instead of the telemetry stream
        if self.ssh.status_command.trim().is_empty() {
            return Err(ConfigError::MissingStatusCommand);
        }

        Ok(())
    }

    /// Remote ports of all forwarding apps, for the SSH port-forward list.
    pub fn forward_ports(&self) -> Vec<u16> {
        self.web
            .apps
            .iter()
            .map(|a| a.remote_port)
            .filter(|&p| p != 0)
            .collect()
    }
}

impl WebConfig {
    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }

    pub fn check_pod_interval(&self) -> Duration {
        Duration::from_secs(self.check_pod_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl SshConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_api_base() -> String {
    "https://rest.runpod.io/v1".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_startup_wait() -> u64 {
    60
}

fn default_check_pod_interval() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    1800
}

fn default_dont_wake_paths() -> Vec<String> {
    vec!["/api/queue".to_string(), "/api/history".to_string()]
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_cpu_util_threshold() -> f64 {
    50.0
}

fn default_gpu_util_threshold() -> f64 {
    10.0
}
