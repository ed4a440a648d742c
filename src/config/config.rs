//! Configuration object recognized by the orchestration core.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration object.
///
/// Loaded once by the factory (C10) at startup and swapped atomically by
/// `UpdateConfig`. Every optional field carries a `serde(default = "fn")`
/// so a configuration file only needs to override what it cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Runtime client connection settings.
    #[serde(default)]
    pub runtime: RuntimeConfiguration,

    /// Per-workspace isolation defaults.
    #[serde(default)]
    pub isolation: IsolationDefaults,

    /// Label prefix applied to every managed resource. Default `aicli`.
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Task executor tuning.
    #[serde(default)]
    pub executor: ExecutorConfiguration,

    /// Batch coordinator tuning.
    #[serde(default)]
    pub batch: BatchConfiguration,

    /// Error recovery defaults.
    #[serde(default)]
    pub recovery: RecoveryConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfiguration::default(),
            isolation: IsolationDefaults::default(),
            label_prefix: default_label_prefix(),
            executor: ExecutorConfiguration::default(),
            batch: BatchConfiguration::default(),
            recovery: RecoveryConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from a TOML file.
    ///
    /// Unlike the daemon's panel configuration this object has no required
    /// fields — a missing file section simply falls back to its defaults —
    /// so a nonexistent file also resolves to the default configuration
    /// rather than an error, matching the "constructed once at program
    /// start" expectation of the factory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Configuration =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;
        Ok(config)
    }
}

fn default_label_prefix() -> String {
    "aicli".into()
}

/// Connection settings for the runtime client (C1).
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfiguration {
    /// Runtime endpoint. `None` means "probe the usual local sockets"
    /// (Colima, Docker Desktop, `/var/run/docker.sock`), mirroring the
    /// daemon's own socket-discovery order.
    #[serde(default)]
    pub host: Option<String>,

    /// Negotiated API version string, passed straight through to the client.
    #[serde(default = "default_api_version")]
    pub version: String,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Name of the shared bridge network created/verified on construction.
    #[serde(default = "default_network_name")]
    pub network_name: String,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            host: None,
            version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            network_name: default_network_name(),
        }
    }
}

fn default_api_version() -> String {
    "1.41".into()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_network_name() -> String {
    "workspace-bridge".into()
}

/// Resolves the runtime client's connection target the same way the daemon
/// resolves its Docker socket: explicit config value first, then a short
/// list of well-known local sockets, then the system default.
pub fn default_runtime_host() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let colima = PathBuf::from(&home).join(".colima/default/docker.sock");
            if colima.exists() {
                return format!("unix://{}", colima.display());
            }
            let desktop = PathBuf::from(&home).join(".docker/run/docker.sock");
            if desktop.exists() {
                return format!("unix://{}", desktop.display());
            }
        }
        "unix:///var/run/docker.sock".into()
    }
}

/// Per-workspace isolation defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct IsolationDefaults {
    /// Default image used when a workspace does not override one.
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Default shell invoked as the container's command.
    #[serde(default = "default_shell")]
    pub default_shell: String,

    /// Default fractional CPU count.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Default memory limit in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,

    /// Default PID limit.
    #[serde(default = "default_pid_limit")]
    pub pid_limit: i64,

    /// Whether containers run with a read-only rootfs by default.
    #[serde(default = "default_read_only")]
    pub read_only: bool,

    /// Whether containers run privileged by default (always `false`;
    /// overridable per request, never by configuration).
    #[serde(default)]
    pub privileged: bool,

    /// Extra `--security-opt` values appended after `no-new-privileges:true`.
    #[serde(default)]
    pub security_opts: Vec<String>,

    /// Host ports that may never be bound to, regardless of request.
    #[serde(default)]
    pub blocked_host_ports: Vec<u16>,
}

impl Default for IsolationDefaults {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            default_shell: default_shell(),
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
            pid_limit: default_pid_limit(),
            read_only: default_read_only(),
            privileged: false,
            security_opts: Vec::new(),
            blocked_host_ports: Vec::new(),
        }
    }
}

fn default_image() -> String {
    "debian:bookworm-slim".into()
}

fn default_shell() -> String {
    "/bin/sh".into()
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_memory_limit() -> i64 {
    512 * 1024 * 1024
}

fn default_pid_limit() -> i64 {
    100
}

fn default_read_only() -> bool {
    true
}

/// Task executor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfiguration {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,

    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Ceiling a synchronous verb waits on a task's completion callback
    /// before returning with the workspace left in a transitional state.
    #[serde(default = "default_sync_verb_ceiling_secs")]
    pub sync_verb_ceiling_secs: u64,
}

impl Default for ExecutorConfiguration {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_depth: default_queue_depth(),
            create_timeout_secs: default_create_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            sync_verb_ceiling_secs: default_sync_verb_ceiling_secs(),
        }
    }
}

fn default_worker_count() -> usize {
    3
}

fn default_queue_depth() -> usize {
    100
}

fn default_create_timeout_secs() -> u64 {
    60
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_sync_verb_ceiling_secs() -> u64 {
    8
}

/// Batch coordinator tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfiguration {
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_restart_settle_secs")]
    pub restart_settle_secs: u64,
}

impl Default for BatchConfiguration {
    fn default() -> Self {
        Self {
            concurrency: default_batch_concurrency(),
            restart_settle_secs: default_restart_settle_secs(),
        }
    }
}

fn default_batch_concurrency() -> usize {
    5
}

fn default_restart_settle_secs() -> u64 {
    2
}

/// Error recovery defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfiguration {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

impl Default for RecoveryConfiguration {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = Configuration::default();
        assert_eq!(cfg.label_prefix, "aicli");
        assert_eq!(cfg.isolation.cpu_limit, 1.0);
        assert_eq!(cfg.isolation.memory_limit, 512 * 1024 * 1024);
        assert_eq!(cfg.isolation.pid_limit, 100);
        assert!(cfg.isolation.read_only);
        assert_eq!(cfg.batch.concurrency, 5);
        assert_eq!(cfg.executor.worker_count, 3);
        assert_eq!(cfg.executor.queue_depth, 100);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = Configuration::load("/nonexistent/path/orchestrator.toml").unwrap();
        assert_eq!(cfg.label_prefix, "aicli");
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            label_prefix = "myorg"

            [isolation]
            cpu_limit = 2.0
        "#;
        let cfg: Configuration = toml::from_str(toml).unwrap();
        assert_eq!(cfg.label_prefix, "myorg");
        assert_eq!(cfg.isolation.cpu_limit, 2.0);
        assert_eq!(cfg.isolation.memory_limit, default_memory_limit());
    }
}
