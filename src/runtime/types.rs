//! Wire-adjacent shapes exchanged with the runtime client.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A bind mount from a host path into the container.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// A container-port → host-port binding.
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,

    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub pids_limit: i64,
    pub read_only_rootfs: bool,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<PortSpec>,
    pub network_name: Option<String>,
    /// Restart policy name, e.g. `unless-stopped`.
    pub restart_policy: String,
}

/// A runtime-reported container, projected into the shape the core consumes.
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Raw runtime status string (`running`, `exited`,...).
    pub status: String,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub ports: Vec<PortSpec>,
    pub mounts: Vec<MountSpec>,
    /// Runtime-reported health status, if a healthcheck is configured.
    pub health_status: Option<String>,
}

/// Network creation request.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub attachable: bool,
    pub internal: bool,
    pub labels: HashMap<String, String>,
    /// Optional fixed subnet, used for per-workspace networks.
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub labels: HashMap<String, String>,
}

/// One-shot resource sample, before derived-metric calculation.
#[derive(Debug, Clone, Default)]
pub struct RawStats {
    pub cpu_total_usage: u64,
    pub cpu_system_usage: u64,
    pub prev_cpu_total_usage: u64,
    pub prev_cpu_system_usage: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    /// Page cache portion of `memory_usage`, netted out of the derived stat.
    pub memory_cache: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

/// A raw container lifecycle event as reported by the runtime.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// `container`, `network`,... — only `container` events are forwarded.
    pub kind: String,
    /// `create`, `start`, `stop`, `die`, `destroy`,...
    pub action: String,
    pub actor_id: String,
    pub actor_attributes: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}
