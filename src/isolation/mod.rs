//! C2 — Isolation Builder.
//!
//! Builds an [`IsolationConfig`] from the global container configuration
//! and a per-request [`IsolationOverrides`]. Grounded on
//! `environment/docker/container.rs`'s `HostConfig` assembly, generalized
//! from a fixed per-server resource profile to the workspace-level
//! overrides this spec allows.

use std::collections::HashMap;

use crate::config::IsolationDefaults;
use crate::error::{OrchestratorError, Result};
use crate::runtime::{MountSpec, PortSpec};

/// Capabilities retained after `cap_drop: ["ALL"]`.
const CAPABILITY_ALLOWLIST: &[&str] = &["CHOWN", "SETUID", "SETGID", "DAC_OVERRIDE"];

/// Per-request overrides to the isolation defaults. A `None`/zero
/// value means "use the configured default"; validation rejects negatives.
#[derive(Debug, Clone, Default)]
pub struct IsolationOverrides {
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<i64>,
    /// Requested `container_port -> host_port` bindings. Malformed
    /// container ports are silently skipped; this map only ever
    /// contains port numbers that already parsed, so "malformed" in
    /// practice means a caller-side parse failure before this struct is
    /// constructed.
    pub ports: HashMap<u16, u16>,
    pub privileged: Option<bool>,
    pub read_only: Option<bool>,
}

/// The fully-resolved isolation profile applied to one `container_create`
/// call.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
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
    pub network_name: String,
}

/// Builds [`IsolationConfig`]s from configured defaults and per-call overrides.
pub struct IsolationBuilder {
    defaults: IsolationDefaults,
    blocked_host_ports: Vec<u16>,
}

impl IsolationBuilder {
    pub fn new(defaults: IsolationDefaults) -> Self {
        let blocked_host_ports = defaults.blocked_host_ports.clone();
        Self {
            defaults,
            blocked_host_ports,
        }
    }

    /// Builds the isolation profile for `workspace_id`, binding
    /// `project_path` into `/workspace`.
    pub fn build(
        &self,
        workspace_id: &str,
        project_path: &str,
        overrides: &IsolationOverrides,
    ) -> Result<IsolationConfig> {
        let cpu_limit = self.resolve_cpu_limit(overrides.cpu_limit)?;
        let memory_bytes = self.resolve_memory_limit(overrides.memory_limit)?;
        let privileged = overrides.privileged.unwrap_or(self.defaults.privileged);
        let read_only_rootfs = overrides.read_only.unwrap_or(self.defaults.read_only);

        let cpu_quota = (cpu_limit * 100_000.0).round() as i64;
        let cpu_period = 100_000;

        // Swap is always pinned to memory — swap is never enabled.
        let memory_swap_bytes = memory_bytes;

        let (cap_drop, cap_add) = if privileged {
            (Vec::new(), Vec::new())
        } else {
            (
                vec!["ALL".to_string()],
                CAPABILITY_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            )
        };

        let mut security_opt = vec!["no-new-privileges:true".to_string()];
        security_opt.extend(self.defaults.security_opts.iter().cloned());

        let ports = self.resolve_ports(&overrides.ports);

        Ok(IsolationConfig {
            cpu_quota,
            cpu_period,
            memory_bytes,
            memory_swap_bytes,
            pids_limit: self.defaults.pid_limit,
            read_only_rootfs,
            cap_drop,
            cap_add,
            security_opt,
            mounts: vec![MountSpec {
                source: project_path.to_string(),
                target: "/workspace".to_string(),
                read_only: false,
            }],
            ports,
            network_name: Self::network_name_for_workspace(workspace_id),
        })
    }

    fn resolve_cpu_limit(&self, override_value: Option<f64>) -> Result<f64> {
        match override_value {
            None | Some(0.0) => Ok(self.defaults.cpu_limit),
            Some(v) if v < 0.0 => Err(OrchestratorError::validation("cpu_limit must not be negative")),
            Some(v) => Ok(v),
        }
    }

    fn resolve_memory_limit(&self, override_value: Option<i64>) -> Result<i64> {
        match override_value {
            None | Some(0) => Ok(self.defaults.memory_limit),
            Some(v) if v < 0 => Err(OrchestratorError::validation("memory_limit must not be negative")),
            Some(v) => Ok(v),
        }
    }

    fn resolve_ports(&self, requested: &HashMap<u16, u16>) -> Vec<PortSpec> {
        requested.iter().filter(|(_, host_port)| !self.blocked_host_ports.contains(host_port)).map(|(container_port, host_port)| PortSpec {
                container_port: *container_port,
                host_port: *host_port,
                protocol: "tcp".to_string(),
            }).collect()
    }

    /// Derives a per-workspace network name and subnet from the workspace
    /// id. A bounded hash maps the id to `172.20.N.0/24` (gateway `.1`),
    /// guaranteeing uniqueness within a single host.
    pub fn network_name_for_workspace(workspace_id: &str) -> String {
        format!("workspace-net-{}", Self::subnet_octet(workspace_id))
    }

    pub fn subnet_for_workspace(workspace_id: &str) -> (String, String) {
        let octet = Self::subnet_octet(workspace_id);
        (format!("172.20.{octet}.0/24"), format!("172.20.{octet}.1"))
    }

    fn subnet_octet(workspace_id: &str) -> u8 {
        let mut hash: u32 = 2166136261; // FNV-1a offset basis
        for byte in workspace_id.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(16777619);
        }
        // Reserve.0 and.255 for network/broadcast-adjacent use; keep in [1, 254].
        ((hash % 254) + 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> IsolationBuilder {
        IsolationBuilder::new(IsolationDefaults {
            default_image: "debian".into(),
            default_shell: "/bin/sh".into(),
            cpu_limit: 1.0,
            memory_limit: 512 * 1024 * 1024,
            pid_limit: 100,
            read_only: true,
            privileged: false,
            security_opts: vec![],
            blocked_host_ports: vec![22],
        })
    }

    #[test]
    fn defaults_apply_when_overrides_are_zero() {
        let config = builder().build("ws-1", "/tmp/p", &IsolationOverrides::default()).unwrap();
        assert_eq!(config.cpu_quota, 100_000);
        assert_eq!(config.cpu_period, 100_000);
        assert_eq!(config.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(config.memory_swap_bytes, config.memory_bytes);
        assert_eq!(config.pids_limit, 100);
        assert!(config.cap_drop.contains(&"ALL".to_string()));
    }

    #[test]
    fn resource_limits_scale_with_overrides() {
        let overrides = IsolationOverrides {
            cpu_limit: Some(0.25),
            memory_limit: Some(64 * 1024 * 1024),..Default::default()
        };
        let config = builder().build("ws-1", "/tmp/p", &overrides).unwrap();
        assert_eq!(config.cpu_quota, 25_000);
        assert_eq!(config.cpu_period, 100_000);
        assert_eq!(config.memory_bytes, 67_108_864);
        assert_eq!(config.memory_swap_bytes, 67_108_864);
        assert_eq!(config.pids_limit, 100);
    }

    #[test]
    fn negative_overrides_are_rejected() {
        let overrides = IsolationOverrides {
            cpu_limit: Some(-1.0),..Default::default()
        };
        let err = builder().build("ws-1", "/tmp/p", &overrides).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn blocked_host_ports_are_skipped() {
        let mut ports = HashMap::new();
        ports.insert(8080, 22);
        ports.insert(8081, 9000);
        let overrides = IsolationOverrides {
            ports,..Default::default()
        };
        let config = builder().build("ws-1", "/tmp/p", &overrides).unwrap();
        assert_eq!(config.ports.len(), 1);
        assert_eq!(config.ports[0].host_port, 9000);
    }

    #[test]
    fn privileged_disables_capability_restrictions() {
        let overrides = IsolationOverrides {
            privileged: Some(true),..Default::default()
        };
        let config = builder().build("ws-1", "/tmp/p", &overrides).unwrap();
        assert!(config.cap_drop.is_empty());
        assert!(config.cap_add.is_empty());
    }

    #[test]
    fn network_name_is_deterministic_and_distinct() {
        let a = IsolationBuilder::network_name_for_workspace("ws-1");
        let b = IsolationBuilder::network_name_for_workspace("ws-1");
        let c = IsolationBuilder::network_name_for_workspace("ws-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
