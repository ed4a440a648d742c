//! `bollard`-backed implementation of [`RuntimeClient`].
//!
//! Grounded on the daemon's `DockerService` (one `bollard::Docker` handle,
//! thin pass-through methods) and `environment/docker/container.rs`'s
//! `HostConfig`/`Config` assembly, generalized from per-server container
//! naming to the label-keyed discovery this crate requires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RestartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    HostConfig, Mount, MountBindOptions, MountBindOptionsPropagationEnum, MountTypeEnum,
    PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{classify_bollard_error, OrchestratorError, Result};

use super::types::{
    ContainerSpec, MountSpec, NetworkSpec, NetworkSummary, PortSpec, RawEvent, RawStats,
    RuntimeContainer,
};
use super::RuntimeClient;

/// `RuntimeClient` backed by a live `bollard::Docker` connection.
pub struct BollardRuntimeClient {
    docker: Arc<Docker>,
}

impl BollardRuntimeClient {
    /// Connects to the runtime at `host` (a `unix://` or `npipe://` URI,
    /// or `None` to probe the usual local sockets) and ensures the shared
    /// bridge network named `network_name` exists, creating it if absent
    ///.
    pub async fn connect(
        host: Option<&str>,
        timeout_secs: u64,
        network_name: &str,
    ) -> Result<Self> {
        let docker = match host {
            Some(host) => Docker::connect_with_socket(host, timeout_secs, bollard::API_DEFAULT_VERSION).map_err(|e| classify_bollard_error("connect", e))?,
            None => Docker::connect_with_local_defaults().map_err(|e| classify_bollard_error("connect", e))?,
        };

        let client = Self {
            docker: Arc::new(docker),
        };

        client.ping().await?;
        client.ensure_network(network_name).await?;
        Ok(client)
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self.network_inspect(name).await {
            Ok(_) => {
                debug!("network {} already present", name);
                Ok(())
            }
            Err(e) if e.kind() == crate::error::ErrorKind::ContainerNotFound => {
                let mut labels = HashMap::new();
                labels.insert("managed".to_string(), "true".to_string());
                labels.insert("created".to_string(), Utc::now().to_rfc3339());
                self.network_create(NetworkSpec {
                    name: name.to_string(),
                    driver: "bridge".into(),
                    attachable: true,
                    internal: false,
                    labels,
                    subnet: None,
                    gateway: None,
                }).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let options = CreateImageOptions {
            from_image: image,..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(OrchestratorError::new(
                    crate::error::ErrorKind::ImageNotFound,
                    format!("pull {image}: {e}"),
                ));
            }
        }
        Ok(())
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).ok()
}

fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &spec.ports {
        let key = format!("{}/{}", port.container_port, port.protocol);
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }

    // Recursive-private propagation: changes inside the container's mount
    // namespace never leak back to the host's, or to any other container's.
    let mounts = spec.mounts.iter().map(|m| Mount {
            source: Some(m.source.clone()),
            target: Some(m.target.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(m.read_only),
            bind_options: Some(MountBindOptions {
                propagation: Some(MountBindOptionsPropagationEnum::RPRIVATE),..Default::default()
            }),..Default::default()
        }).collect();

    HostConfig {
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        mounts: Some(mounts),
        memory: Some(spec.memory_bytes),
        memory_swap: Some(spec.memory_swap_bytes),
        cpu_quota: Some(spec.cpu_quota),
        cpu_period: Some(spec.cpu_period),
        pids_limit: Some(spec.pids_limit),
        cap_drop: Some(spec.cap_drop.clone()),
        cap_add: if spec.cap_add.is_empty() {
            None
        } else {
            Some(spec.cap_add.clone())
        },
        security_opt: Some(spec.security_opt.clone()),
        readonly_rootfs: Some(spec.read_only_rootfs),
        network_mode: spec.network_name.clone(),
        restart_policy: Some(RestartPolicy {
            name: Some(match spec.restart_policy.as_str() {
                "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
                "always" => RestartPolicyNameEnum::ALWAYS,
                "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
                _ => RestartPolicyNameEnum::NO,
            }),..Default::default()
        }),..Default::default()
    }
}

#[async_trait]
impl RuntimeClient for BollardRuntimeClient {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map(|_| ()).map_err(|e| classify_bollard_error("ping", e))
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.docker.version().await.map_err(|e| classify_bollard_error("version", e))?;
        Ok(info.version.unwrap_or_default())
    }

    async fn network_list(
        &self,
        label_filters: HashMap<String, String>,
    ) -> Result<Vec<NetworkSummary>> {
        let mut filters = HashMap::new();
        if !label_filters.is_empty() {
            let labels: Vec<String> = label_filters.iter().map(|(k, v)| format!("{k}={v}")).collect();
            filters.insert("label".to_string(), labels);
        }
        let networks = self.docker.list_networks(Some(ListNetworksOptions { filters })).await.map_err(|e| classify_bollard_error("network_list", e))?;

        Ok(networks.into_iter().map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
                labels: n.labels.unwrap_or_default(),
            }).collect())
    }

    async fn network_create(&self, spec: NetworkSpec) -> Result<String> {
        let ipam = if spec.subnet.is_some() {
            Some(bollard::models::Ipam {
                config: Some(vec![bollard::models::IpamConfig {
                    subnet: spec.subnet.clone(),
                    gateway: spec.gateway.clone(),..Default::default()
                }]),..Default::default()
            })
        } else {
            None
        };

        let response = self.docker.create_network(CreateNetworkOptions {
                name: spec.name.clone(),
                driver: spec.driver,
                attachable: spec.attachable,
                internal: spec.internal,
                labels: spec.labels,
                ipam: ipam.unwrap_or_default(),..Default::default()
            }).await.map_err(|e| classify_bollard_error("network_create", e))?;

        Ok(response.id.unwrap_or(spec.name))
    }

    async fn network_inspect(&self, name: &str) -> Result<NetworkSummary> {
        let network = self.docker.inspect_network(name, None::<InspectNetworkOptions<String>>).await.map_err(|e| classify_bollard_error("network_inspect", e))?;

        Ok(NetworkSummary {
            id: network.id.unwrap_or_default(),
            name: network.name.unwrap_or_default(),
            driver: network.driver.unwrap_or_default(),
            labels: network.labels.unwrap_or_default(),
        })
    }

    async fn network_remove(&self, name: &str) -> Result<()> {
        self.docker.remove_network(name).await.map_err(|e| classify_bollard_error("network_remove", e))
    }

    async fn container_create(&self, spec: ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let host_config = build_host_config(&spec);

        let mut exposed_ports = HashMap::new();
        for port in &spec.ports {
            exposed_ports.insert(
                format!("{}/{}", port.container_port, port.protocol),
                HashMap::new(),
            );
        }

        let config = BollardConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await.map_err(|e| classify_bollard_error("container_create", e))?;

        Ok(response.id)
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.docker.start_container(id, None::<bollard::container::StartContainerOptions<String>>).await.map_err(|e| classify_bollard_error("container_start", e))
    }

    async fn container_stop(&self, id: &str, timeout: Duration) -> Result<()> {
        self.docker.stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            ).await.map_err(|e| classify_bollard_error("container_stop", e))
    }

    async fn container_restart(&self, id: &str, timeout: Duration) -> Result<()> {
        self.docker.restart_container(
                id,
                Some(RestartContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            ).await.map_err(|e| classify_bollard_error("container_restart", e))
    }

    async fn container_remove(&self, id: &str, force: bool) -> Result<()> {
        self.docker.remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: false,..Default::default()
                }),
            ).await.map_err(|e| classify_bollard_error("container_remove", e))
    }

    async fn container_inspect(&self, id: &str) -> Result<RuntimeContainer> {
        let inspect = self.docker.inspect_container(id, None::<InspectContainerOptions>).await.map_err(|e| classify_bollard_error("container_inspect", e))?;

        let state = inspect.state.unwrap_or_default();
        let config = inspect.config.unwrap_or_default();
        let host_config = inspect.host_config.clone().unwrap_or_default();

        let mounts = inspect.mounts.unwrap_or_default().into_iter().map(|m| MountSpec {
                source: m.source.unwrap_or_default(),
                target: m.destination.unwrap_or_default(),
                read_only: m.rw.map(|rw| !rw).unwrap_or(false),
            }).collect();

        let ports = host_config.port_bindings.unwrap_or_default().into_iter().filter_map(|(key, bindings)| {
                let mut parts = key.splitn(2, '/');
                let container_port: u16 = parts.next()?.parse().ok()?;
                let protocol = parts.next().unwrap_or("tcp").to_string();
                let binding = bindings?.into_iter().next()?;
                let host_port: u16 = binding.host_port?.parse().ok()?;
                Some(PortSpec {
                    container_port,
                    host_port,
                    protocol,
                })
            }).collect();

        Ok(RuntimeContainer {
            id: inspect.id.unwrap_or_default(),
            name: inspect.name.unwrap_or_default().trim_start_matches('/').to_string(),
            image: config.image.unwrap_or_default(),
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            created_at: inspect.created.as_deref().and_then(parse_time).unwrap_or_else(Utc::now),
            started_at: state.started_at.as_deref().and_then(parse_time),
            finished_at: state.finished_at.as_deref().and_then(parse_time),
            exit_code: state.exit_code,
            ports,
            mounts,
            health_status: state.health.and_then(|h| h.status).map(|s| s.to_string()),
        })
    }

    async fn container_list(
        &self,
        label_filters: HashMap<String, String>,
    ) -> Result<Vec<RuntimeContainer>> {
        let mut filters = HashMap::new();
        if !label_filters.is_empty() {
            let labels: Vec<String> = label_filters.iter().map(|(k, v)| format!("{k}={v}")).collect();
            filters.insert("label".to_string(), labels);
        }

        let summaries = self.docker.list_containers(Some(ListContainersOptions {
                all: true,
                filters,..Default::default()
            })).await.map_err(|e| classify_bollard_error("container_list", e))?;

        let mut out = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(id) = summary.id {
                out.push(self.container_inspect(&id).await?);
            }
        }
        Ok(out)
    }

    async fn container_stats(&self, id: &str) -> Result<RawStats> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        let sample = stream.next().await.ok_or_else(|| OrchestratorError::not_found(format!("no stats for {id}")))?.map_err(|e| classify_bollard_error("container_stats", e))?;

        let memory_usage = sample.memory_stats.usage.unwrap_or(0);
        let memory_cache = sample.memory_stats.stats.and_then(|s| match s {
                bollard::container::MemoryStatsStats::V1(v1) => Some(v1.cache),
                bollard::container::MemoryStatsStats::V2(v2) => Some(v2.inactive_file),
            }).unwrap_or(0);

        let mut rx_bytes = 0u64;
        let mut tx_bytes = 0u64;
        if let Some(networks) = &sample.networks {
            for net in networks.values() {
                rx_bytes += net.rx_bytes;
                tx_bytes += net.tx_bytes;
            }
        }

        let (block_read, block_write) = sample.blkio_stats.io_service_bytes_recursive.unwrap_or_default().into_iter().fold((0u64, 0u64), |(r, w), entry| {
                let value = entry.value;
                match entry.op.to_lowercase().as_str() {
                    "read" => (r + value, w),
                    "write" => (r, w + value),
                    _ => (r, w),
                }
            });

        Ok(RawStats {
            cpu_total_usage: sample.cpu_stats.cpu_usage.total_usage,
            cpu_system_usage: sample.cpu_stats.system_cpu_usage.unwrap_or(0),
            prev_cpu_total_usage: sample.precpu_stats.cpu_usage.total_usage,
            prev_cpu_system_usage: sample.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: sample.cpu_stats.online_cpus.unwrap_or_else(|| num_cpus::get() as u64),
            memory_usage,
            memory_limit: sample.memory_stats.limit.unwrap_or(0),
            memory_cache,
            rx_bytes,
            tx_bytes,
            block_read,
            block_write,
            pids: sample.pids_stats.current.unwrap_or(0),
        })
    }

    fn container_events(&self, label_filter: Option<(String, String)>) -> mpsc::Receiver<Result<RawEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            if let Some((key, value)) = &label_filter {
                filters.insert("label".to_string(), vec![format!("{key}={value}")]);
            }

            let mut stream = docker.events(Some(EventsOptions::<String> {
                filters,..Default::default()
            }));

            while let Some(result) = stream.next().await {
                let mapped = match result {
                    Ok(msg) => Ok(RawEvent {
                        kind: msg.typ.map(|t| t.to_string()).unwrap_or_default(),
                        action: msg.action.unwrap_or_default(),
                        actor_id: msg.actor.as_ref().and_then(|a| a.id.clone()).unwrap_or_default(),
                        actor_attributes: msg.actor.and_then(|a| a.attributes).unwrap_or_default(),
                        timestamp: msg.time.and_then(|t| Utc.timestamp_opt(t, 0).single()).unwrap_or_else(Utc::now),
                    }),
                    Err(e) => Err(classify_bollard_error("container_events", e)),
                };

                if tx.send(mapped).await.is_err() {
                    warn!("event receiver dropped, stopping event pump");
                    break;
                }
            }
        });

        rx
    }
}
