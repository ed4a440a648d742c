//! C1 — Runtime Client Facade.
//!
//! A thin, trait-based contract over the container runtime. The
//! trait holds no workspace logic: it knows about networks, containers,
//! events, and stats, and nothing about workspaces, isolation policy, or
//! storage. Every other component (C2–C9) depends on [`RuntimeClient`],
//! never on the concrete client, so unit tests can substitute
//! [`fake::FakeRuntimeClient`] for a live `bollard::Docker` connection.

mod client;
pub mod fake;
mod types;

pub use client::BollardRuntimeClient;
pub use types::{
    ContainerSpec, MountSpec, NetworkSpec, NetworkSummary, PortSpec, RawEvent, RawStats,
    RuntimeContainer,
};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Contract over the container runtime.
///
/// Implementations are expected to ping the daemon and ensure the shared
/// bridge network exists at construction time; that step lives on the
/// concrete constructors (see [`BollardRuntimeClient::connect`]), not on
/// the trait, since it is a one-time setup step rather than a per-call
/// capability.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Checks that the daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Daemon version string, for diagnostics.
    async fn server_version(&self) -> Result<String>;

    async fn network_list(&self, label_filters: HashMap<String, String>) -> Result<Vec<NetworkSummary>>;

    /// Creates a network, returning its runtime-assigned id.
    async fn network_create(&self, spec: NetworkSpec) -> Result<String>;

    async fn network_inspect(&self, name: &str) -> Result<NetworkSummary>;

    async fn network_remove(&self, name: &str) -> Result<()>;

    /// Creates a container, returning its runtime-assigned id. Never starts it.
    async fn container_create(&self, spec: ContainerSpec) -> Result<String>;

    async fn container_start(&self, id: &str) -> Result<()>;

    async fn container_stop(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn container_restart(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn container_remove(&self, id: &str, force: bool) -> Result<()>;

    async fn container_inspect(&self, id: &str) -> Result<RuntimeContainer>;

    /// Lists containers matching every key/value pair in `label_filters`.
    /// Implementations must never list by any other criterion
    /// ("label-keyed discovery is a strict contract").
    async fn container_list(&self, label_filters: HashMap<String, String>) -> Result<Vec<RuntimeContainer>>;

    /// One-shot resource stats read for a single container.
    async fn container_stats(&self, id: &str) -> Result<RawStats>;

    /// Subscribes to the daemon-wide container event stream, filtered
    /// server-side to `type=container` and (when given) one label
    /// key/value pair. Spawns an internal forwarding task; the receiver
    /// yields `Err` entries for stream-level failures without closing the
    /// channel, so the caller (C4) can apply its own reconnect policy.
    fn container_events(&self, label_filter: Option<(String, String)>) -> mpsc::Receiver<Result<RawEvent>>;
}
