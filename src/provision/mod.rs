//! Agent provisioning
//!
//! The lifecycle engine never starts agents itself. It goes through a
//! [`Provisioner`], which starts and tears down agent processes and hands out
//! [`AgentClient`] bindings for their HTTP API.

pub mod config;
pub mod local;
pub mod process;

pub use config::{default_cluster_config, NodeConfig, PerformanceConfig, PortConfig};
pub use local::LocalProvisioner;
pub use process::{HttpAgentClient, ProcessProvisioner};

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of address an agent exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// HTTP API
    Http,
    /// HTTPS API
    Https,
    /// LAN gossip, used for joining cluster members
    Lan,
    /// WAN gossip
    Wan,
}

/// A running agent as reported by its provisioner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProcess {
    /// Provisioner-assigned process ID
    pub id: String,
    /// Agent name
    pub name: String,
    /// HTTP API address
    pub http_addr: String,
    /// HTTPS API address
    pub https_addr: String,
    /// LAN gossip address
    pub lan_addr: String,
    /// WAN gossip address
    pub wan_addr: String,
    /// Effective configuration, ports resolved
    pub config: NodeConfig,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
}

impl AgentProcess {
    /// Address of the given kind
    pub fn address(&self, kind: AddressKind) -> &str {
        match kind {
            AddressKind::Http => &self.http_addr,
            AddressKind::Https => &self.https_addr,
            AddressKind::Lan => &self.lan_addr,
            AddressKind::Wan => &self.wan_addr,
        }
    }
}

/// Starts and stops agent processes
pub trait Provisioner: Send + Sync {
    /// Start an agent with the given configuration
    fn provision(&self, config: NodeConfig) -> Result<AgentProcess>;

    /// Stop an agent and release its resources
    fn teardown(&self, process: &AgentProcess) -> Result<()>;

    /// Create an API client for the agent listening on `http_addr`
    fn bind_client(&self, http_addr: &str) -> Result<Arc<dyn AgentClient>>;
}

/// API client bound to one agent
pub trait AgentClient: Send + Sync {
    /// Ask the agent to join the agent gossiping on `address`
    fn join(&self, address: &str, wan: bool) -> Result<()>;

    /// Names of the members this agent knows about
    fn members(&self) -> Result<Vec<String>>;
}
