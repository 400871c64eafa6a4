//! Agent configuration
//!
//! [`NodeConfig`] is what configuration callbacks mutate before an agent is
//! provisioned. It serializes to the agent's JSON config-file shape.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Listening ports of one agent. A value of 0 lets the provisioner pick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// HTTP API port
    pub http: u16,
    /// HTTPS API port
    pub https: u16,
    /// DNS port
    pub dns: u16,
    /// LAN gossip port
    pub serf_lan: u16,
    /// WAN gossip port
    pub serf_wan: u16,
    /// Server RPC port
    pub server: u16,
}

impl PortConfig {
    /// Mutable references to every port, for allocation passes
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut u16> {
        [
            &mut self.http,
            &mut self.https,
            &mut self.dns,
            &mut self.serf_lan,
            &mut self.serf_wan,
            &mut self.server,
        ]
        .into_iter()
    }
}

/// Consensus timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Scaling factor for raft timing; 1 is the fastest
    pub raft_multiplier: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { raft_multiplier: 1 }
    }
}

/// Configuration of a single agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Agent node name
    pub node_name: String,
    /// Agent node ID
    pub node_id: String,
    /// Datacenter the agent belongs to
    pub datacenter: String,
    /// Run in server mode
    pub server: bool,
    /// Bootstrap a new cluster with this agent as its seed
    pub bootstrap: bool,
    /// Address to bind to
    pub bind_addr: String,
    /// Listening ports
    pub ports: PortConfig,
    /// Performance tuning
    pub performance: PerformanceConfig,
    /// Disable the periodic update check
    pub disable_update_check: bool,
    /// Agent log level
    pub log_level: String,
    /// Data directory, set by the provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Discard the agent's stdout and stderr
    #[serde(skip)]
    pub quiet: bool,
}

impl NodeConfig {
    /// Default configuration for an agent called `name`
    pub fn new(name: &str) -> Self {
        Self {
            node_name: name.to_string(),
            node_id: Uuid::new_v4().to_string(),
            datacenter: "dc1".to_string(),
            server: true,
            bootstrap: true,
            bind_addr: "127.0.0.1".to_string(),
            ports: PortConfig::default(),
            performance: PerformanceConfig::default(),
            disable_update_check: true,
            log_level: "debug".to_string(),
            data_dir: None,
            quiet: false,
        }
    }
}

/// Default per-member configuration for clusters.
///
/// Only member 0 bootstraps; every other member waits to be joined.
pub fn default_cluster_config(_cluster: &str, index: usize, config: &mut NodeConfig) {
    config.performance.raft_multiplier = 1;
    config.disable_update_check = false;
    config.bootstrap = index == 0;
}
