//! Manager configuration
//!
//! Loaded from an optional YAML file; every field has a default.

use crate::error::{AgentError, Result};
use crate::provision::local::DEFAULT_BASE_PORT;
use crate::provision::{LocalProvisioner, ProcessProvisioner, Provisioner};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Which provisioner backs the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    /// Simulated in-process agents
    #[default]
    Local,
    /// Real agent processes
    Process,
}

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Provisioner backing the registry
    pub provisioner: ProvisionerKind,
    /// Agent binary run by the process provisioner
    pub agent_binary: PathBuf,
    /// Root directory for agent data directories
    pub data_dir: PathBuf,
    /// Datacenter every agent joins
    pub datacenter: String,
    /// First port handed out by the local provisioner
    pub base_port: u16,
    /// Seconds to wait for an agent to come up
    pub start_timeout_secs: u64,
    /// Seconds to wait for an agent to exit before killing it
    pub stop_timeout_secs: u64,
    /// Discard agent stdout and stderr
    pub quiet_agents: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            provisioner: ProvisionerKind::default(),
            agent_binary: PathBuf::from("consul"),
            data_dir: dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("agentman"),
            datacenter: "dc1".to_string(),
            base_port: DEFAULT_BASE_PORT,
            start_timeout_secs: 30,
            stop_timeout_secs: 10,
            quiet_agents: true,
        }
    }
}

impl ManagerConfig {
    /// Parse a configuration from YAML text
    pub fn parse_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| AgentError::Yaml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    /// Check the configuration for values no provisioner can work with
    pub fn validate(&self) -> Result<()> {
        if self.datacenter.is_empty() {
            return Err(AgentError::InvalidConfig(
                "datacenter must not be empty".to_string(),
            ));
        }
        if self.start_timeout_secs == 0 || self.stop_timeout_secs == 0 {
            return Err(AgentError::InvalidConfig(
                "timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the configured provisioner
    pub fn build_provisioner(&self) -> Result<Arc<dyn Provisioner>> {
        Ok(match self.provisioner {
            ProvisionerKind::Local => Arc::new(LocalProvisioner::with_base_port(self.base_port)),
            ProvisionerKind::Process => Arc::new(
                ProcessProvisioner::new(&self.agent_binary, &self.data_dir)?.with_timeouts(
                    Duration::from_secs(self.start_timeout_secs),
                    Duration::from_secs(self.stop_timeout_secs),
                ),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.provisioner, ProvisionerKind::Local);
        assert_eq!(config.datacenter, "dc1");
        assert!(config.quiet_agents);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
provisioner: process
agent_binary: /usr/local/bin/consul
start_timeout_secs: 5
"#;

        let config = ManagerConfig::parse_str(yaml).unwrap();
        assert_eq!(config.provisioner, ProvisionerKind::Process);
        assert_eq!(config.agent_binary, PathBuf::from("/usr/local/bin/consul"));
        assert_eq!(config.start_timeout_secs, 5);
        assert_eq!(config.stop_timeout_secs, 10);
        assert_eq!(config.base_port, DEFAULT_BASE_PORT);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            ManagerConfig::parse_str("datacenter: \"\"\n"),
            Err(AgentError::InvalidConfig(_))
        ));
        assert!(matches!(
            ManagerConfig::parse_str("stop_timeout_secs: 0\n"),
            Err(AgentError::InvalidConfig(_))
        ));
        assert!(matches!(
            ManagerConfig::parse_str("provisioner: docker\n"),
            Err(AgentError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("agentman.yaml");
        std::fs::write(&path, "datacenter: east\nbase_port: 21000\n").unwrap();

        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.datacenter, "east");
        assert_eq!(config.base_port, 21000);
    }

    #[test]
    fn test_build_local_provisioner() {
        let config = ManagerConfig {
            base_port: 22000,
            ..Default::default()
        };
        let provisioner = config.build_provisioner().unwrap();

        let process = provisioner
            .provision(crate::provision::NodeConfig::new("a"))
            .unwrap();
        assert_eq!(process.http_addr, "127.0.0.1:22000");
    }
}
