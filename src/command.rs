//! Text command front end
//!
//! Each input line is one command, parsed with clap and dispatched to the
//! registry. The rendered output is returned as text; failures come back as
//! errors for the caller to print.

use crate::agent::AgentRegistry;
use crate::config::ManagerConfig;
use crate::error::{AgentError, HandleKind, Result};
use crate::provision::{default_cluster_config, NodeConfig};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

const NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]*$";

#[derive(Parser, Debug)]
#[command(name = "agentman", no_binary_name = true, disable_version_flag = true)]
struct CommandLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, stop or inspect a stand-alone instance
    Instance {
        /// Instance name
        #[arg(long)]
        name: String,
        /// Stop the instance
        #[arg(long, conflicts_with = "dump_config")]
        stop: bool,
        /// Print the instance configuration
        #[arg(long)]
        dump_config: bool,
    },

    /// Create, resize, stop or inspect a cluster
    Cluster {
        /// Cluster name
        #[arg(long)]
        name: String,
        /// Number of members to create the cluster with
        #[arg(long, default_value_t = 3)]
        size: usize,
        /// Add members to the cluster
        #[arg(long, conflicts_with_all = ["shrink", "stop", "dump_config", "members"])]
        grow: Option<usize>,
        /// Remove the most recently added members
        #[arg(long, conflicts_with_all = ["stop", "dump_config", "members"])]
        shrink: Option<usize>,
        /// Stop the cluster
        #[arg(long, conflicts_with_all = ["dump_config", "members"])]
        stop: bool,
        /// Print the configuration of every member
        #[arg(long, conflicts_with = "members")]
        dump_config: bool,
        /// Print the members known to the bootstrap agent
        #[arg(long)]
        members: bool,
    },

    /// List registered instances and clusters
    List,
}

/// Dispatches text commands to a registry
pub struct CommandAdapter {
    registry: Arc<AgentRegistry>,
    datacenter: String,
    quiet: bool,
    name_pattern: Regex,
}

impl CommandAdapter {
    /// Create an adapter applying `config`'s agent settings to new agents
    pub fn new(registry: Arc<AgentRegistry>, config: &ManagerConfig) -> Result<Self> {
        let name_pattern =
            Regex::new(NAME_PATTERN).map_err(|e| AgentError::Internal(e.to_string()))?;

        Ok(Self {
            registry,
            datacenter: config.datacenter.clone(),
            quiet: config.quiet_agents,
            name_pattern,
        })
    }

    /// Registry commands are dispatched to
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Run one command line and return its output
    pub fn execute(&self, line: &str) -> Result<String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            return Ok(String::new());
        }

        let parsed = match CommandLine::try_parse_from(words) {
            Ok(parsed) => parsed,
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand) => {
                return Ok(e.to_string().trim_end().to_string());
            }
            Err(e) => return Err(AgentError::InvalidCommand(e.to_string().trim_end().to_string())),
        };

        debug!("Executing {:?}", parsed.command);

        match parsed.command {
            Command::Instance {
                name,
                stop,
                dump_config,
            } => {
                self.check_name(&name)?;
                if stop {
                    self.stop_instance(&name)
                } else if dump_config {
                    self.dump_instance(&name)
                } else {
                    self.create_instance(&name)
                }
            }
            Command::Cluster {
                name,
                size,
                grow,
                shrink,
                stop,
                dump_config,
                members,
            } => {
                self.check_name(&name)?;
                if let Some(n) = grow {
                    self.grow_cluster(&name, n)
                } else if let Some(n) = shrink {
                    self.shrink_cluster(&name, n)
                } else if stop {
                    self.stop_cluster(&name)
                } else if dump_config {
                    self.dump_cluster(&name)
                } else if members {
                    self.cluster_members(&name)
                } else {
                    self.create_cluster(&name, size)
                }
            }
            Command::List => Ok(self.list()),
        }
    }

    /// Stop every registered instance and cluster
    pub fn shutdown(&self) -> Result<()> {
        self.registry.stop_all()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.name_pattern.is_match(name) {
            Ok(())
        } else {
            Err(AgentError::InvalidCommand(format!("invalid name \"{}\"", name)))
        }
    }

    fn apply_defaults(&self, config: &mut NodeConfig) {
        config.datacenter = self.datacenter.clone();
        config.quiet = self.quiet;
    }

    fn configure_member(&self, cluster: &str, index: usize, config: &mut NodeConfig) {
        default_cluster_config(cluster, index, config);
        self.apply_defaults(config);
    }

    fn create_instance(&self, name: &str) -> Result<String> {
        let node = self
            .registry
            .create_single(name, |conf| self.apply_defaults(conf))?;
        Ok(serde_json::to_string(&node.config()?)?)
    }

    fn stop_instance(&self, name: &str) -> Result<String> {
        if self.registry.single(name).is_none() {
            return Err(not_found(HandleKind::Instance, name));
        }
        self.registry.stop_single(name)?;
        Ok(format!("Stopped instance {}", name))
    }

    fn dump_instance(&self, name: &str) -> Result<String> {
        match self.registry.single(name) {
            Some(node) => Ok(serde_json::to_string(&node.config()?)?),
            None => Ok("{}".to_string()),
        }
    }

    fn create_cluster(&self, name: &str, size: usize) -> Result<String> {
        self.registry.create_cluster(name, size, |cluster, index, conf| {
            self.configure_member(cluster, index, conf)
        })?;
        self.dump_cluster(name)
    }

    fn grow_cluster(&self, name: &str, n: usize) -> Result<String> {
        let cluster = self
            .registry
            .cluster(name)
            .ok_or_else(|| not_found(HandleKind::Cluster, name))?;

        cluster.grow(n, |cluster, index, conf| {
            self.configure_member(cluster, index, conf)
        })?;
        Ok(format!("Cluster {} now has {} members", name, cluster.size()))
    }

    fn shrink_cluster(&self, name: &str, n: usize) -> Result<String> {
        let cluster = self
            .registry
            .cluster(name)
            .ok_or_else(|| not_found(HandleKind::Cluster, name))?;

        let result = cluster.shrink(n);
        if cluster.is_stopped() {
            // Nothing left to manage; a namesake created since the lookup stays
            self.registry.forget_cluster(&cluster)?;
            result?;
            return Ok(format!("Stopped cluster {}", name));
        }

        result?;
        Ok(format!("Cluster {} now has {} members", name, cluster.size()))
    }

    fn stop_cluster(&self, name: &str) -> Result<String> {
        if self.registry.cluster(name).is_none() {
            return Err(not_found(HandleKind::Cluster, name));
        }
        self.registry.stop_cluster(name)?;
        Ok(format!("Stopped cluster {}", name))
    }

    fn dump_cluster(&self, name: &str) -> Result<String> {
        let Some(cluster) = self.registry.cluster(name) else {
            return Ok("[]".to_string());
        };

        let configs = cluster
            .members()?
            .iter()
            .map(|member| member.config())
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_string(&configs)?)
    }

    fn cluster_members(&self, name: &str) -> Result<String> {
        let cluster = self
            .registry
            .cluster(name)
            .ok_or_else(|| not_found(HandleKind::Cluster, name))?;

        let mut members = cluster.member_at(0)?.client()?.members()?;
        members.sort();
        Ok(serde_json::to_string(&members)?)
    }

    fn list(&self) -> String {
        format!(
            "Instances: [{}]; Clusters: [{}]",
            quoted(&self.registry.single_names()),
            quoted(&self.registry.cluster_names())
        )
    }
}

fn not_found(kind: HandleKind, name: &str) -> AgentError {
    AgentError::NotFound {
        kind,
        name: name.to_string(),
    }
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("\"{}\"", n))
        .collect::<Vec<_>>()
        .join(", ")
}
