//! In-process simulated agents
//!
//! [`LocalProvisioner`] keeps a table of fake agents instead of spawning
//! processes. Joins merge the member sets of the two agents involved, so the
//! resulting topology can be inspected. Failures can be injected per agent
//! name, which is how the lifecycle engine is exercised in tests.

use super::{AgentClient, AgentProcess, NodeConfig, Provisioner};
use crate::error::{AgentError, Result};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// First port handed out by default
pub const DEFAULT_BASE_PORT: u16 = 18500;

/// A simulated agent
#[derive(Debug)]
struct SimAgent {
    name: String,
    http_addr: String,
    lan_addr: String,
    wan_addr: String,
    members: BTreeSet<String>,
}

/// Injected failures, keyed by agent name
#[derive(Debug, Default)]
struct Faults {
    provision: HashSet<String>,
    bind: HashSet<String>,
    join: HashSet<String>,
    teardown: HashSet<String>,
}

#[derive(Debug)]
struct LocalState {
    next_port: u16,
    agents: HashMap<String, SimAgent>,
    faults: Faults,
}

impl LocalState {
    fn allocate_port(&mut self) -> Result<u16> {
        let port = self.next_port;
        self.next_port = self
            .next_port
            .checked_add(1)
            .ok_or_else(|| AgentError::Internal("Local port range exhausted".to_string()))?;
        Ok(port)
    }

    fn find_by_http(&self, http_addr: &str) -> Option<&SimAgent> {
        self.agents.values().find(|a| a.http_addr == http_addr)
    }
}

/// Provisioner backed by simulated in-process agents
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    state: Arc<Mutex<LocalState>>,
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProvisioner {
    /// Create a provisioner allocating ports from [`DEFAULT_BASE_PORT`]
    pub fn new() -> Self {
        Self::with_base_port(DEFAULT_BASE_PORT)
    }

    /// Create a provisioner allocating ports from `base_port`
    pub fn with_base_port(base_port: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalState {
                next_port: base_port,
                agents: HashMap::new(),
                faults: Faults::default(),
            })),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, LocalState>> {
        self.state
            .lock()
            .map_err(|_| AgentError::Lock("Failed to acquire local provisioner lock".to_string()))
    }

    fn inspect(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of all running agents, sorted
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inspect()
            .agents
            .values()
            .map(|a| a.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Members known to the running agent `name`, sorted
    pub fn members_of(&self, name: &str) -> Option<Vec<String>> {
        self.inspect()
            .agents
            .values()
            .find(|a| a.name == name)
            .map(|a| a.members.iter().cloned().collect())
    }

    /// Make provisioning of agent `name` fail
    pub fn fail_provision(&self, name: &str) {
        self.inspect().faults.provision.insert(name.to_string());
    }

    /// Make client binding for agent `name` fail
    pub fn fail_bind(&self, name: &str) {
        self.inspect().faults.bind.insert(name.to_string());
    }

    /// Make every join targeting agent `name` fail
    pub fn fail_join(&self, name: &str) {
        self.inspect().faults.join.insert(name.to_string());
    }

    /// Make teardown of agent `name` fail; the agent keeps running
    pub fn fail_teardown(&self, name: &str) {
        self.inspect().faults.teardown.insert(name.to_string());
    }

    /// Remove every injected failure
    pub fn clear_faults(&self) {
        self.inspect().faults = Faults::default();
    }
}

impl Provisioner for LocalProvisioner {
    fn provision(&self, mut config: NodeConfig) -> Result<AgentProcess> {
        let mut state = self.state()?;
        let name = config.node_name.clone();

        if state.faults.provision.contains(&name) {
            return Err(AgentError::provision(&name, "injected provisioning failure"));
        }

        for port in config.ports.iter_mut() {
            if *port == 0 {
                *port = state.allocate_port()?;
            }
        }

        let host = config.bind_addr.clone();
        let id = Uuid::new_v4().to_string();
        let process = AgentProcess {
            id: id.clone(),
            name: name.clone(),
            http_addr: format!("{}:{}", host, config.ports.http),
            https_addr: format!("{}:{}", host, config.ports.https),
            lan_addr: format!("{}:{}", host, config.ports.serf_lan),
            wan_addr: format!("{}:{}", host, config.ports.serf_wan),
            config,
            started_at: Utc::now(),
        };

        state.agents.insert(
            id,
            SimAgent {
                name: name.clone(),
                http_addr: process.http_addr.clone(),
                lan_addr: process.lan_addr.clone(),
                wan_addr: process.wan_addr.clone(),
                members: BTreeSet::from([name]),
            },
        );

        debug!("Simulated agent {} listening on {}", process.name, process.http_addr);
        Ok(process)
    }

    fn teardown(&self, process: &AgentProcess) -> Result<()> {
        let mut state = self.state()?;

        if state.faults.teardown.contains(&process.name) {
            return Err(AgentError::provision(&process.name, "injected teardown failure"));
        }

        state
            .agents
            .remove(&process.id)
            .ok_or_else(|| AgentError::provision(&process.name, "agent is not running"))?;

        for agent in state.agents.values_mut() {
            agent.members.remove(&process.name);
        }

        debug!("Simulated agent {} stopped", process.name);
        Ok(())
    }

    fn bind_client(&self, http_addr: &str) -> Result<Arc<dyn AgentClient>> {
        let state = self.state()?;

        let agent = state.find_by_http(http_addr).ok_or_else(|| {
            AgentError::Client(format!("No agent listening on {}", http_addr))
        })?;

        if state.faults.bind.contains(&agent.name) {
            return Err(AgentError::provision(&agent.name, "injected client binding failure"));
        }

        Ok(Arc::new(LocalAgentClient {
            http_addr: http_addr.to_string(),
            state: self.state.clone(),
        }))
    }
}

/// Client bound to one simulated agent
struct LocalAgentClient {
    http_addr: String,
    state: Arc<Mutex<LocalState>>,
}

impl LocalAgentClient {
    fn state(&self) -> Result<MutexGuard<'_, LocalState>> {
        self.state
            .lock()
            .map_err(|_| AgentError::Lock("Failed to acquire local provisioner lock".to_string()))
    }
}

impl AgentClient for LocalAgentClient {
    fn join(&self, address: &str, wan: bool) -> Result<()> {
        let mut state = self.state()?;

        let source = state.find_by_http(&self.http_addr).ok_or_else(|| {
            AgentError::Client(format!("Agent at {} is not running", self.http_addr))
        })?;

        let target = state
            .agents
            .values()
            .find(|a| if wan { a.wan_addr == address } else { a.lan_addr == address })
            .ok_or_else(|| AgentError::Client(format!("No agent gossiping on {}", address)))?;

        if state.faults.join.contains(&target.name) {
            return Err(AgentError::Client(format!(
                "Join to {} ({}) refused",
                target.name, address
            )));
        }

        let merged: BTreeSet<String> = source.members.union(&target.members).cloned().collect();

        for agent in state.agents.values_mut() {
            if merged.contains(&agent.name) {
                agent.members = merged.clone();
            }
        }

        Ok(())
    }

    fn members(&self) -> Result<Vec<String>> {
        let state = self.state()?;

        state
            .find_by_http(&self.http_addr)
            .map(|a| a.members.iter().cloned().collect())
            .ok_or_else(|| AgentError::Client(format!("Agent at {} is not running", self.http_addr)))
    }
}
