//! Single agent handles

use crate::error::{AgentError, HandleKind, Result};
use crate::provision::{AddressKind, AgentClient, AgentProcess, NodeConfig, Provisioner};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// A live agent and its API binding
struct LiveNode {
    process: AgentProcess,
    client: Arc<dyn AgentClient>,
}

/// Handle to one provisioned agent.
///
/// The handle starts live and becomes defunct on its first [`stop`](Self::stop),
/// whether or not the teardown succeeded. Every accessor except
/// [`name`](Self::name) and [`is_defunct`](Self::is_defunct) then fails with
/// [`AgentError::Defunct`].
pub struct NodeHandle {
    name: String,
    provisioner: Arc<dyn Provisioner>,
    live: Mutex<Option<LiveNode>>,
}

impl NodeHandle {
    /// Provision a new agent called `name`, letting `configure` adjust its config
    pub fn create<F>(name: &str, provisioner: Arc<dyn Provisioner>, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut NodeConfig),
    {
        let mut config = NodeConfig::new(name);
        configure(&mut config);

        let process = provisioner.provision(config)?;

        let client = match provisioner.bind_client(&process.http_addr) {
            Ok(client) => client,
            Err(e) => {
                if let Err(teardown) = provisioner.teardown(&process) {
                    warn!("Failed to tear down {} after client error: {}", name, teardown);
                }
                return Err(e);
            }
        };

        info!("Instance {} started on {}", name, process.http_addr);

        Ok(Self {
            name: name.to_string(),
            provisioner,
            live: Mutex::new(Some(LiveNode { process, client })),
        })
    }

    fn live(&self) -> Result<MutexGuard<'_, Option<LiveNode>>> {
        self.live
            .lock()
            .map_err(|_| AgentError::Lock(format!("Failed to acquire lock on instance {}", self.name)))
    }

    fn with_live<T>(&self, f: impl FnOnce(&LiveNode) -> T) -> Result<T> {
        let live = self.live()?;
        live.as_ref()
            .map(f)
            .ok_or_else(|| AgentError::defunct(HandleKind::Instance, &self.name))
    }

    /// Agent name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the given kind
    pub fn address(&self, kind: AddressKind) -> Result<String> {
        self.with_live(|node| node.process.address(kind).to_string())
    }

    /// HTTP API address
    pub fn http_addr(&self) -> Result<String> {
        self.address(AddressKind::Http)
    }

    /// HTTPS API address
    pub fn https_addr(&self) -> Result<String> {
        self.address(AddressKind::Https)
    }

    /// LAN gossip address
    pub fn lan_addr(&self) -> Result<String> {
        self.address(AddressKind::Lan)
    }

    /// WAN gossip address
    pub fn wan_addr(&self) -> Result<String> {
        self.address(AddressKind::Wan)
    }

    /// API client bound to this agent
    pub fn client(&self) -> Result<Arc<dyn AgentClient>> {
        self.with_live(|node| node.client.clone())
    }

    /// Effective configuration the agent was started with
    pub fn config(&self) -> Result<NodeConfig> {
        self.with_live(|node| node.process.config.clone())
    }

    /// Process descriptor reported by the provisioner
    pub fn process(&self) -> Result<AgentProcess> {
        self.with_live(|node| node.process.clone())
    }

    /// Stop the agent.
    ///
    /// Stopping a defunct handle is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut live = self.live()?;

        let Some(node) = live.take() else {
            debug!("Instance {} already stopped", self.name);
            return Ok(());
        };

        let result = self.provisioner.teardown(&node.process);
        match &result {
            Ok(()) => info!("Instance {} stopped", self.name),
            Err(e) => warn!("Instance {} did not stop cleanly: {}", self.name, e),
        }
        result
    }

    /// Whether the handle has been stopped
    pub fn is_defunct(&self) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.name)
            .field("defunct", &self.is_defunct())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::LocalProvisioner;

    fn provisioner() -> (LocalProvisioner, Arc<dyn Provisioner>) {
        let local = LocalProvisioner::new();
        let shared: Arc<dyn Provisioner> = Arc::new(local.clone());
        (local, shared)
    }

    #[test]
    fn test_create_applies_config_callback() {
        let (_, provisioner) = provisioner();
        let node = NodeHandle::create("s1", provisioner, |conf| {
            conf.datacenter = "dc9".to_string();
            conf.quiet = true;
        })
        .unwrap();

        assert_eq!(node.name(), "s1");
        assert!(!node.is_defunct());

        let config = node.config().unwrap();
        assert_eq!(config.datacenter, "dc9");
        assert_eq!(node.http_addr().unwrap(), format!("127.0.0.1:{}", config.ports.http));
        assert_ne!(node.lan_addr().unwrap(), node.wan_addr().unwrap());
    }

    #[test]
    fn test_bind_failure_leaves_no_orphan() {
        let (local, provisioner) = provisioner();
        local.fail_bind("s1");

        let result = NodeHandle::create("s1", provisioner, |_| {});

        assert!(matches!(result, Err(AgentError::Provision { .. })));
        assert!(local.running().is_empty());
    }

    #[test]
    fn test_provision_failure_is_surfaced() {
        let (local, provisioner) = provisioner();
        local.fail_provision("s1");

        let err = NodeHandle::create("s1", provisioner, |_| {}).unwrap_err();
        assert!(matches!(err, AgentError::Provision { ref name, .. } if name == "s1"));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (local, provisioner) = provisioner();
        let node = NodeHandle::create("s1", provisioner, |_| {}).unwrap();

        node.stop().unwrap();
        assert!(node.is_defunct());
        assert!(local.running().is_empty());

        node.stop().unwrap();
        assert!(node.is_defunct());
    }

    #[test]
    fn test_accessors_fail_after_stop() {
        let (_, provisioner) = provisioner();
        let node = NodeHandle::create("s1", provisioner, |_| {}).unwrap();
        node.stop().unwrap();

        for kind in [AddressKind::Http, AddressKind::Https, AddressKind::Lan, AddressKind::Wan] {
            let err = node.address(kind).unwrap_err();
            assert!(err.is_fatal());
        }
        assert!(node.client().err().unwrap().is_fatal());
        assert!(node.config().unwrap_err().is_fatal());
        assert!(node.process().unwrap_err().is_fatal());
        assert_eq!(node.name(), "s1");
    }

    #[test]
    fn test_failed_teardown_still_marks_defunct() {
        let (local, provisioner) = provisioner();
        let node = NodeHandle::create("s1", provisioner, |_| {}).unwrap();
        local.fail_teardown("s1");

        assert!(node.stop().is_err());
        assert!(node.is_defunct());

        // No second teardown attempt
        assert!(node.stop().is_ok());
        assert_eq!(local.running(), vec!["s1".to_string()]);
    }
}
