//! Named registry of instances and clusters

use super::cluster::ClusterHandle;
use super::node::NodeHandle;
use crate::aggregate::ErrorAggregator;
use crate::error::{AgentError, HandleKind, Result};
use crate::provision::{NodeConfig, Provisioner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{info, warn};

#[derive(Default)]
struct Handles {
    singles: HashMap<String, Arc<NodeHandle>>,
    clusters: HashMap<String, Arc<ClusterHandle>>,
}

impl Handles {
    /// Singles and clusters share one namespace
    fn ensure_unused(&self, kind: HandleKind, name: &str) -> Result<()> {
        let holder = if self.singles.contains_key(name) {
            Some(HandleKind::Instance)
        } else if self.clusters.contains_key(name) {
            Some(HandleKind::Cluster)
        } else {
            None
        };

        match holder {
            Some(holder) => {
                if holder != kind {
                    warn!("Refusing {} {}: name is held by a {}", kind, name, holder);
                }
                Err(AgentError::DuplicateName {
                    kind: holder,
                    name: name.to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

/// Registry owning every named instance and cluster of one process
pub struct AgentRegistry {
    provisioner: Arc<dyn Provisioner>,
    handles: Mutex<Handles>,
}

impl AgentRegistry {
    /// Create an empty registry provisioning through `provisioner`
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            handles: Mutex::new(Handles::default()),
        }
    }

    fn handles(&self) -> Result<MutexGuard<'_, Handles>> {
        self.handles
            .lock()
            .map_err(|_| AgentError::Lock("Failed to acquire registry lock".to_string()))
    }

    /// Start and register a stand-alone instance
    pub fn create_single<F>(&self, name: &str, configure: F) -> Result<Arc<NodeHandle>>
    where
        F: FnOnce(&mut NodeConfig),
    {
        let mut handles = self.handles()?;
        handles.ensure_unused(HandleKind::Instance, name)?;

        let node = Arc::new(NodeHandle::create(name, self.provisioner.clone(), configure)?);
        handles.singles.insert(name.to_string(), node.clone());

        info!("Registered instance {}", name);
        Ok(node)
    }

    /// Start and register a cluster of `size` instances
    pub fn create_cluster<F>(&self, name: &str, size: usize, configure: F) -> Result<Arc<ClusterHandle>>
    where
        F: Fn(&str, usize, &mut NodeConfig),
    {
        let mut handles = self.handles()?;
        handles.ensure_unused(HandleKind::Cluster, name)?;

        let cluster = Arc::new(ClusterHandle::create(
            name,
            size,
            self.provisioner.clone(),
            configure,
        )?);
        handles.clusters.insert(name.to_string(), cluster.clone());

        info!("Registered cluster {} ({} members)", name, size);
        Ok(cluster)
    }

    /// Look up a registered instance
    pub fn single(&self, name: &str) -> Option<Arc<NodeHandle>> {
        self.handles().ok()?.singles.get(name).cloned()
    }

    /// Look up a registered cluster
    pub fn cluster(&self, name: &str) -> Option<Arc<ClusterHandle>> {
        self.handles().ok()?.clusters.get(name).cloned()
    }

    /// Names of registered instances, sorted
    pub fn single_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handles()
            .map(|h| h.singles.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Names of registered clusters, sorted
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handles()
            .map(|h| h.clusters.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Stop an instance and forget it, even if the stop fails
    pub fn stop_single(&self, name: &str) -> Result<()> {
        let mut handles = self.handles()?;
        match handles.singles.remove(name) {
            Some(node) => {
                info!("Stopping instance {}", name);
                node.stop()
            }
            None => Ok(()),
        }
    }

    /// Stop a cluster and forget it, even if the stop fails
    pub fn stop_cluster(&self, name: &str) -> Result<()> {
        let mut handles = self.handles()?;
        match handles.clusters.remove(name) {
            Some(cluster) => {
                info!("Stopping cluster {}", name);
                cluster.stop()
            }
            None => Ok(()),
        }
    }

    /// Unregister `cluster` without stopping it.
    ///
    /// The entry is removed only if the name still maps to this very handle,
    /// so a cluster registered later under the same name stays put. Returns
    /// whether an entry was removed.
    pub fn forget_cluster(&self, cluster: &Arc<ClusterHandle>) -> Result<bool> {
        let mut handles = self.handles()?;
        let registered = handles
            .clusters
            .get(cluster.name())
            .is_some_and(|current| Arc::ptr_eq(current, cluster));

        if registered {
            handles.clusters.remove(cluster.name());
            info!("Forgot cluster {}", cluster.name());
        }
        Ok(registered)
    }

    /// Stop everything and empty the registry.
    ///
    /// Instances and clusters are stopped by two concurrent workers. The
    /// returned composite holds one error per handle that failed to stop.
    pub fn stop_all(&self) -> Result<()> {
        let mut handles = self.handles()?;
        let Handles { singles, clusters } = std::mem::take(&mut *handles);

        info!(
            "Stopping {} instances and {} clusters",
            singles.len(),
            clusters.len()
        );

        let errors = ErrorAggregator::new();
        thread::scope(|scope| {
            scope.spawn(|| {
                for node in singles.values() {
                    errors.add(node.stop());
                }
            });
            scope.spawn(|| {
                for cluster in clusters.values() {
                    errors.add(cluster.stop());
                }
            });
        });

        errors.resolve()
    }
}
