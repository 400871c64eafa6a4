//! Agent cluster management
//!
//! A cluster is an ordered list of agents. Member 0 is the bootstrap agent
//! and every later member is joined through it. Growth appends members one at
//! a time; shrinking removes members from the tail.

use super::node::NodeHandle;
use crate::aggregate::ErrorAggregator;
use crate::error::{AgentError, HandleKind, Result};
use crate::provision::{NodeConfig, Provisioner};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Maximum number of members in one cluster
pub const MAX_CLUSTER_SIZE: usize = u8::MAX as usize;

struct ClusterState {
    members: Vec<Arc<NodeHandle>>,
    stopped: bool,
}

/// Handle to a cluster of joined agents
pub struct ClusterHandle {
    name: String,
    provisioner: Arc<dyn Provisioner>,
    state: Mutex<ClusterState>,
}

impl ClusterHandle {
    /// Start a cluster of `size` agents.
    ///
    /// `configure` is called with the cluster name, the member index and the
    /// member's config; index 0 is the bootstrap agent. If any member fails to
    /// come up, every member started so far is stopped again, newest first.
    pub fn create<F>(
        name: &str,
        size: usize,
        provisioner: Arc<dyn Provisioner>,
        configure: F,
    ) -> Result<Self>
    where
        F: Fn(&str, usize, &mut NodeConfig),
    {
        if size == 0 {
            return Err(AgentError::InvalidSize(
                "cluster size must be at least 1".to_string(),
            ));
        }
        if size > MAX_CLUSTER_SIZE {
            return Err(AgentError::Capacity {
                cluster: name.to_string(),
                current: 0,
                requested: size,
                max: MAX_CLUSTER_SIZE,
            });
        }

        let bootstrap = NodeHandle::create(&member_name(name, 0), provisioner.clone(), |conf| {
            configure(name, 0, conf)
        })?;

        let cluster = Self {
            name: name.to_string(),
            provisioner,
            state: Mutex::new(ClusterState {
                members: vec![Arc::new(bootstrap)],
                stopped: false,
            }),
        };

        if size > 1 {
            if let Err(e) = cluster.grow(size - 1, &configure) {
                warn!("Cluster {} failed to start, unwinding: {}", name, e);
                if let Err(stop) = cluster.stop() {
                    warn!("Cluster {} did not unwind cleanly: {}", name, stop);
                }
                return Err(e);
            }
        }

        info!("Cluster {} started with {} members", name, size);
        Ok(cluster)
    }

    fn state(&self) -> Result<MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|_| AgentError::Lock(format!("Failed to acquire lock on cluster {}", self.name)))
    }

    fn live_state(&self) -> Result<MutexGuard<'_, ClusterState>> {
        let state = self.state()?;
        if state.stopped {
            return Err(AgentError::defunct(HandleKind::Cluster, &self.name));
        }
        Ok(state)
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current number of members
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .len()
    }

    /// Whether the cluster has been stopped
    pub fn is_stopped(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped
    }

    /// Member at `index`; 0 is the bootstrap agent
    pub fn member_at(&self, index: usize) -> Result<Arc<NodeHandle>> {
        let state = self.live_state()?;
        state
            .members
            .get(index)
            .cloned()
            .ok_or_else(|| AgentError::MemberNotFound {
                cluster: self.name.clone(),
                index,
            })
    }

    /// All members, in join order
    pub fn members(&self) -> Result<Vec<Arc<NodeHandle>>> {
        Ok(self.live_state()?.members.clone())
    }

    /// Add `n` members, one at a time.
    ///
    /// Each new member is joined through the bootstrap agent before the next
    /// one is started. A member that fails to join is stopped and the error
    /// returned; members added before it stay in the cluster.
    pub fn grow<F>(&self, n: usize, configure: F) -> Result<()>
    where
        F: Fn(&str, usize, &mut NodeConfig),
    {
        let mut state = self.live_state()?;
        let current = state.members.len();

        if n > MAX_CLUSTER_SIZE - current {
            return Err(AgentError::Capacity {
                cluster: self.name.clone(),
                current,
                requested: n,
                max: MAX_CLUSTER_SIZE,
            });
        }

        let seed = state.members[0].client()?;

        for offset in current..current + n {
            let node = NodeHandle::create(
                &member_name(&self.name, offset),
                self.provisioner.clone(),
                |conf| configure(&self.name, offset, conf),
            )?;

            if let Err(e) = node.lan_addr().and_then(|addr| seed.join(&addr, false)) {
                if let Err(stop) = node.stop() {
                    warn!("Failed to stop {} after join error: {}", node.name(), stop);
                }
                return Err(AgentError::Join {
                    cluster: self.name.clone(),
                    offset,
                    message: e.to_string(),
                });
            }

            debug!("{} joined cluster {}", node.name(), self.name);
            state.members.push(Arc::new(node));
        }

        if n > 0 {
            info!("Cluster {} grew by {} to {} members", self.name, n, state.members.len());
        }
        Ok(())
    }

    /// Remove the `n` most recently added members.
    ///
    /// Removing every member stops the cluster. Failed member stops are
    /// reported together but the members are removed regardless.
    pub fn shrink(&self, n: usize) -> Result<()> {
        let mut state = self.live_state()?;
        let len = state.members.len();

        if n == 0 {
            return Ok(());
        }
        if n >= len {
            return self.stop_locked(&mut state);
        }

        let keep = len - n;
        let errors = ErrorAggregator::new();
        for member in state.members.drain(keep..).rev() {
            errors.add(member.stop());
        }

        info!("Cluster {} shrank by {} to {} members", self.name, n, keep);
        errors.resolve()
    }

    /// Stop every member and mark the cluster stopped.
    ///
    /// Stopping a stopped cluster is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state()?;
        if state.stopped {
            return Ok(());
        }
        self.stop_locked(&mut state)
    }

    fn stop_locked(&self, state: &mut ClusterState) -> Result<()> {
        let errors = ErrorAggregator::new();
        for member in state.members.drain(..).rev() {
            errors.add(member.stop());
        }
        state.stopped = true;

        info!("Cluster {} stopped", self.name);
        errors.resolve()
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn member_name(cluster: &str, index: usize) -> String {
    format!("{}-{}", cluster, index)
}
