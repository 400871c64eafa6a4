//! Agent lifecycle management
//!
//! This module provides handles for single agents and agent clusters, and
//! the registry that owns them by name.

pub mod cluster;
pub mod node;
pub mod registry;

pub use cluster::{ClusterHandle, MAX_CLUSTER_SIZE};
pub use node::NodeHandle;
pub use registry::AgentRegistry;
