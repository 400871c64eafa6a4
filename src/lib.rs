//! agentman - lifecycle manager for ephemeral test agents
//!
//! agentman starts throwaway agents, alone or as clusters joined through a
//! bootstrap member, and keeps track of them by name so they can be grown,
//! shrunk and stopped later. It provides:
//!
//! - Single agent handles with defunct-after-stop semantics
//! - Clusters that grow one joined member at a time and shrink from the tail
//! - A registry with coordinated, failure-tolerant shutdown
//! - Simulated and process-backed provisioners
//! - A line-oriented command front end

pub mod agent;
pub mod aggregate;
pub mod command;
pub mod config;
pub mod error;
pub mod provision;
pub mod signals;

pub use agent::{AgentRegistry, ClusterHandle, NodeHandle, MAX_CLUSTER_SIZE};
pub use aggregate::{CompositeError, ErrorAggregator};
pub use error::{AgentError, HandleKind, Result};
