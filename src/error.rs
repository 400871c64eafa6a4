//! Error types for agentman

use crate::aggregate::CompositeError;
use std::fmt;
use thiserror::Error;

/// Result type for agentman operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Kind of handle an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A single agent, alone or inside a cluster
    Instance,
    /// A cluster of joined agents
    Cluster,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Instance => write!(f, "instance"),
            HandleKind::Cluster => write!(f, "cluster"),
        }
    }
}

/// agentman error types
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Provisioning of \"{name}\" failed: {message}")]
    Provision { name: String, message: String },

    #[error("{kind} \"{name}\" already exists")]
    DuplicateName { kind: HandleKind, name: String },

    #[error("\"{cluster}\" is already {current} instances long, cannot grow by {requested} as it would breach the max cluster size of {max}")]
    Capacity {
        cluster: String,
        current: usize,
        requested: usize,
        max: usize,
    },

    #[error("Unable to grow \"{cluster}\", instance {offset} failed to join: {message}")]
    Join {
        cluster: String,
        offset: usize,
        message: String,
    },

    #[error("{0}")]
    Composite(CompositeError),

    #[error("{kind} \"{name}\" is defunct")]
    Defunct { kind: HandleKind, name: String },

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Cluster \"{cluster}\" has no member {index}")]
    MemberNotFound { cluster: String, index: usize },

    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: HandleKind, name: String },

    #[error("Agent client error: {0}")]
    Client(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether this error signals a caller bug rather than a recoverable failure.
    ///
    /// Touching a handle after it was stopped is the only fatal kind.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Defunct { .. })
    }

    pub(crate) fn provision(name: &str, message: impl fmt::Display) -> Self {
        AgentError::Provision {
            name: name.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn defunct(kind: HandleKind, name: &str) -> Self {
        AgentError::Defunct {
            kind,
            name: name.to_string(),
        }
    }
}
