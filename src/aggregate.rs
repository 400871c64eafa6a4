//! Failure aggregation for batch operations
//!
//! Batch stops (cluster teardown, shrink, full registry shutdown) keep going
//! after individual failures. Each outcome is fed into an [`ErrorAggregator`],
//! which only keeps the failures and later reduces them to a single
//! [`CompositeError`] or to success.

use crate::error::{AgentError, Result};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Several independent failures reported as one error
#[derive(Debug)]
pub struct CompositeError {
    errors: Vec<AgentError>,
}

impl CompositeError {
    /// Individual failures, in the order they were recorded
    pub fn errors(&self) -> &[AgentError] {
        &self.errors
    }

    /// Number of individual failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Always false for a composite produced by [`ErrorAggregator::resolve`]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Consume the composite and return the individual failures
    pub fn into_errors(self) -> Vec<AgentError> {
        self.errors
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// Thread-safe collector of batch operation outcomes.
///
/// Successful outcomes are dropped on [`add`](Self::add); retained failures
/// have no positional relationship to the batch that produced them.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    errors: Mutex<Vec<AgentError>>,
}

impl ErrorAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outcome, keeping it only if it failed
    pub fn add(&self, result: Result<()>) {
        if let Err(err) = result {
            self.errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(err);
        }
    }

    /// Number of failures recorded so far
    pub fn len(&self) -> usize {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no failure has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reduce to success, or to one composite error holding every failure
    pub fn resolve(self) -> Result<()> {
        let errors = self
            .errors
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Composite(CompositeError { errors }))
        }
    }
}
