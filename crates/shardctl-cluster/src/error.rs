//! Error types for cluster administration.
//!
//! Each layer has its own enum: text parsing, node I/O, placement solving,
//! and the top-level [`ClusterError`] that orchestrator operations return.

use std::time::Duration;

use crate::topology::NodeAddr;

/// Failure to interpret text produced by a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A line of a topology listing could not be parsed.
    #[error("malformed node line `{line}`: {reason}")]
    NodeLine { line: String, reason: String },

    /// An address was not of the form `host:port`.
    #[error("invalid address `{0}`")]
    Address(String),

    /// A slot number or range was out of bounds or not numeric.
    #[error("invalid slot `{0}`")]
    Slot(String),

    /// A topology listing had no line flagged `myself`.
    #[error("topology listing has no `myself` entry")]
    NoSelf,

    /// A required `INFO` field was absent.
    #[error("INFO reply is missing `{0}`")]
    MissingField(&'static str),
}

/// Errors raised by a [`NodeDriver`](crate::driver::NodeDriver) call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// Connection refused, reset, or timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node is alive but still loading its dataset into memory.
    #[error("node is loading its dataset")]
    BusyLoading,

    /// The node answered with an error reply.
    #[error("{0}")]
    Reply(String),

    /// The node answered with something the driver didn't expect.
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

impl DriverError {
    /// Returns true for errors that are worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transport(_) | DriverError::BusyLoading)
    }
}

/// Errors from the replica placement solver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// Not every orphan primary could be given a replica.
    /// Each entry names a host and how many replicas it is short.
    #[error("insufficient capacity, missing replicas on {}", format_shortfall(.0))]
    MissingReplicas(Vec<(String, usize)>),

    /// The computed flow could not be turned into concrete assignments.
    #[error("placement flow is defective: {0}")]
    Defective(String),
}

fn format_shortfall(shortfall: &[(String, usize)]) -> String {
    shortfall
        .iter()
        .map(|(host, n)| format!("{host} ({n})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur during cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A node command failed after the driver gave up retrying.
    #[error("{addr}: {source}")]
    Driver {
        addr: NodeAddr,
        #[source]
        source: DriverError,
    },

    /// Node output could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The cluster or the supplied nodes are not in a state that allows
    /// the operation. Raised before anything is mutated.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The placement solver could not satisfy the request.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// A referenced node is not part of the topology.
    #[error("node {0} not found in cluster")]
    NodeNotFound(String),

    /// A cooperative stop was requested between steps.
    #[error("stopped on request")]
    Stopped,

    /// A poll loop hit its operator-supplied deadline.
    #[error("timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        elapsed: Duration,
    },

    /// The cluster converged but slot coverage is incomplete.
    #[error("cluster is not healthy: {0}")]
    NotHealthy(String),
}

impl ClusterError {
    /// Wraps a driver error with the address of the node that raised it.
    pub fn driver(addr: &NodeAddr, source: DriverError) -> Self {
        ClusterError::Driver {
            addr: addr.clone(),
            source,
        }
    }

    /// Creates a precondition failure.
    pub fn precondition(msg: impl Into<String>) -> Self {
        ClusterError::Precondition(msg.into())
    }

    /// Returns true if re-running the operation may succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Driver { source, .. } if source.is_transient())
    }

    /// Returns true if the placement solver ran out of free nodes.
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(
            self,
            ClusterError::Placement(PlacementError::MissingReplicas(_))
        )
    }
}
