use thiserror::Error;

use crate::ids::NodeId;

/// Canonical error taxonomy of the reduce-side coordinator.
///
/// Classification guidance:
/// - [`TsqError::ConfigurationMismatch`]: jointly queried caches can never be
///   collocated (distinct data-node sets, partition counts, replicated joined
///   with partitioned); fatal and never retried
/// - [`TsqError::RemoteExecution`]: a participant failed its map query, or the
///   run was terminated while rows were still being pulled from it
/// - [`TsqError::ClientDisconnected`]: the local node lost its cluster
///   connection; never retried
/// - [`TsqError::Interrupted`]: the caller cancelled while waiting
/// - [`TsqError::Send`]: the transport could not deliver a message; absorbed
///   by the attempt loop as a retry
///
/// A topology mismatch observed while rebalancing is in progress is not an
/// error at all: the resolver reports it as a retry.
#[derive(Debug, Error)]
pub enum TsqError {
    /// Permanent incompatibility between jointly queried caches.
    ///
    /// Examples:
    /// - partitioned caches with different partition counts
    /// - replicated cache whose owners do not cover the partitioned owners
    /// - cache without any data nodes
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    /// A participant reported failure, or rows could not be fetched from it.
    #[error("failed to execute map query on node {}: {message}", .node.as_ref().map(|n| n.as_str()).unwrap_or("<unknown>"))]
    RemoteExecution {
        /// Participant the failure is attributed to, if known.
        node: Option<NodeId>,
        /// Failure description reported by the participant.
        message: String,
    },

    /// Local node is disconnected from the cluster.
    #[error("query was cancelled, client node disconnected")]
    ClientDisconnected,

    /// Waiting caller was interrupted.
    #[error("query was interrupted: {0}")]
    Interrupted(String),

    /// Transport failed to deliver a message to a participant.
    #[error("failed to send message to node {node}: {message}")]
    Send {
        /// Destination node.
        node: NodeId,
        /// Transport-level reason.
        message: String,
    },

    /// The local relational engine rejected a statement or a binding.
    #[error("engine error: {0}")]
    Engine(String),

    /// Wire encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid coordinator configuration or query descriptor.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TsqError {
    /// Whether the attempt loop may absorb this error by starting a new attempt.
    ///
    /// Only transport failures qualify; every other kind is surfaced.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TsqError::Send { .. })
    }

    pub fn remote(node: impl Into<Option<NodeId>>, message: impl Into<String>) -> Self {
        TsqError::RemoteExecution {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, TsqError>;
