//! Error types for the batching layer.

use ledgerbft_types::ReplicaId;
use thiserror::Error;

use crate::directory::PeerHandle;

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Wire encoding and decoding failures.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] postcard::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] postcard::Error),
}

/// Failure reported by a transport for a single unicast.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("replica {0} is not connected")]
    NotConnected(ReplicaId),

    #[error("send to replica {0} timed out")]
    Timeout(ReplicaId),

    #[error("transport i/o failure: {0}")]
    Io(String),
}

/// Failure to queue a send, or to deliver one after all attempts.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("replica {0} is not part of the cluster")]
    UnknownReplica(ReplicaId),

    #[error("outbound queue to replica {0} is full")]
    QueueFull(ReplicaId),

    #[error("broadcaster is closed")]
    Closed,

    #[error("unicast to replica {to} failed after {attempts} attempts: {source}")]
    Exhausted {
        to: ReplicaId,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Errors that terminate processing of the current event.
///
/// Everything else the coordinator encounters is logged and absorbed.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A consensus message arrived from a peer that maps to no replica.
    ///
    /// This is a configuration invariant breach: processing must not
    /// continue under a guessed identity.
    #[error("cannot map sender {0} to a valid replica ID")]
    UnknownSender(PeerHandle),
}
