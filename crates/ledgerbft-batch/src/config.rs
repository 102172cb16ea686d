//! Coordinator parameters derived from the loaded configuration.

use std::time::Duration;

use ledgerbft_config::LedgerBftConfig;
use ledgerbft_types::ReplicaId;
use tracing::warn;

/// The three liveness timeouts, ordered `batch < request < null_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTimeouts {
    /// Longest a non-empty batch buffer waits before it is cut.
    pub batch: Duration,
    /// Longest a known request may stay unproposed before the primary is
    /// suspected.
    pub request: Duration,
    /// Null-request period of the agreement engine. Zero disables it.
    pub null_request: Duration,
}

impl BatchTimeouts {
    /// Orders the timeouts, raising later ones to 1.5x the earlier one
    /// where they are too small.
    ///
    /// A misordered configuration is corrected and logged, never rejected.
    pub fn reconcile(batch: Duration, request: Duration, null_request: Duration) -> Self {
        let mut request = request;
        let mut null_request = null_request;

        if batch >= request {
            let corrected = batch * 3 / 2;
            warn!(
                batch_ms = batch.as_millis(),
                request_ms = request.as_millis(),
                corrected_ms = corrected.as_millis(),
                "batch timeout is not below request timeout; raising request timeout"
            );
            request = corrected;
        }

        if !null_request.is_zero() && request >= null_request {
            let corrected = request * 3 / 2;
            warn!(
                request_ms = request.as_millis(),
                null_request_ms = null_request.as_millis(),
                corrected_ms = corrected.as_millis(),
                "request timeout is not below null request timeout; raising null request timeout"
            );
            null_request = corrected;
        }

        Self {
            batch,
            request,
            null_request,
        }
    }
}

/// Everything the coordinator needs to know about its deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub replica_id: ReplicaId,
    /// Cluster size.
    pub n: usize,
    /// Buffer length that triggers an immediate cut. Never zero.
    pub batch_size: usize,
    pub timeouts: BatchTimeouts,
    pub broadcast_attempts: u32,
    pub broadcast_timeout: Duration,
    /// Per-peer outbound queue length. Never zero.
    pub outbound_capacity: usize,
    pub queue_capacity: usize,
}

impl CoordinatorConfig {
    /// Derives coordinator settings, reconciling the timeouts.
    pub fn from_config(config: &LedgerBftConfig) -> Self {
        let timeout = &config.general.timeout;
        Self {
            replica_id: ReplicaId::new(config.replica.id),
            n: config.replica.n,
            batch_size: config.general.batch_size.max(1),
            timeouts: BatchTimeouts::reconcile(
                timeout.batch(),
                timeout.request(),
                timeout.null_request(),
            ),
            broadcast_attempts: config.broadcast.max_attempts,
            broadcast_timeout: timeout.broadcast(),
            outbound_capacity: config.broadcast.outbound_capacity.max(1),
            queue_capacity: config.runtime.queue_capacity.max(1),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&LedgerBftConfig::default())
    }
}
