//! Seams to the collaborators the batching layer drives.
//!
//! The three-phase agreement protocol and the ledger live outside this
//! crate. Both are reached through traits and report back only by
//! returning output (the engine) or posting events (the ledger), so the
//! coordinator's state is never touched from another thread.

use bytes::Bytes;
use ledgerbft_types::{ReplicaId, SeqNo, ViewNumber};

use crate::event::{EngineTimeout, Event, StateUpdate};
use crate::request::{Request, RequestBatch};

// ============================================================================
// Engine Output
// ============================================================================

/// An agreement-engine message to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSend {
    /// Destination replica, or `None` to broadcast.
    pub to: Option<ReplicaId>,
    /// Opaque engine payload; wrapped into a `Consensus` envelope on send.
    pub payload: Bytes,
}

/// Effects requested by the agreement engine in response to a command.
///
/// Messages are transmitted by the coordinator; events are appended to the
/// coordinator's local queue and handled before the next inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct EngineOutput {
    pub messages: Vec<ProtocolSend>,
    pub events: Vec<Event>,
}

impl EngineOutput {
    /// Output with no effects.
    pub fn none() -> Self {
        Self::default()
    }

    /// Adds a broadcast.
    pub fn broadcast(mut self, payload: impl Into<Bytes>) -> Self {
        self.messages.push(ProtocolSend {
            to: None,
            payload: payload.into(),
        });
        self
    }

    /// Adds a unicast.
    pub fn unicast(mut self, to: ReplicaId, payload: impl Into<Bytes>) -> Self {
        self.messages.push(ProtocolSend {
            to: Some(to),
            payload: payload.into(),
        });
        self
    }

    /// Adds a follow-up event.
    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.events.is_empty()
    }
}

// ============================================================================
// Agreement Engine
// ============================================================================

/// The PBFT agreement core, as seen from the batching layer.
pub trait AgreementEngine {
    // --- Queries ---

    fn replica_id(&self) -> ReplicaId;

    fn view(&self) -> ViewNumber;

    /// Primary of `view`.
    fn primary(&self, view: ViewNumber) -> ReplicaId;

    /// True while the current view is established (not mid view change).
    fn is_active_view(&self) -> bool;

    /// True while a committed batch is being executed by the ledger.
    fn is_executing(&self) -> bool;

    fn is_state_transfer_in_progress(&self) -> bool;

    /// Non-null batches of pre-prepares in the current watermark window
    /// with sequence numbers above the last executed one.
    ///
    /// Read after a view change to re-adopt proposals that survived it.
    fn recovered_batches(&self) -> Vec<RequestBatch>;

    /// True if this replica is primary of the current view.
    fn is_primary(&self) -> bool {
        self.primary(self.view()) == self.replica_id()
    }

    // --- Commands ---

    /// Starts three-phase agreement on `batch` (primary only).
    fn propose_batch(&mut self, batch: RequestBatch) -> EngineOutput;

    /// Delivers an agreement-engine message from `sender`.
    fn handle_protocol_message(&mut self, payload: Bytes, sender: ReplicaId) -> EngineOutput;

    /// The ledger committed the last executed batch.
    fn execution_done(&mut self) -> EngineOutput;

    /// A known request was not proposed in time: suspect the primary.
    fn request_timeout(&mut self) -> EngineOutput;

    /// One of the engine's own timers expired.
    fn on_timeout(&mut self, timeout: EngineTimeout) -> EngineOutput;

    /// State transfer finished.
    fn state_updated(&mut self, update: StateUpdate) -> EngineOutput;

    /// Forgets batches this replica proposed that were voided by a view
    /// change.
    fn discard_outstanding_batches(&mut self);

    /// Releases engine resources. Called once on coordinator shutdown.
    fn close(&mut self) {}
}

// ============================================================================
// Ledger
// ============================================================================

/// Executes and persists committed batches.
///
/// Both calls return immediately. The implementation reports completion by
/// posting [`Event::ExecutionCompleted`] and [`Event::CommitCompleted`].
pub trait Ledger {
    /// Executes `requests` ordered at `seq_no`.
    ///
    /// `metadata` is an opaque blob persisted alongside the block.
    fn execute(&mut self, seq_no: SeqNo, metadata: Bytes, requests: &[Request]);

    /// Commits the result of the last execution, identified by `tag`.
    fn commit(&mut self, tag: Bytes);
}
