//! The batch coordinator: single-threaded owner of all request bookkeeping.
//!
//! The coordinator turns client requests into proposed batches and reacts
//! to every lifecycle notification of the agreement engine and the ledger.
//! It is a plain state machine: [`BatchCoordinator::dispatch`] takes one
//! event, handles it and every follow-up event it produces, then returns.
//! Nothing else mutates its state.
//!
//! # Follow-up events
//!
//! Handlers never call each other recursively. A handler that produces new
//! work (a cut batch, an engine instruction) appends an event to a local
//! FIFO, which `dispatch` drains before returning. Ordering is therefore
//! strictly first-in, first-out, including for events the coordinator
//! generates for itself.
//!
//! # Batching lifecycle
//!
//! ```text
//! request ──► outstanding ──► buffer + pending ──► BatchCut ──► propose
//!                  ▲                                               │
//!                  └──────── view change voids pending ◄───────────┤
//!                                                                  ▼
//!                               removed on Execute ◄── agreement reached
//! ```

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use ledgerbft_types::{ReplicaId, SeqNo, Timestamp, ViewNumber};
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, Transport};
use crate::config::CoordinatorConfig;
use crate::dedup::Deduplicator;
use crate::directory::{PeerHandle, ReplicaDirectory};
use crate::engine::{AgreementEngine, EngineOutput, Ledger};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::event::{EngineTimeout, Event, StateUpdate};
use crate::fault::{Honest, PrimaryFault};
use crate::instrumentation::METRICS;
use crate::message::{BatchMessage, MessageKind, WireMessage, wrap_protocol_message, wrap_request};
use crate::request::{Request, RequestBatch};
use crate::request_store::RequestStore;
use crate::timer::{Timer, TimerFactory};

/// Name of the batch-cutoff timer.
pub const BATCH_TIMER: &str = "batch";

/// Name of the request (primary liveness) timer.
pub const REQUEST_TIMER: &str = "request";

/// Event-driven batching front end of one replica.
pub struct BatchCoordinator<E, L> {
    config: CoordinatorConfig,
    engine: E,
    ledger: L,
    broadcaster: Broadcaster,
    directory: Box<dyn ReplicaDirectory + Send>,

    store: RequestStore,
    dedup: Deduplicator,

    /// Requests accumulated since the last cut (primary only).
    buffer: Vec<Request>,
    batch_timer: Box<dyn Timer>,
    batch_timer_active: bool,
    request_timer: Box<dyn Timer>,

    fault: Box<dyn PrimaryFault>,

    /// Events produced while handling the current inbound event.
    follow_ups: VecDeque<Event>,

    /// Timestamp of the last locally originated request.
    last_timestamp: Option<Timestamp>,

    closed: bool,
}

impl<E, L> std::fmt::Debug for BatchCoordinator<E, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("replica", &self.config.replica_id)
            .field("buffered", &self.buffer.len())
            .field("outstanding", &self.store.outstanding().len())
            .field("pending", &self.store.pending().len())
            .field("batch_timer_active", &self.batch_timer_active)
            .finish_non_exhaustive()
    }
}

impl<E: AgreementEngine, L: Ledger> BatchCoordinator<E, L> {
    /// Creates a coordinator. Timers are created from `timers` and post to
    /// whatever queue the factory is bound to.
    ///
    /// Fails only if a timer or sender thread cannot be started.
    pub fn new(
        config: CoordinatorConfig,
        engine: E,
        ledger: L,
        transport: Arc<dyn Transport>,
        directory: Box<dyn ReplicaDirectory + Send>,
        timers: &dyn TimerFactory,
    ) -> io::Result<Self> {
        let broadcaster = Broadcaster::new(
            transport,
            config.replica_id,
            config.n,
            config.broadcast_attempts,
            config.broadcast_timeout,
            config.outbound_capacity,
        )?;

        info!(
            replica = %config.replica_id,
            batch_size = config.batch_size,
            batch_timeout_ms = config.timeouts.batch.as_millis(),
            request_timeout_ms = config.timeouts.request.as_millis(),
            "batch coordinator configured"
        );

        Ok(Self {
            engine,
            ledger,
            broadcaster,
            directory,
            store: RequestStore::new(),
            dedup: Deduplicator::new(),
            buffer: Vec::new(),
            batch_timer: timers.create(BATCH_TIMER)?,
            batch_timer_active: false,
            request_timer: timers.create(REQUEST_TIMER)?,
            fault: Box::new(Honest),
            follow_ups: VecDeque::new(),
            last_timestamp: None,
            closed: false,
            config,
        })
    }

    /// Replaces the primary behaviour, for fault-injection tests.
    pub fn with_fault(mut self, fault: Box<dyn PrimaryFault>) -> Self {
        self.fault = fault;
        self
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handles `event` and every follow-up event it produces.
    ///
    /// Recoverable conditions are logged and absorbed. An unresolvable
    /// sender aborts only the event that carried it; the remaining
    /// follow-ups still run and the first such error is returned.
    pub fn dispatch(&mut self, event: Event) -> CoordinatorResult<()> {
        self.follow_ups.push_back(event);

        let mut first_error = None;
        while let Some(event) = self.follow_ups.pop_front() {
            if let Err(error) = self.handle(event) {
                error!(replica = %self.replica_id(), %error, "event processing aborted");
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn handle(&mut self, event: Event) -> CoordinatorResult<()> {
        debug!(replica = %self.replica_id(), event = event.name(), "handling event");

        match event {
            Event::MessageReceived { message, sender } => {
                if let Some(next) = self.process_message(message, &sender)? {
                    self.follow_ups.push_back(next);
                }
            }
            Event::ProtocolMessage { payload, sender } => self.on_protocol_message(payload, sender),
            Event::BatchCut(batch) => self.on_batch_cut(batch),
            Event::Execute { seq_no, batch } => self.execute(seq_no, &batch),
            Event::ExecutionCompleted { seq_no, tag } => self.on_execution_completed(seq_no, tag),
            Event::CommitCompleted => self.on_commit_completed(),
            Event::BatchTimerFired => self.on_batch_timer(),
            Event::RequestTimerFired => self.on_request_timer(),
            Event::EngineTimeout(timeout) => self.on_engine_timeout(timeout),
            Event::ViewChanged { view } => self.on_view_changed(view),
            Event::StateUpdated(update) => self.on_state_updated(update),
        }
        Ok(())
    }

    // ========================================================================
    // Request Intake
    // ========================================================================

    /// Decodes one inbound wire message.
    ///
    /// Returns the event it turns into, if any. Malformed input is logged
    /// and dropped.
    pub fn process_message(
        &mut self,
        message: WireMessage,
        sender: &PeerHandle,
    ) -> CoordinatorResult<Option<Event>> {
        match message.kind {
            MessageKind::ChainTransaction => {
                let request = self.tx_to_req(message.payload);
                return Ok(self.submit_to_leader(request).map(Event::BatchCut));
            }
            MessageKind::Consensus => {}
            MessageKind::Other(tag) => {
                error!(
                    replica = %self.replica_id(),
                    from = %sender,
                    tag,
                    "unexpected message type"
                );
                return Ok(None);
            }
        }

        let batch_message = match BatchMessage::decode(&message.payload) {
            Ok(batch_message) => batch_message,
            Err(err) => {
                error!(replica = %self.replica_id(), from = %sender, error = %err, "undecodable consensus message");
                return Ok(None);
            }
        };

        match batch_message {
            BatchMessage::Request(request) => Ok(self.admit_relayed(request).map(Event::BatchCut)),
            BatchMessage::ProtocolMessage(payload) => {
                let Some(replica) = self.directory.resolve(sender) else {
                    return Err(CoordinatorError::UnknownSender(sender.clone()));
                };
                Ok(Some(Event::ProtocolMessage {
                    payload,
                    sender: replica,
                }))
            }
        }
    }

    /// Admits a request relayed by another replica.
    fn admit_relayed(&mut self, request: Request) -> Option<RequestBatch> {
        if !self.dedup.is_new(&request) {
            METRICS.increment_requests_stale();
            warn!(
                replica = %self.replica_id(),
                submitter = %request.replica_id,
                timestamp = %request.timestamp,
                "ignoring request that already executed"
            );
            return None;
        }

        debug!(
            replica = %self.replica_id(),
            submitter = %request.replica_id,
            digest = %request.digest(),
            "storing relayed request as outstanding"
        );
        METRICS.increment_requests_admitted();
        self.store.store_outstanding(request.clone());

        if self.is_active_primary() {
            return self.leader_proc_req(request);
        }
        self.start_timer_if_outstanding_requests();
        None
    }

    /// Wraps a raw client transaction into a request stamped by this replica.
    fn tx_to_req(&mut self, payload: Bytes) -> Request {
        let timestamp = Timestamp::now_monotonic(self.last_timestamp);
        self.last_timestamp = Some(timestamp);
        Request::new(self.replica_id(), timestamp, payload)
    }

    /// Entry point for a request originated at this replica.
    ///
    /// Relays the request to every replica, records it as outstanding and,
    /// on the active primary, folds it into the current batch.
    pub fn submit_to_leader(&mut self, request: Request) -> Option<RequestBatch> {
        if self.fault.suppress_request_broadcast() {
            debug!(replica = %self.replica_id(), "request relay suppressed");
        } else {
            match wrap_request(request.clone()) {
                Ok(message) => {
                    self.broadcaster.broadcast(&message);
                }
                Err(err) => {
                    warn!(replica = %self.replica_id(), error = %err, "cannot encode request relay");
                }
            }
        }

        debug!(
            replica = %self.replica_id(),
            digest = %request.digest(),
            "storing local request as outstanding"
        );
        METRICS.increment_requests_admitted();
        self.store.store_outstanding(request.clone());
        self.start_timer_if_outstanding_requests();

        if self.is_active_primary() {
            return self.leader_proc_req(request);
        }
        None
    }

    // ========================================================================
    // Batch Assembly (primary only)
    // ========================================================================

    /// Appends `request` to the batch buffer, cutting a batch once the
    /// buffer reaches the configured size.
    pub fn leader_proc_req(&mut self, request: Request) -> Option<RequestBatch> {
        if self.store.is_pending(&request) {
            debug!(
                replica = %self.replica_id(),
                digest = %request.digest(),
                "request already part of a proposal"
            );
            return None;
        }
        if !self.dedup.is_new(&request) {
            debug!(
                replica = %self.replica_id(),
                digest = %request.digest(),
                "dropping executed request from the outstanding set"
            );
            self.store.remove(&request);
            return None;
        }

        let request = self.fault.substitute(request);
        debug!(
            replica = %self.replica_id(),
            digest = %request.digest(),
            "primary queueing request"
        );

        self.buffer.push(request.clone());
        self.store.store_pending(request);

        if !self.batch_timer_active {
            self.start_batch_timer();
        }

        if self.buffer.len() >= self.config.batch_size {
            return self.send_batch();
        }
        None
    }

    /// Freezes the buffer into a batch.
    ///
    /// Always disarms the batch timer. An empty buffer yields `None`.
    pub fn send_batch(&mut self) -> Option<RequestBatch> {
        self.stop_batch_timer();

        if self.buffer.is_empty() {
            METRICS.increment_empty_cuts();
            error!(replica = %self.replica_id(), "told to cut an empty batch, ignoring");
            return None;
        }

        let batch = RequestBatch::new(mem::take(&mut self.buffer));
        METRICS.increment_batches_cut(batch.len());
        info!(
            replica = %self.replica_id(),
            size = batch.len(),
            digest = %batch.digest(),
            "created batch"
        );
        Some(batch)
    }

    /// Feeds outstanding requests that are not yet pending into new batches.
    ///
    /// Runs only on the active primary with no execution in progress, so
    /// a request is never proposed twice in one cycle.
    pub fn resubmit_outstanding_reqs(&mut self) {
        self.start_timer_if_outstanding_requests();

        if !self.is_active_primary() || self.engine.is_executing() {
            return;
        }

        for request in self.store.get_next_non_pending(usize::MAX) {
            if let Some(batch) = self.leader_proc_req(request) {
                self.follow_ups.push_back(Event::BatchCut(batch));
            }
        }
    }

    fn start_batch_timer(&mut self) {
        self.batch_timer
            .reset(self.config.timeouts.batch, Event::BatchTimerFired);
        self.batch_timer_active = true;
        debug!(replica = %self.replica_id(), "started the batch timer");
    }

    fn stop_batch_timer(&mut self) {
        self.batch_timer.stop();
        self.batch_timer_active = false;
        debug!(replica = %self.replica_id(), "stopped the batch timer");
    }

    /// Arms the request timer if a known request still waits for a
    /// proposal and nothing legitimately delays the primary.
    pub fn start_timer_if_outstanding_requests(&mut self) {
        if self.engine.is_state_transfer_in_progress()
            || self.engine.is_executing()
            || !self.engine.is_active_view()
        {
            debug!(
                replica = %self.replica_id(),
                "not starting request timer: state transfer, execution or view change in progress"
            );
            return;
        }

        if !self.store.has_non_pending() {
            debug!(
                replica = %self.replica_id(),
                "not starting request timer: all outstanding requests are pending"
            );
            return;
        }

        self.request_timer
            .soft_reset(self.config.timeouts.request, Event::RequestTimerFired);
    }

    // ========================================================================
    // Engine and Ledger Notifications
    // ========================================================================

    fn on_protocol_message(&mut self, payload: Bytes, sender: ReplicaId) {
        let output = self.engine.handle_protocol_message(payload, sender);
        self.apply(output);
        self.start_timer_if_outstanding_requests();
    }

    fn on_batch_cut(&mut self, batch: RequestBatch) {
        let output = self.engine.propose_batch(batch);
        self.apply(output);
    }

    /// Executes a batch the agreement engine committed at `seq_no`.
    fn execute(&mut self, seq_no: SeqNo, batch: &RequestBatch) {
        for request in batch {
            match self.store.remove(request) {
                (true, true) => {}
                (false, false) => {
                    METRICS.increment_untracked_executions();
                    warn!(
                        replica = %self.replica_id(),
                        seq_no = %seq_no,
                        digest = %request.digest(),
                        "executing request the store never tracked"
                    );
                }
                (outstanding, pending) => {
                    debug!(
                        replica = %self.replica_id(),
                        seq_no = %seq_no,
                        digest = %request.digest(),
                        outstanding,
                        pending,
                        "executing partially tracked request"
                    );
                }
            }
            self.dedup.execute(request);
        }

        // Progress observed: the primary is alive.
        self.request_timer.stop();

        debug!(
            replica = %self.replica_id(),
            seq_no = %seq_no,
            size = batch.len(),
            "handing batch to the ledger"
        );
        self.ledger
            .execute(seq_no, execution_metadata(seq_no), batch.requests());
    }

    fn on_execution_completed(&mut self, seq_no: SeqNo, tag: Bytes) {
        debug!(replica = %self.replica_id(), seq_no = %seq_no, "execution completed, committing");
        self.ledger.commit(tag);
    }

    fn on_commit_completed(&mut self) {
        debug!(replica = %self.replica_id(), "commit completed");
        let output = self.engine.execution_done();
        // If the engine moved on (e.g. into a view change), resubmission
        // happens once the new view is established.
        let moved_on = !output.events.is_empty();
        self.apply(output);
        if !moved_on {
            self.resubmit_outstanding_reqs();
        }
    }

    fn on_batch_timer(&mut self) {
        self.batch_timer_active = false;
        info!(replica = %self.replica_id(), buffered = self.buffer.len(), "batch timer expired");

        if self.engine.is_active_view() && !self.buffer.is_empty() {
            if let Some(batch) = self.send_batch() {
                self.follow_ups.push_back(Event::BatchCut(batch));
            }
        }
    }

    fn on_request_timer(&mut self) {
        if self.engine.is_state_transfer_in_progress()
            || !self.engine.is_active_view()
            || !self.store.has_non_pending()
        {
            debug!(replica = %self.replica_id(), "request timer expired with no unmet demand");
            return;
        }

        METRICS.increment_request_timeouts();
        info!(
            replica = %self.replica_id(),
            view = %self.engine.view(),
            primary = %self.engine.primary(self.engine.view()),
            "request timer expired, suspecting primary"
        );
        let output = self.engine.request_timeout();
        self.apply(output);
    }

    fn on_engine_timeout(&mut self, timeout: EngineTimeout) {
        debug!(replica = %self.replica_id(), ?timeout, "engine timeout");
        let output = self.engine.on_timeout(timeout);
        self.apply(output);
    }

    fn on_view_changed(&mut self, view: ViewNumber) {
        METRICS.increment_view_changes();
        info!(
            replica = %self.replica_id(),
            view = %view,
            primary = %self.engine.primary(view),
            discarded = self.buffer.len(),
            "recognizing new view"
        );

        self.buffer.clear();
        self.engine.discard_outstanding_batches();
        if self.batch_timer_active {
            self.stop_batch_timer();
        }
        self.request_timer.stop();

        if self.engine.is_state_transfer_in_progress() {
            // Local state cannot be trusted not to duplicate requests.
            self.store.empty_outstanding();
        }
        self.store.empty_pending();

        for batch in self.engine.recovered_batches() {
            if batch.is_empty() {
                continue;
            }
            debug!(
                replica = %self.replica_id(),
                digest = %batch.digest(),
                size = batch.len(),
                "re-adopting in-flight batch"
            );
            self.store.store_pendings(&batch);
        }

        self.resubmit_outstanding_reqs();
    }

    fn on_state_updated(&mut self, update: StateUpdate) {
        METRICS.increment_state_updates();
        info!(
            replica = %self.replica_id(),
            seq_no = %update.seq_no,
            abandoned = self.buffer.len(),
            "state transfer completed, resetting request bookkeeping"
        );

        // Any batch being assembled or in flight is abandoned along with the
        // bookkeeping that described it.
        self.buffer.clear();
        if self.batch_timer_active {
            self.stop_batch_timer();
        }
        self.request_timer.stop();
        self.store = RequestStore::new();
        self.dedup = Deduplicator::new();

        let output = self.engine.state_updated(update);
        self.apply(output);
    }

    /// Transmits engine messages and queues engine events.
    fn apply(&mut self, output: EngineOutput) {
        for send in output.messages {
            let message = match wrap_protocol_message(send.payload) {
                Ok(message) => message,
                Err(err) => {
                    warn!(replica = %self.replica_id(), error = %err, "cannot encode protocol message");
                    continue;
                }
            };
            match send.to {
                None => {
                    self.broadcaster.broadcast(&message);
                }
                Some(to) => {
                    // Failures are already logged and counted.
                    let _ = self.broadcaster.unicast(&message, to);
                }
            }
        }
        self.follow_ups.extend(output.events);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Halts both timers, stops outbound sends and releases the agreement
    /// engine. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.batch_timer.halt();
        self.request_timer.halt();
        self.broadcaster.close();
        self.engine.close();
        info!(replica = %self.replica_id(), "batch coordinator closed");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.config.replica_id
    }

    fn is_active_primary(&self) -> bool {
        self.engine.is_primary() && self.engine.is_active_view()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Requests buffered since the last cut.
    pub fn buffer(&self) -> &[Request] {
        &self.buffer
    }

    pub fn is_batch_timer_active(&self) -> bool {
        self.batch_timer_active
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Opaque metadata persisted with an executed batch: its sequence number.
fn execution_metadata(seq_no: SeqNo) -> Bytes {
    let encoded = postcard::to_allocvec(&seq_no)
        .expect("SeqNo serialization should never fail (plain u64 newtype)");
    Bytes::from(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_metadata_encodes_the_sequence_number() {
        let metadata = execution_metadata(SeqNo::new(42));
        let decoded: SeqNo = postcard::from_bytes(&metadata).expect("decode");
        assert_eq!(decoded, SeqNo::new(42));
    }
}
