//! Events processed by the batch coordinator and the queue that carries them.
//!
//! Every state change in the batching layer is the result of exactly one
//! [`Event`]. Network arrivals, timer expiries and agreement-engine or
//! ledger notifications never touch coordinator state from their own
//! thread; they post an event and the coordinator's worker handles it.
//!
//! # Backpressure
//!
//! The queue is a bounded lock-free `ArrayQueue`. A full queue hands the
//! event back to the producer instead of blocking or growing: the producer
//! decides whether to drop, retry or shed load.

use std::sync::{Arc, OnceLock};
use std::thread::Thread;

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use ledgerbft_types::{ReplicaId, SeqNo, ViewNumber};

use crate::directory::PeerHandle;
use crate::message::WireMessage;
use crate::request::RequestBatch;

// ============================================================================
// Events
// ============================================================================

/// Timeouts owned by the agreement engine but driven by the coordinator's
/// event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineTimeout {
    /// View-change round did not complete in time.
    ViewChange,
    /// Primary stayed silent for the null-request period.
    NullRequest,
}

/// Notification that state transfer moved local state to a new checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    /// Sequence number the transferred state corresponds to.
    pub seq_no: SeqNo,
    /// Opaque checkpoint identifier as produced by the ledger.
    pub id: Bytes,
}

/// Closed set of inputs to the batch coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Raw message delivered by the transport from `sender`.
    MessageReceived {
        message: WireMessage,
        sender: PeerHandle,
    },

    /// Agreement-engine message whose sender has been resolved.
    ProtocolMessage { payload: Bytes, sender: ReplicaId },

    /// A batch was cut on this primary and must be proposed.
    BatchCut(RequestBatch),

    /// The agreement engine committed `batch` at `seq_no`; execute it.
    Execute { seq_no: SeqNo, batch: RequestBatch },

    /// The ledger finished executing `seq_no`.
    ExecutionCompleted { seq_no: SeqNo, tag: Bytes },

    /// The ledger persisted the last executed batch.
    CommitCompleted,

    /// The batch-cutoff timer expired.
    BatchTimerFired,

    /// The request (primary liveness) timer expired.
    RequestTimerFired,

    /// An agreement-engine timer expired.
    EngineTimeout(EngineTimeout),

    /// The agreement engine entered `view`.
    ViewChanged { view: ViewNumber },

    /// State transfer completed.
    StateUpdated(StateUpdate),
}

impl Event {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageReceived { .. } => "MessageReceived",
            Self::ProtocolMessage { .. } => "ProtocolMessage",
            Self::BatchCut(_) => "BatchCut",
            Self::Execute { .. } => "Execute",
            Self::ExecutionCompleted { .. } => "ExecutionCompleted",
            Self::CommitCompleted => "CommitCompleted",
            Self::BatchTimerFired => "BatchTimerFired",
            Self::RequestTimerFired => "RequestTimerFired",
            Self::EngineTimeout(_) => "EngineTimeout",
            Self::ViewChanged { .. } => "ViewChanged",
            Self::StateUpdated(_) => "StateUpdated",
        }
    }
}

// ============================================================================
// Event Channel
// ============================================================================

/// What the worker pulls off the queue.
#[derive(Debug)]
pub(crate) enum Envelope {
    Event(Event),
    Shutdown,
}

#[derive(Debug)]
struct Shared {
    queue: ArrayQueue<Envelope>,
    /// Worker thread to wake after a push, once it has registered.
    waker: OnceLock<Thread>,
}

impl Shared {
    fn push(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.queue.push(envelope)?;
        if let Some(worker) = self.waker.get() {
            worker.unpark();
        }
        Ok(())
    }
}

/// Creates a bounded event queue.
///
/// # Panics
///
/// Panics if `capacity` is 0.
pub fn event_channel(capacity: usize) -> (EventSender, EventInbox) {
    assert!(capacity > 0, "event queue capacity must be positive");
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity),
        waker: OnceLock::new(),
    });
    (
        EventSender {
            shared: Arc::clone(&shared),
        },
        EventInbox { shared },
    )
}

/// Producer half. Cheap to clone and safe to use from any thread.
#[derive(Debug, Clone)]
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Enqueues `event`.
    ///
    /// Returns `Err(event)` if the queue is full.
    pub fn send(&self, event: Event) -> Result<(), Event> {
        self.shared
            .push(Envelope::Event(event))
            .map_err(|envelope| match envelope {
                Envelope::Event(event) => event,
                Envelope::Shutdown => unreachable!("pushed an event, got a shutdown marker back"),
            })
    }

    pub(crate) fn send_shutdown(&self) -> bool {
        self.shared.push(Envelope::Shutdown).is_ok()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }
}

/// Consumer half, owned by the coordinator's worker.
#[derive(Debug)]
pub struct EventInbox {
    shared: Arc<Shared>,
}

impl EventInbox {
    /// Pops the next queued event, skipping shutdown markers.
    ///
    /// Useful for driving a coordinator by hand in tests and simulations.
    pub fn try_recv(&self) -> Option<Event> {
        loop {
            match self.shared.queue.pop()? {
                Envelope::Event(event) => return Some(event),
                Envelope::Shutdown => {}
            }
        }
    }

    pub(crate) fn try_next(&self) -> Option<Envelope> {
        self.shared.queue.pop()
    }

    /// Registers the current thread to be unparked on every push.
    pub(crate) fn register_worker(&self) {
        let _ = self.shared.waker.set(std::thread::current());
    }

    /// Returns a new sender for this queue.
    pub fn sender(&self) -> EventSender {
        EventSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }
}
