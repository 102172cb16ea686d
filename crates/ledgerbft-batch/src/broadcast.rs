//! Best-effort delivery of wire messages to other replicas.
//!
//! The coordinator never waits on the network. Every peer has a bounded
//! outbound queue drained by its own sender thread; a broadcast only encodes
//! the message once and enqueues it per peer. Each send is retried a bounded
//! number of times on the sender thread, and a peer that stays unreachable
//! is logged, counted and skipped. A full queue drops the new message.
//! Correctness relies on the agreement protocol's own retransmission, not on
//! this layer.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use ledgerbft_types::ReplicaId;
use tracing::{debug, warn};

use crate::error::{BroadcastError, TransportError};
use crate::instrumentation::METRICS;
use crate::message::WireMessage;

/// Longest an idle sender sleeps before rechecking its queue.
const IDLE_PARK: Duration = Duration::from_millis(50);

/// Point-to-point byte delivery to a replica.
pub trait Transport: Send + Sync {
    /// Sends `bytes` to `to`, giving up after `timeout`.
    fn unicast(&self, to: ReplicaId, bytes: Bytes, timeout: Duration) -> Result<(), TransportError>;
}

// ============================================================================
// Delivery
// ============================================================================

/// Retry policy shared by every sender thread.
struct Delivery {
    transport: Arc<dyn Transport>,
    max_attempts: u32,
    send_timeout: Duration,
}

impl Delivery {
    fn send_with_retry(&self, to: ReplicaId, bytes: &Bytes) -> Result<(), BroadcastError> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.transport.unicast(to, bytes.clone(), self.send_timeout) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    debug!(to = %to, attempt, %error, "unicast attempt failed");
                    last_error = Some(error);
                }
            }
        }
        Err(BroadcastError::Exhausted {
            to,
            attempts: self.max_attempts,
            source: last_error.unwrap_or(TransportError::NotConnected(to)),
        })
    }
}

// ============================================================================
// Peer Links
// ============================================================================

struct Outbox {
    queue: ArrayQueue<Bytes>,
    /// Messages enqueued and not yet finished by the sender.
    in_flight: AtomicUsize,
    closed: AtomicBool,
}

/// Outbound queue and sender thread for one peer.
struct PeerLink {
    to: ReplicaId,
    outbox: Arc<Outbox>,
    sender: Option<JoinHandle<()>>,
}

impl PeerLink {
    fn spawn(to: ReplicaId, capacity: usize, delivery: Arc<Delivery>) -> io::Result<Self> {
        let outbox = Arc::new(Outbox {
            queue: ArrayQueue::new(capacity.max(1)),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        let sender = thread::Builder::new()
            .name(format!("ledgerbft-send-{to}"))
            .spawn({
                let outbox = Arc::clone(&outbox);
                move || run_sender(to, &outbox, &delivery)
            })?;

        Ok(Self {
            to,
            outbox,
            sender: Some(sender),
        })
    }

    fn enqueue(&self, bytes: Bytes) -> Result<(), BroadcastError> {
        if self.outbox.closed.load(Ordering::Acquire) {
            return Err(BroadcastError::Closed);
        }
        self.outbox.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.outbox.queue.push(bytes).is_err() {
            self.outbox.in_flight.fetch_sub(1, Ordering::AcqRel);
            METRICS.increment_broadcast_failures();
            return Err(BroadcastError::QueueFull(self.to));
        }
        self.wake();
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.outbox.in_flight.load(Ordering::Acquire) == 0
    }

    fn wake(&self) {
        if let Some(sender) = &self.sender {
            sender.thread().unpark();
        }
    }

    fn close(&self) {
        self.outbox.closed.store(true, Ordering::Release);
        self.wake();
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
        if let Some(sender) = self.sender.take() {
            if sender.join().is_err() {
                warn!(to = %self.to, "sender thread panicked");
            }
        }
    }
}

fn run_sender(to: ReplicaId, outbox: &Outbox, delivery: &Delivery) {
    while !outbox.closed.load(Ordering::Acquire) {
        let Some(bytes) = outbox.queue.pop() else {
            thread::park_timeout(IDLE_PARK);
            continue;
        };
        if let Err(error) = delivery.send_with_retry(to, &bytes) {
            METRICS.increment_broadcast_failures();
            warn!(to = %to, %error, "outbound message dropped");
        }
        outbox.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    let mut abandoned = 0_usize;
    while outbox.queue.pop().is_some() {
        outbox.in_flight.fetch_sub(1, Ordering::AcqRel);
        abandoned += 1;
    }
    if abandoned > 0 {
        debug!(to = %to, abandoned, "outbound queue discarded at close");
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Fans wire messages out to the cluster `0..n`.
pub struct Broadcaster {
    self_id: ReplicaId,
    /// One link per other replica, in replica order.
    links: Vec<PeerLink>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("self_id", &self.self_id)
            .field("peers", &self.links.len())
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Starts one sender thread per other replica of a cluster of `n`.
    ///
    /// `max_attempts` is clamped to at least one, as is `outbound_capacity`.
    pub fn new(
        transport: Arc<dyn Transport>,
        self_id: ReplicaId,
        n: usize,
        max_attempts: u32,
        send_timeout: Duration,
        outbound_capacity: usize,
    ) -> io::Result<Self> {
        let delivery = Arc::new(Delivery {
            transport,
            max_attempts: max_attempts.max(1),
            send_timeout,
        });
        let links = (0..n as u64)
            .map(ReplicaId::new)
            .filter(|to| *to != self_id)
            .map(|to| PeerLink::spawn(to, outbound_capacity, Arc::clone(&delivery)))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self { self_id, links })
    }

    /// Queues `message` for every replica except this one.
    ///
    /// Returns the number of peers it was queued for. Delivery failures
    /// happen later on the sender threads and are logged and counted there.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(kind = message.kind.name(), %error, "dropping unencodable broadcast");
                return 0;
            }
        };

        self.links
            .iter()
            .filter(|link| match link.enqueue(bytes.clone()) {
                Ok(()) => true,
                Err(error) => {
                    warn!(to = %link.to, %error, "broadcast leg dropped");
                    false
                }
            })
            .count()
    }

    /// Queues `message` for `to`.
    pub fn unicast(&self, message: &WireMessage, to: ReplicaId) -> Result<(), BroadcastError> {
        let link = self
            .links
            .iter()
            .find(|link| link.to == to)
            .ok_or(BroadcastError::UnknownReplica(to))?;
        let bytes = message.encode()?;
        link.enqueue(bytes).inspect_err(|error| {
            warn!(to = %to, %error, "unicast dropped");
        })
    }

    /// Waits until every queued message has been delivered or given up on.
    ///
    /// Returns false if messages are still in flight after `within`.
    pub fn flush(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if self.links.iter().all(PeerLink::is_idle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops accepting messages. Each sender finishes its current send and
    /// discards the rest of its queue; the threads are joined on drop.
    pub fn close(&self) {
        for link in &self.links {
            link.close();
        }
    }
}
