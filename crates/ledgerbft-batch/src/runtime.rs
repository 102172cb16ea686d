//! Worker thread that drives one [`BatchCoordinator`].
//!
//! # Design
//!
//! - One named OS thread per replica; no async runtime.
//! - Producers (transport, timers, ledger, agreement engine) post to the
//!   bounded [`EventSender`]; only the worker touches coordinator state.
//! - An idle worker parks until a producer unparks it, with a short
//!   timeout as a fallback.
//! - Shutdown is a marker in the same queue, so every event posted before
//!   it is handled first.

use std::io;
use std::thread;
use std::time::Duration;

use ledgerbft_types::ReplicaId;
use tracing::{debug, error, info};

use crate::coordinator::BatchCoordinator;
use crate::engine::{AgreementEngine, Ledger};
use crate::event::{Envelope, Event, EventInbox, EventSender};

/// Longest an idle worker sleeps without being unparked.
const IDLE_PARK: Duration = Duration::from_millis(5);

/// Owns the coordinator's worker thread.
///
/// # Lifecycle
///
/// 1. Build the coordinator and an [`event_channel`](crate::event::event_channel).
/// 2. [`CoordinatorRuntime::spawn`] moves the coordinator onto its thread.
/// 3. Post events through [`CoordinatorRuntime::sender`].
/// 4. [`CoordinatorRuntime::shutdown`] drains the queue, closes the
///    coordinator and hands it back. Dropping the runtime does the same.
pub struct CoordinatorRuntime<E, L> {
    replica: ReplicaId,
    sender: EventSender,
    handle: Option<thread::JoinHandle<BatchCoordinator<E, L>>>,
}

impl<E, L> CoordinatorRuntime<E, L>
where
    E: AgreementEngine + Send + 'static,
    L: Ledger + Send + 'static,
{
    /// Starts the worker thread `ledgerbft-coordinator-<replica>`.
    pub fn spawn(coordinator: BatchCoordinator<E, L>, inbox: EventInbox) -> io::Result<Self> {
        let replica = coordinator.replica_id();
        let sender = inbox.sender();

        let handle = thread::Builder::new()
            .name(format!("ledgerbft-coordinator-{replica}"))
            .spawn(move || Self::worker_loop(coordinator, &inbox))?;

        info!(replica = %replica, "coordinator runtime started");
        Ok(Self {
            replica,
            sender,
            handle: Some(handle),
        })
    }

    fn worker_loop(
        mut coordinator: BatchCoordinator<E, L>,
        inbox: &EventInbox,
    ) -> BatchCoordinator<E, L> {
        inbox.register_worker();
        loop {
            match inbox.try_next() {
                Some(Envelope::Event(event)) => {
                    // The coordinator has already logged the details.
                    if let Err(err) = coordinator.dispatch(event) {
                        debug!(replica = %coordinator.replica_id(), error = %err, "continuing after aborted event");
                    }
                }
                Some(Envelope::Shutdown) => break,
                None => thread::park_timeout(IDLE_PARK),
            }
        }
        coordinator.close();
        coordinator
    }

    /// Posts `event` to the worker. Returns it back if the queue is full.
    pub fn submit(&self, event: Event) -> Result<(), Event> {
        self.sender.send(event)
    }

    /// A sender for producers running elsewhere (transport, ledger, ...).
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl<E, L> CoordinatorRuntime<E, L> {
    /// Stops the worker after it has handled everything queued so far and
    /// returns the closed coordinator.
    ///
    /// Returns `None` if already shut down or if the worker panicked.
    /// Subsequent calls are no-ops.
    pub fn shutdown(&mut self) -> Option<BatchCoordinator<E, L>> {
        let handle = self.handle.take()?;

        // A full queue drains as the worker runs; keep offering the marker.
        while !self.sender.send_shutdown() {
            if handle.is_finished() {
                break;
            }
            thread::yield_now();
        }

        match handle.join() {
            Ok(coordinator) => {
                info!(replica = %self.replica, "coordinator runtime stopped");
                Some(coordinator)
            }
            Err(_) => {
                error!(replica = %self.replica, "coordinator worker panicked");
                None
            }
        }
    }
}

impl<E, L> Drop for CoordinatorRuntime<E, L> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
