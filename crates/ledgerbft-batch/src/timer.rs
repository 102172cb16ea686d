//! Single-purpose, resettable timers that fire by posting an event.
//!
//! Each timer owns at most one live deadline. Resetting replaces the prior
//! deadline and a stopped timer never posts. The coordinator still
//! tolerates a late event that was queued just before a stop: every timer
//! handler re-checks its preconditions.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::event::{Event, EventSender};

/// Delay between delivery attempts while the event queue is full.
const FULL_QUEUE_RETRY: Duration = Duration::from_millis(5);

/// A resettable one-shot timer.
pub trait Timer: Send {
    /// Arms the timer to post `event` after `duration`, cancelling any
    /// previous deadline.
    fn reset(&mut self, duration: Duration, event: Event);

    /// Arms the timer only if it is not already armed.
    fn soft_reset(&mut self, duration: Duration, event: Event) {
        if !self.is_armed() {
            self.reset(duration, event);
        }
    }

    /// Cancels the pending deadline, if any.
    fn stop(&mut self);

    /// Stops the timer permanently; later resets are ignored.
    fn halt(&mut self);

    /// True from a reset until its event is queued, or until a stop.
    fn is_armed(&self) -> bool;
}

/// Creates timers bound to the coordinator's event queue.
pub trait TimerFactory {
    fn create(&self, name: &'static str) -> io::Result<Box<dyn Timer>>;
}

// ============================================================================
// Thread Timers
// ============================================================================

#[derive(Debug, Default)]
struct Deadline {
    due: Option<(Instant, Event)>,
    /// The due event is waiting for room in the queue.
    delayed: bool,
    halted: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    deadline: Mutex<Deadline>,
    changed: Condvar,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, Deadline> {
        // A few plain fields; a panicking holder cannot leave them torn.
        self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Deadline)) {
        f(&mut self.lock());
        self.changed.notify_one();
    }
}

/// Production timer: one long-lived thread that sleeps until the current
/// deadline and is woken whenever the deadline changes.
#[derive(Debug)]
pub struct ThreadTimer {
    name: &'static str,
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadTimer {
    /// Starts the timer thread `ledgerbft-timer-<name>`.
    pub fn spawn(name: &'static str, sender: EventSender) -> io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let worker = thread::Builder::new()
            .name(format!("ledgerbft-timer-{name}"))
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_timer(name, &shared, &sender)
            })?;

        Ok(Self {
            name,
            shared,
            worker: Some(worker),
        })
    }
}

fn run_timer(name: &'static str, shared: &TimerShared, sender: &EventSender) {
    let mut deadline = shared.lock();
    while !deadline.halted {
        let now = Instant::now();
        let due_at = deadline.due.as_ref().map(|(at, _)| *at);
        match due_at {
            None => {
                deadline = shared
                    .changed
                    .wait(deadline)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(at) if now < at => {
                deadline = shared
                    .changed
                    .wait_timeout(deadline, at - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let Some((_, event)) = deadline.due.take() else {
                    continue;
                };
                // Posted under the lock, so a concurrent stop either wins or
                // finds the event already queued.
                match sender.send(event) {
                    Ok(()) => {
                        deadline.delayed = false;
                        trace!(timer = name, "timer fired");
                    }
                    Err(event) => {
                        if !deadline.delayed {
                            warn!(timer = name, event = event.name(), "event queue full, retrying timer event");
                        }
                        deadline.delayed = true;
                        deadline.due = Some((now + FULL_QUEUE_RETRY, event));
                    }
                }
            }
        }
    }
    trace!(timer = name, "timer thread exiting");
}

impl Timer for ThreadTimer {
    fn reset(&mut self, duration: Duration, event: Event) {
        self.shared.update(|deadline| {
            if !deadline.halted {
                deadline.due = Some((Instant::now() + duration, event));
                deadline.delayed = false;
            }
        });
    }

    fn stop(&mut self) {
        self.shared.update(|deadline| {
            deadline.due = None;
            deadline.delayed = false;
        });
    }

    fn halt(&mut self) {
        self.shared.update(|deadline| {
            deadline.due = None;
            deadline.halted = true;
        });
    }

    fn is_armed(&self) -> bool {
        self.shared.lock().due.is_some()
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.halt();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(timer = self.name, "timer thread panicked");
            }
        }
    }
}

/// Builds [`ThreadTimer`]s posting to one event queue.
#[derive(Debug, Clone)]
pub struct ThreadTimerFactory {
    sender: EventSender,
}

impl ThreadTimerFactory {
    pub fn new(sender: EventSender) -> Self {
        Self { sender }
    }
}

impl TimerFactory for ThreadTimerFactory {
    fn create(&self, name: &'static str) -> io::Result<Box<dyn Timer>> {
        Ok(Box::new(ThreadTimer::spawn(name, self.sender.clone())?))
    }
}

// ============================================================================
// Manual Timers
// ============================================================================

/// Observable state of one manual timer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualTimerState {
    pub armed: Option<(Duration, Event)>,
    pub halted: bool,
    /// Number of resets that took effect.
    pub resets: u64,
}

type ManualTimers = Arc<Mutex<HashMap<&'static str, ManualTimerState>>>;

/// Timer whose expiry is triggered explicitly through its factory.
#[derive(Debug)]
pub struct ManualTimer {
    name: &'static str,
    timers: ManualTimers,
}

impl ManualTimer {
    fn with_state<R>(&self, f: impl FnOnce(&mut ManualTimerState) -> R) -> R {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        f(timers.entry(self.name).or_default())
    }
}

impl Timer for ManualTimer {
    fn reset(&mut self, duration: Duration, event: Event) {
        self.with_state(|state| {
            if !state.halted {
                state.armed = Some((duration, event));
                state.resets += 1;
            }
        });
    }

    fn stop(&mut self) {
        self.with_state(|state| state.armed = None);
    }

    fn halt(&mut self) {
        self.with_state(|state| {
            state.armed = None;
            state.halted = true;
        });
    }

    fn is_armed(&self) -> bool {
        self.with_state(|state| state.armed.is_some())
    }
}

/// Deterministic timers for tests and simulation.
///
/// Timers are looked up by the name the coordinator created them with.
#[derive(Debug, Clone, Default)]
pub struct ManualTimerFactory {
    timers: ManualTimers,
}

impl ManualTimerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of timer `name`.
    pub fn state(&self, name: &str) -> ManualTimerState {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_armed(&self, name: &str) -> bool {
        self.state(name).armed.is_some()
    }

    /// Duration timer `name` is armed with.
    pub fn armed_duration(&self, name: &str) -> Option<Duration> {
        self.state(name).armed.map(|(duration, _)| duration)
    }

    /// Expires timer `name`, returning the event it would have posted.
    pub fn fire(&self, name: &str) -> Option<Event> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
            .and_then(|state| state.armed.take())
            .map(|(_, event)| event)
    }
}

impl TimerFactory for ManualTimerFactory {
    fn create(&self, name: &'static str) -> io::Result<Box<dyn Timer>> {
        Ok(Box::new(ManualTimer {
            name,
            timers: Arc::clone(&self.timers),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventInbox, event_channel};

    fn wait_for(rx: &EventInbox, within: Duration) -> Option<Event> {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if let Some(event) = rx.try_recv() {
                return Some(event);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    fn thread_timer(name: &'static str, tx: EventSender) -> ThreadTimer {
        ThreadTimer::spawn(name, tx).expect("spawn timer thread")
    }

    #[test]
    fn thread_timer_fires_once() {
        let (tx, rx) = event_channel(8);
        let mut timer = thread_timer("batch", tx);

        timer.reset(Duration::from_millis(10), Event::BatchTimerFired);
        assert!(timer.is_armed());

        assert_eq!(wait_for(&rx, Duration::from_secs(2)), Some(Event::BatchTimerFired));
        assert!(!timer.is_armed());
        assert_eq!(wait_for(&rx, Duration::from_millis(50)), None);
    }

    #[test]
    fn stopped_thread_timer_never_posts() {
        let (tx, rx) = event_channel(8);
        let mut timer = thread_timer("batch", tx);

        timer.reset(Duration::from_millis(20), Event::BatchTimerFired);
        timer.stop();

        assert_eq!(wait_for(&rx, Duration::from_millis(100)), None);
    }

    #[test]
    fn reset_replaces_the_deadline() {
        let (tx, rx) = event_channel(8);
        let mut timer = thread_timer("request", tx);

        timer.reset(Duration::from_millis(20), Event::BatchTimerFired);
        timer.reset(Duration::from_millis(20), Event::RequestTimerFired);

        assert_eq!(wait_for(&rx, Duration::from_secs(2)), Some(Event::RequestTimerFired));
        assert_eq!(wait_for(&rx, Duration::from_millis(80)), None);
    }

    #[test]
    fn shorter_reset_wakes_a_long_sleep() {
        let (tx, rx) = event_channel(8);
        let mut timer = thread_timer("batch", tx);

        timer.reset(Duration::from_secs(30), Event::BatchTimerFired);
        thread::sleep(Duration::from_millis(10));
        timer.reset(Duration::from_millis(10), Event::BatchTimerFired);

        assert_eq!(wait_for(&rx, Duration::from_secs(2)), Some(Event::BatchTimerFired));
    }

    #[test]
    fn cancelled_deadlines_leave_nothing_behind() {
        let (tx, rx) = event_channel(8);
        let mut timer = thread_timer("batch", tx);

        for _ in 0..300 {
            timer.reset(Duration::from_secs(2), Event::BatchTimerFired);
            timer.stop();
        }
        assert!(!timer.is_armed());

        // The single timer thread is woken by the halt, not left sleeping
        // out any of the cancelled deadlines.
        let started = Instant::now();
        drop(timer);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn full_queue_delays_instead_of_dropping() {
        let (tx, rx) = event_channel(1);
        tx.send(Event::CommitCompleted).expect("room for the filler");
        let mut timer = thread_timer("batch", tx);

        timer.reset(Duration::from_millis(10), Event::BatchTimerFired);
        thread::sleep(Duration::from_millis(50));
        // Due but undelivered: still armed.
        assert!(timer.is_armed());

        assert_eq!(rx.try_recv(), Some(Event::CommitCompleted));
        assert_eq!(wait_for(&rx, Duration::from_secs(2)), Some(Event::BatchTimerFired));
        assert!(!timer.is_armed());
    }

    #[test]
    fn stop_cancels_a_delayed_delivery() {
        let (tx, rx) = event_channel(1);
        tx.send(Event::CommitCompleted).expect("room for the filler");
        let mut timer = thread_timer("batch", tx);

        timer.reset(Duration::from_millis(5), Event::BatchTimerFired);
        thread::sleep(Duration::from_millis(30));
        timer.stop();

        assert_eq!(rx.try_recv(), Some(Event::CommitCompleted));
        assert_eq!(wait_for(&rx, Duration::from_millis(60)), None);
    }

    #[test]
    fn halted_thread_timer_ignores_resets() {
        let (tx, rx) = event_channel(8);
        let mut timer = thread_timer("batch", tx);

        timer.halt();
        timer.reset(Duration::from_millis(5), Event::BatchTimerFired);
        assert!(!timer.is_armed());
        assert_eq!(wait_for(&rx, Duration::from_millis(50)), None);
    }

    #[test]
    fn soft_reset_keeps_the_first_deadline() {
        let factory = ManualTimerFactory::new();
        let mut timer = factory.create("request").unwrap();

        timer.soft_reset(Duration::from_secs(2), Event::RequestTimerFired);
        timer.soft_reset(Duration::from_secs(9), Event::RequestTimerFired);

        assert_eq!(factory.armed_duration("request"), Some(Duration::from_secs(2)));
        assert_eq!(factory.state("request").resets, 1);
    }

    #[test]
    fn manual_fire_disarms() {
        let factory = ManualTimerFactory::new();
        let mut timer = factory.create("batch").unwrap();

        timer.reset(Duration::from_secs(1), Event::BatchTimerFired);
        assert_eq!(factory.fire("batch"), Some(Event::BatchTimerFired));
        assert!(!timer.is_armed());
        assert_eq!(factory.fire("batch"), None);
    }

    #[test]
    fn manual_halt_is_permanent() {
        let factory = ManualTimerFactory::new();
        let mut timer = factory.create("batch").unwrap();

        timer.halt();
        timer.reset(Duration::from_secs(1), Event::BatchTimerFired);
        assert!(!factory.is_armed("batch"));
        assert!(factory.state("batch").halted);
    }
}
