//! # ledgerbft-batch: request batching front end for a PBFT replica
//!
//! This crate accepts client transactions at any replica, relays them so
//! every replica knows what the primary was asked to order, accumulates
//! them into bounded batches on the primary, and hands those batches to the
//! agreement engine. It tracks which requests are outstanding versus
//! already proposed, rejects replays, and drives the timers that expose a
//! stalled or misbehaving primary.
//!
//! ## Architecture
//!
//! All state lives in one [`BatchCoordinator`] driven by one thread. Every
//! input, from network arrivals to timer expiries to ledger completions,
//! is an [`Event`] posted to a bounded queue.
//!
//! ```text
//!  transport ─┐                          ┌──────────────────────────────┐
//!  timers ────┼─► EventSender ─► inbox ─►│ BatchCoordinator             │
//!  ledger ────┘                          │  RequestStore  Deduplicator  │
//!                                        │  batch buffer  timers        │
//!                                        └───────┬──────────────┬───────┘
//!                                                ▼              ▼
//!                                       AgreementEngine     Broadcaster
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ledgerbft_batch::{
//!     BatchCoordinator, CoordinatorConfig, CoordinatorRuntime, StaticDirectory,
//!     ThreadTimerFactory, event_channel,
//! };
//!
//! let config = CoordinatorConfig::from_config(&ledgerbft_config::LedgerBftConfig::load()?);
//! let (sender, inbox) = event_channel(config.queue_capacity);
//! let coordinator = BatchCoordinator::new(
//!     config.clone(),
//!     engine,
//!     ledger,
//!     Arc::new(transport),
//!     Box::new(StaticDirectory::sequential(config.n)),
//!     &ThreadTimerFactory::new(sender),
//! )?;
//! let mut runtime = CoordinatorRuntime::spawn(coordinator, inbox)?;
//! ```

pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod directory;
pub mod engine;
mod error;
pub mod event;
pub mod fault;
pub mod instrumentation;
pub mod message;
pub mod request;
pub mod request_store;
pub mod runtime;
pub mod timer;


pub use broadcast::{Broadcaster, Transport};
pub use config::{BatchTimeouts, CoordinatorConfig};
pub use coordinator::{BATCH_TIMER, BatchCoordinator, REQUEST_TIMER};
pub use dedup::Deduplicator;
pub use directory::{PeerHandle, ReplicaDirectory, StaticDirectory};
pub use engine::{AgreementEngine, EngineOutput, Ledger, ProtocolSend};
pub use error::{BroadcastError, CoordinatorError, CoordinatorResult, TransportError, WireError};
pub use event::{EngineTimeout, Event, EventInbox, EventSender, StateUpdate, event_channel};
pub use fault::{Honest, PrimaryFault, SubstitutePayload};
pub use message::{BatchMessage, MessageKind, WireMessage};
pub use request::{Request, RequestBatch};
pub use request_store::RequestStore;
pub use runtime::CoordinatorRuntime;
pub use timer::{ManualTimerFactory, ThreadTimerFactory, Timer, TimerFactory};
