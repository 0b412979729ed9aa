//! # Lockstep
//!
//! A deterministic command/event engine where commands are sequenced,
//! transactions route events, and state is rebuilt by replay.
//!
//! ## Core Concepts
//!
//! Lockstep separates **requests** from **facts**:
//! - a command is a request, appended to the command log by a source
//! - an event is a fact, appended to the event log by a transaction
//!
//! The key principle: **One Command = One Transaction**. A command either
//! commits all the events it routed, commits no events at all, or rolls
//! back and leaves a single `ROLLBACK` marker. Nothing in between ever
//! reaches the event log.
//!
//! ## Architecture
//!
//! ```text
//! Inputs / host
//!     │
//!     ▼ send()                               sequenced per source
//! [command log] ──► CommandDispatcher ──► processors (app first)
//!     ▲                    │
//!     │                    ▼ one batch append
//!     │             [event log] ──► EventApplication ──► base state
//!     │                    │                       └──► appliers (app last)
//!     │                    ▼
//!     └── loopback ─── Outputs (one poller each, at-least-once)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Gapless sequences** - Each source numbers its commands 1, 2, 3, ...
//! 2. **Exactly-once application** - A command whose sequence is already
//!    applied is skipped as a duplicate
//! 3. **Atomic transactions** - A command's events are appended in one batch
//! 4. **Deterministic replay** - Replaying the event log rebuilds the same
//!    state the live engine had
//! 5. **FIFO in flight** - Terminal events arrive in the order commands were
//!    sent; anything else is fatal
//!
//! ## Guarantees
//!
//! - **Exactly-once** processing and application of each command
//! - **At-least-once** output delivery, with a bounded retry budget
//! - **Single-threaded**: no locks, one engine per thread
//!
//! ## Example
//!
//! ```ignore
//! use lockstep::{Engine, InMemoryStore, processor_fn, applier_fn};
//!
//! let mut engine = Engine::builder(
//!     Box::new(InMemoryStore::new()),
//!     Box::new(InMemoryStore::new()),
//! )
//! .with_processor(processor_fn("echo", |command, router| {
//!     router.route(command.payload_type(), command.payload())?;
//!     Ok(())
//! }))
//! .with_applier(applier_fn("log", |event| {
//!     tracing::info!(event_sequence = event.event_sequence(), "applied");
//! }))
//! .build()?;
//!
//! engine.start()?;
//! engine.send(7, 1, b"hello")?;
//! engine.run_until_idle()?;
//! ```

pub mod applier;
pub mod composite;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod inflight;
pub mod input;
pub mod output;
pub mod plugin;
pub mod processor;
pub mod router;
pub mod sequencer;
pub mod state;
pub mod store;
pub mod time;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Core types
pub use crate::core::{
    Command, Event, EventType, PayloadType, SourceId, Timestamp, NIL_SEQUENCE, NO_PAYLOAD,
};
pub use error::{LockstepError, Result};

// Engine
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineCounters, EngineStatus};

// Members
pub use applier::{applier_fn, EventApplier, NoopApplier, ReplayError, ReplayMode};
pub use composite::{Capability, Chain, ChainOrder};
pub use handler::{
    DuplicateHandler, ExceptionHandler, LoggingExceptionHandler, SkipDuplicateHandler,
};
pub use input::{input_fn, Input};
pub use output::{output_fn, Ack, Output, OutputContext, PublishReport};
pub use plugin::{plugin_fn, Installer, Plugin};
pub use processor::{processor_fn, CommandProcessor, NoopProcessor};
pub use router::{EventRouter, RouteError, TransactionOutcome};

// State, logs and time
pub use dispatch::DispatchOutcome;
pub use inflight::{InFlightCommand, InFlightError, InFlightTracker};
pub use sequencer::CommandSender;
pub use state::{BaseState, DefaultBaseState, MutableBaseState, TransientEngineState};
pub use store::{InMemoryStore, MessageStore, StoreError, StoredMessage};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use wire::{CommandRecord, EventRecord, WireError};
