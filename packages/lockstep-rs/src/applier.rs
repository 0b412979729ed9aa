//! Event application and replay.
//!
//! # Overview
//!
//! Every event in the event log is applied exactly once, in log order, both
//! live and when the log is replayed on start. [`EventApplication`] owns the
//! base state and the applier chain and enforces that order:
//!
//! 1. The event sequence must be exactly `last_applied + 1`. Anything else is
//!    a fatal [`ReplayError`]: re-applying an event or skipping one would make
//!    the replayed state differ from the live one.
//! 2. The base state advances.
//! 3. The applier chain runs, unless the [`ReplayMode`] filters the event out.
//!
//! # Determinism
//!
//! Appliers must be pure functions of the events they see: no I/O, no
//! randomness, no clock reads (use `event_time`). That is what makes a fresh
//! instance replaying the log end up identical to the live one.
//!
//! # Chain Order
//!
//! Extension appliers run first and the application applier last, the mirror
//! of the processor chain. Extensions see each raw event before the
//! application interprets it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::composite::{Capability, Chain, ChainOrder};
use crate::state::{BaseState, MutableBaseState};
use crate::wire::EventRecord;

/// Applies events to deterministic application state.
pub trait EventApplier: Capability {
    fn on_event(&mut self, event: &EventRecord<'_>);
}

// =============================================================================
// Replay Mode
// =============================================================================

/// Which events reach the applier chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Every event is applied, rollbacks included. For applications that
    /// model one event per command.
    #[default]
    ReplayAll,
    /// `ROLLBACK` events are not passed to appliers. For applications that
    /// track per-transaction state and only care about committed work.
    ReplayNonAborted,
}

impl ReplayMode {
    /// Returns true if appliers see events of this kind.
    pub fn applies(&self, event: &EventRecord<'_>) -> bool {
        match self {
            ReplayMode::ReplayAll => true,
            ReplayMode::ReplayNonAborted => !event.event_type().is_rollback(),
        }
    }
}

impl fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayMode::ReplayAll => write!(f, "replay_all"),
            ReplayMode::ReplayNonAborted => write!(f, "replay_non_aborted"),
        }
    }
}

impl FromStr for ReplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "all" | "replay_all" => Ok(ReplayMode::ReplayAll),
            "non_aborted" | "replay_non_aborted" => Ok(ReplayMode::ReplayNonAborted),
            other => Err(format!("unknown replay mode '{other}'")),
        }
    }
}

// =============================================================================
// Replay Error
// =============================================================================

/// An event was offered out of sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// The event, or a later one, was applied already.
    #[error("event {event_sequence} applied again: last applied event is {last_applied}")]
    AlreadyApplied {
        event_sequence: u64,
        last_applied: u64,
    },

    /// One or more events before this one were never applied.
    #[error("event sequence gap: expected {expected}, received {received}")]
    Gap { expected: u64, received: u64 },
}

// =============================================================================
// Composite Applier
// =============================================================================

/// The applier chain: extensions first, application last.
#[derive(Debug, Default)]
pub struct CompositeApplier {
    chain: Chain<dyn EventApplier>,
}

impl CompositeApplier {
    pub fn new(
        application: Vec<Box<dyn EventApplier>>,
        extensions: Vec<Box<dyn EventApplier>>,
    ) -> Self {
        Self {
            chain: Chain::compose(application, extensions, ChainOrder::ApplicationLast),
        }
    }

    pub fn chain(&self) -> &Chain<dyn EventApplier> {
        &self.chain
    }
}

impl Capability for CompositeApplier {
    fn name(&self) -> &str {
        "composite-applier"
    }

    fn is_noop(&self) -> bool {
        self.chain.is_empty()
    }
}

impl EventApplier for CompositeApplier {
    fn on_event(&mut self, event: &EventRecord<'_>) {
        for applier in self.chain.iter_mut() {
            applier.on_event(event);
        }
    }
}

// =============================================================================
// Event Application
// =============================================================================

/// Owner of the base state and the applier chain.
pub struct EventApplication {
    base_state: Box<dyn MutableBaseState>,
    appliers: CompositeApplier,
    mode: ReplayMode,
}

impl EventApplication {
    pub fn new(
        base_state: Box<dyn MutableBaseState>,
        appliers: CompositeApplier,
        mode: ReplayMode,
    ) -> Self {
        Self {
            base_state,
            appliers,
            mode,
        }
    }

    pub fn base_state(&self) -> &dyn BaseState {
        self.base_state.as_base_state()
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn appliers(&self) -> &CompositeApplier {
        &self.appliers
    }

    /// Apply the next event.
    ///
    /// Returns `Ok(false)` if the base state advanced but the replay mode kept
    /// the event from the applier chain.
    pub fn apply(&mut self, event: &EventRecord<'_>) -> Result<bool, ReplayError> {
        let last_applied = self.base_state.last_applied_event_sequence();
        let event_sequence = event.event_sequence();
        if event_sequence <= last_applied {
            return Err(ReplayError::AlreadyApplied {
                event_sequence,
                last_applied,
            });
        }
        if event_sequence != last_applied + 1 {
            return Err(ReplayError::Gap {
                expected: last_applied + 1,
                received: event_sequence,
            });
        }

        self.base_state.on_event_applied(event);
        if !self.mode.applies(event) {
            trace!(event_sequence, "event filtered by replay mode");
            return Ok(false);
        }
        self.appliers.on_event(event);
        Ok(true)
    }
}

impl fmt::Debug for EventApplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventApplication")
            .field(
                "last_applied_event_sequence",
                &self.base_state.last_applied_event_sequence(),
            )
            .field("appliers", &self.appliers)
            .field("mode", &self.mode)
            .finish()
    }
}

// =============================================================================
// Adapters
// =============================================================================

/// An applier that does nothing; dropped from chains at build time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApplier;

impl Capability for NoopApplier {
    fn is_noop(&self) -> bool {
        true
    }
}

impl EventApplier for NoopApplier {
    fn on_event(&mut self, _: &EventRecord<'_>) {}
}

/// Applier backed by a closure. See [`applier_fn`].
pub struct FnApplier<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named [`EventApplier`].
pub fn applier_fn<F>(name: impl Into<String>, f: F) -> FnApplier<F>
where
    F: FnMut(&EventRecord<'_>),
{
    FnApplier {
        name: name.into(),
        f,
    }
}

impl<F> Capability for FnApplier<F> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> EventApplier for FnApplier<F>
where
    F: FnMut(&EventRecord<'_>),
{
    fn on_event(&mut self, event: &EventRecord<'_>) {
        (self.f)(event)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::core::{Event, EventType};
    use crate::state::DefaultBaseState;

    fn encoded(source_sequence: u64, event_sequence: u64, event_type: EventType) -> Vec<u8> {
        let mut buf = Vec::new();
        Event {
            source_id: 1,
            source_sequence,
            event_sequence,
            event_index: 0,
            event_type,
            event_time: 0,
            payload_type: 0,
            payload: Vec::new(),
        }
        .encode(&mut buf)
        .unwrap();
        buf
    }

    fn recorder(log: &Rc<RefCell<Vec<String>>>, tag: &'static str) -> Box<dyn EventApplier> {
        let log = Rc::clone(log);
        Box::new(applier_fn(tag, move |event| {
            log.borrow_mut()
                .push(format!("{tag}:{}", event.event_sequence()));
        }))
    }

    fn application(log: &Rc<RefCell<Vec<String>>>, mode: ReplayMode) -> EventApplication {
        EventApplication::new(
            Box::new(DefaultBaseState::new()),
            CompositeApplier::new(vec![recorder(log, "app")], vec![recorder(log, "ext")]),
            mode,
        )
    }

    #[test]
    fn test_extensions_apply_before_application() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut app = application(&log, ReplayMode::ReplayAll);

        let bytes = encoded(1, 1, EventType::Commit);
        assert!(app.apply(&EventRecord::parse(&bytes).unwrap()).unwrap());
        assert_eq!(*log.borrow(), vec!["ext:1", "app:1"]);
        assert_eq!(app.base_state().last_applied_event_sequence(), 1);
        assert_eq!(app.base_state().last_applied_command_sequence(1), 1);
    }

    #[test]
    fn test_reapplying_an_event_is_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut app = application(&log, ReplayMode::ReplayAll);
        let bytes = encoded(1, 1, EventType::Commit);
        let event = EventRecord::parse(&bytes).unwrap();

        app.apply(&event).unwrap();
        assert_eq!(
            app.apply(&event).unwrap_err(),
            ReplayError::AlreadyApplied {
                event_sequence: 1,
                last_applied: 1
            }
        );
        // the chain saw the event once
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_gap_is_rejected_without_touching_state() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut app = application(&log, ReplayMode::ReplayAll);
        let bytes = encoded(1, 3, EventType::Commit);

        assert_eq!(
            app.apply(&EventRecord::parse(&bytes).unwrap()).unwrap_err(),
            ReplayError::Gap {
                expected: 1,
                received: 3
            }
        );
        assert_eq!(app.base_state().last_applied_event_sequence(), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_non_aborted_mode_hides_rollbacks_but_advances_base_state() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut app = application(&log, ReplayMode::ReplayNonAborted);

        let rollback = encoded(1, 1, EventType::Rollback);
        let commit = encoded(2, 2, EventType::AutoCommit);
        assert!(!app.apply(&EventRecord::parse(&rollback).unwrap()).unwrap());
        assert!(app.apply(&EventRecord::parse(&commit).unwrap()).unwrap());

        assert_eq!(*log.borrow(), vec!["ext:2", "app:2"]);
        assert_eq!(app.base_state().last_applied_command_sequence(1), 2);
        assert_eq!(app.base_state().last_applied_event_sequence(), 2);
    }

    #[test]
    fn test_replay_all_passes_rollbacks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut app = application(&log, ReplayMode::ReplayAll);
        let rollback = encoded(1, 1, EventType::Rollback);
        assert!(app.apply(&EventRecord::parse(&rollback).unwrap()).unwrap());
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_replay_mode_parses_and_serializes() {
        assert_eq!("all".parse::<ReplayMode>().unwrap(), ReplayMode::ReplayAll);
        assert_eq!(
            "replay-non-aborted".parse::<ReplayMode>().unwrap(),
            ReplayMode::ReplayNonAborted
        );
        assert!("sometimes".parse::<ReplayMode>().is_err());
        assert_eq!(
            serde_json::to_string(&ReplayMode::ReplayNonAborted).unwrap(),
            "\"replay_non_aborted\""
        );
    }

    #[test]
    fn test_noop_appliers_are_skipped() {
        let noop: Box<dyn EventApplier> = Box::new(NoopApplier);
        let composite = CompositeApplier::new(vec![noop], vec![]);
        assert!(composite.is_noop());
        assert_eq!(composite.chain().skipped().len(), 1);
    }
}
