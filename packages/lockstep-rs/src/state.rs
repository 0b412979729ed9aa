//! Durable base state and transient engine state.
//!
//! # Base State
//!
//! [`BaseState`] is the deterministic part of the engine's own state. It is
//! derived only from applied events:
//! - `last_applied_event_sequence()` advances by exactly one per applied event
//! - `last_applied_command_sequence(source)` is the source sequence of the most
//!   recent terminal event of that source
//!
//! It is mutated only by the event applier, so a fresh instance fed the same
//! log always ends up equal to the live one. The dispatcher and the sending
//! side only read it.
//!
//! # Transient Engine State
//!
//! [`TransientEngineState`] records upper bounds of what is known to exist in
//! the logs. It is never persisted or replayed and must only drive flow
//! decisions (sequencing, progress), never business logic.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::{SourceId, Timestamp, NIL_SEQUENCE};
use crate::wire::EventRecord;

// =============================================================================
// Base State
// =============================================================================

/// Read access to the durable base state.
pub trait BaseState {
    /// Sequence of the last applied event, [`NIL_SEQUENCE`] if none.
    fn last_applied_event_sequence(&self) -> u64;

    /// Source sequence of the last terminal event applied for `source_id`,
    /// [`NIL_SEQUENCE`] if none.
    fn last_applied_command_sequence(&self, source_id: SourceId) -> u64;

    /// Returns true if the command `(source_id, source_sequence)` has already
    /// been applied.
    fn is_command_applied(&self, source_id: SourceId, source_sequence: u64) -> bool {
        source_sequence <= self.last_applied_command_sequence(source_id)
    }
}

/// Base state that the event applier can advance.
///
/// Implementations must not validate ordering themselves: the applier checks
/// the event sequence before calling [`MutableBaseState::on_event_applied`].
pub trait MutableBaseState: BaseState {
    /// Record that `event` has been applied.
    fn on_event_applied(&mut self, event: &EventRecord<'_>);

    /// Read-only view of this state.
    fn as_base_state(&self) -> &dyn BaseState;
}

/// Default [`MutableBaseState`]: one watermark per source plus the global
/// event watermark.
///
/// Sources are kept ordered so the serialized snapshot is byte-identical for
/// equal states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultBaseState {
    last_event_sequence: u64,
    command_sequences: BTreeMap<SourceId, u64>,
}

impl DefaultBaseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sources that have at least one applied terminal event, in order, with
    /// their watermark.
    pub fn sources(&self) -> impl Iterator<Item = (SourceId, u64)> + '_ {
        self.command_sequences.iter().map(|(&id, &seq)| (id, seq))
    }

    /// Deterministic serialized snapshot of this state.
    pub fn snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Restore a state from a [`snapshot`](Self::snapshot).
    pub fn restore(snapshot: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(snapshot)
    }
}

impl BaseState for DefaultBaseState {
    fn last_applied_event_sequence(&self) -> u64 {
        self.last_event_sequence
    }

    fn last_applied_command_sequence(&self, source_id: SourceId) -> u64 {
        self.command_sequences
            .get(&source_id)
            .copied()
            .unwrap_or(NIL_SEQUENCE)
    }
}

impl MutableBaseState for DefaultBaseState {
    fn on_event_applied(&mut self, event: &EventRecord<'_>) {
        self.last_event_sequence = event.event_sequence();
        if event.is_terminal() {
            self.command_sequences
                .insert(event.source_id(), event.source_sequence());
        }
    }

    fn as_base_state(&self) -> &dyn BaseState {
        self
    }
}

// =============================================================================
// Transient Engine State
// =============================================================================

/// Non-deterministic upper bounds of what exists in the logs.
#[derive(Debug, Clone, Default)]
pub struct TransientEngineState {
    max_available_event_sequence: u64,
    max_available_source_sequences: HashMap<SourceId, u64>,
    newest_event_time: Option<Timestamp>,
}

impl TransientEngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest event sequence known to exist in the event log.
    pub fn max_available_event_sequence(&self) -> u64 {
        self.max_available_event_sequence
    }

    /// Highest source sequence known to exist in the command log for
    /// `source_id`.
    pub fn max_available_source_sequence(&self, source_id: SourceId) -> u64 {
        self.max_available_source_sequences
            .get(&source_id)
            .copied()
            .unwrap_or(NIL_SEQUENCE)
    }

    /// Time of the newest event seen, if any.
    pub fn newest_event_time(&self) -> Option<Timestamp> {
        self.newest_event_time
    }

    /// A command for `source_id` with `source_sequence` exists in the log.
    pub fn on_command_available(&mut self, source_id: SourceId, source_sequence: u64) {
        let max = self
            .max_available_source_sequences
            .entry(source_id)
            .or_insert(NIL_SEQUENCE);
        if source_sequence > *max {
            *max = source_sequence;
        }
    }

    /// An event exists in the log.
    pub fn on_event_available(&mut self, event_sequence: u64, event_time: Timestamp) {
        if event_sequence > self.max_available_event_sequence {
            self.max_available_event_sequence = event_sequence;
        }
        if self.newest_event_time.map_or(true, |newest| event_time > newest) {
            self.newest_event_time = Some(event_time);
        }
    }
}
