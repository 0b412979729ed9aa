//! In-flight command tracking.
//!
//! The [`InFlightTracker`] is a transient ledger of commands that were sent
//! but whose terminal event has not been applied yet. It is never persisted.
//! On start the engine rebuilds it from the commands in the command log that
//! the base state has not applied yet.
//!
//! # Layout
//!
//! Entries live in a power-of-two ring buffer addressed by a head index and a
//! length, with a parallel per-source counter. When the ring is full it
//! doubles, copying the wrapped region out in FIFO order so the new buffer
//! starts at index 0.
//!
//! # Acknowledgement Order
//!
//! Commands are dispatched in command-log order, so their terminal events are
//! applied in the order they were sent. A terminal event must therefore
//! always acknowledge the **oldest** entry. Anything else means an event was
//! delivered for a command other than the one the engine is waiting for,
//! which is reported as a fatal [`InFlightError`].

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use crate::core::{EventType, SourceId, Timestamp};

/// Smallest ring capacity.
const MIN_CAPACITY: usize = 2;

/// A command that was sent and not yet acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InFlightCommand {
    pub source_id: SourceId,
    pub source_sequence: u64,
    pub sending_time: Timestamp,
}

/// A terminal event acknowledged a command other than the oldest in-flight
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InFlightError {
    /// The event's source is the oldest in-flight source, but for a different
    /// command.
    #[error(
        "terminal event for source {source_id} sequence {received} acknowledged out of order: \
         oldest in-flight sequence is {expected}"
    )]
    SequenceMismatch {
        source_id: SourceId,
        expected: u64,
        received: u64,
    },

    /// The event's source has in-flight commands, but an older command of
    /// another source is still waiting.
    #[error(
        "terminal event for source {source_id} sequence {received} arrived while the oldest \
         in-flight command is source {head_source_id} sequence {head_sequence}"
    )]
    SourceMismatch {
        source_id: SourceId,
        received: u64,
        head_source_id: SourceId,
        head_sequence: u64,
    },
}

/// FIFO ledger of sent, unacknowledged commands.
#[derive(Debug, Clone)]
pub struct InFlightTracker {
    ring: Vec<InFlightCommand>,
    head: usize,
    len: usize,
    per_source: HashMap<SourceId, u32>,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl InFlightTracker {
    /// Create a tracker whose ring initially holds `capacity` entries,
    /// rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            ring: vec![InFlightCommand::default(); capacity],
            head: 0,
            len: 0,
            per_source: HashMap::new(),
        }
    }

    /// Current ring capacity.
    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Number of in-flight commands across all sources.
    pub fn in_flight_commands(&self) -> usize {
        self.len
    }

    /// Number of in-flight commands for one source.
    pub fn in_flight_commands_for(&self, source_id: SourceId) -> usize {
        self.per_source.get(&source_id).copied().unwrap_or(0) as usize
    }

    /// Returns true if any command is in flight.
    pub fn has_in_flight_command(&self) -> bool {
        self.len > 0
    }

    /// Returns true if a command of `source_id` is in flight.
    pub fn has_in_flight_command_for(&self, source_id: SourceId) -> bool {
        self.per_source.contains_key(&source_id)
    }

    /// The oldest in-flight command, if any.
    pub fn oldest(&self) -> Option<&InFlightCommand> {
        (self.len > 0).then(|| &self.ring[self.head])
    }

    /// In-flight commands, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &InFlightCommand> + '_ {
        let mask = self.mask();
        (0..self.len).map(move |offset| &self.ring[(self.head + offset) & mask])
    }

    fn mask(&self) -> usize {
        self.ring.len() - 1
    }

    /// Record a command as sent.
    pub fn on_command_sent(&mut self, source_id: SourceId, source_sequence: u64, sending_time: Timestamp) {
        if self.len == self.ring.len() {
            self.grow();
        }
        let tail = (self.head + self.len) & self.mask();
        self.ring[tail] = InFlightCommand {
            source_id,
            source_sequence,
            sending_time,
        };
        self.len += 1;
        *self.per_source.entry(source_id).or_insert(0) += 1;
    }

    /// Remove the newest entry if it is `(source_id, source_sequence)`.
    ///
    /// Used by the sending side to undo [`on_command_sent`](Self::on_command_sent)
    /// when the hand-off to the command store fails.
    pub fn undo_command_sent(&mut self, source_id: SourceId, source_sequence: u64) -> bool {
        if self.len == 0 {
            return false;
        }
        let tail = (self.head + self.len - 1) & self.mask();
        let newest = self.ring[tail];
        if newest.source_id != source_id || newest.source_sequence != source_sequence {
            return false;
        }
        self.len -= 1;
        self.decrement(source_id);
        true
    }

    /// Check whether an event would be accepted by [`on_event`](Self::on_event)
    /// without changing the tracker.
    ///
    /// Returns `Ok(true)` if the event acknowledges the oldest in-flight
    /// command and `Ok(false)` if the tracker ignores it.
    pub fn check(
        &self,
        source_id: SourceId,
        source_sequence: u64,
        event_type: EventType,
    ) -> Result<bool, InFlightError> {
        if !event_type.is_terminal() || !self.has_in_flight_command_for(source_id) {
            return Ok(false);
        }
        let head = self.ring[self.head];
        if head.source_id != source_id {
            return Err(InFlightError::SourceMismatch {
                source_id,
                received: source_sequence,
                head_source_id: head.source_id,
                head_sequence: head.source_sequence,
            });
        }
        if head.source_sequence != source_sequence {
            return Err(InFlightError::SequenceMismatch {
                source_id,
                expected: head.source_sequence,
                received: source_sequence,
            });
        }
        Ok(true)
    }

    /// Observe an applied event.
    ///
    /// Returns `Ok(true)` if the event acknowledged the oldest in-flight
    /// command. Non-terminal events, and terminal events of sources with
    /// nothing in flight, are ignored. On error the tracker is unchanged.
    pub fn on_event(
        &mut self,
        source_id: SourceId,
        source_sequence: u64,
        event_type: EventType,
    ) -> Result<bool, InFlightError> {
        if !self.check(source_id, source_sequence, event_type)? {
            return Ok(false);
        }
        self.head = (self.head + 1) & self.mask();
        self.len -= 1;
        self.decrement(source_id);
        trace!(
            source_id,
            source_sequence,
            remaining = self.len,
            "in-flight command acknowledged"
        );
        Ok(true)
    }

    fn decrement(&mut self, source_id: SourceId) {
        if let Some(count) = self.per_source.get_mut(&source_id) {
            *count -= 1;
            if *count == 0 {
                self.per_source.remove(&source_id);
            }
        }
    }

    fn grow(&mut self) {
        let old_capacity = self.ring.len();
        let mut ring = Vec::with_capacity(old_capacity * 2);
        // linearize: head..end, then the wrapped start..head
        ring.extend_from_slice(&self.ring[self.head..]);
        ring.extend_from_slice(&self.ring[..self.head]);
        ring.resize(old_capacity * 2, InFlightCommand::default());
        self.ring = ring;
        self.head = 0;
        trace!(capacity = self.ring.len(), "in-flight ring grown");
    }
}
