//! Source sequencing and command sending.
//!
//! # Overview
//!
//! Each source owns a gapless sequence counter starting at 1. The counter is
//! seeded lazily on the first send after start, from the higher of:
//! - the last applied command sequence in the base state
//! - the highest sequence found in the command log
//!
//! so a restarted engine never reuses a sequence that is already logged,
//! even if that command was never processed.
//!
//! # Send Protocol
//!
//! [`CommandSender::send`] performs, in order:
//! 1. encode the command with the next sequence
//! 2. record it as in flight
//! 3. append it to the command store
//!
//! The counter only advances once the append succeeded. If the append fails
//! the in-flight entry is removed again and the send can simply be retried
//! with the same sequence.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::core::{PayloadType, SourceId};
use crate::error::{LockstepError, Result};
use crate::inflight::InFlightTracker;
use crate::state::{BaseState, TransientEngineState};
use crate::store::MessageStore;
use crate::time::TimeSource;
use crate::wire::{encode_command, CommandHeader, WireError};

/// Per-source sequence counters.
#[derive(Debug, Default, Clone)]
pub struct Sequencers {
    last_sent: HashMap<SourceId, u64>,
    sent: u64,
}

impl Sequencers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sequence sent for `source_id`, if the source has been seeded.
    pub fn last_sent(&self, source_id: SourceId) -> Option<u64> {
        self.last_sent.get(&source_id).copied()
    }

    /// Total commands sent through these counters.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// The sequence the next command of `source_id` will carry.
    pub fn next_sequence(
        &mut self,
        source_id: SourceId,
        base_state: &dyn BaseState,
        transient: &TransientEngineState,
    ) -> u64 {
        let last = *self.last_sent.entry(source_id).or_insert_with(|| {
            let applied = base_state.last_applied_command_sequence(source_id);
            let available = transient.max_available_source_sequence(source_id);
            debug!(source_id, applied, available, "seeding source sequencer");
            applied.max(available)
        });
        last + 1
    }

    fn commit(&mut self, source_id: SourceId, source_sequence: u64) {
        self.last_sent.insert(source_id, source_sequence);
        self.sent += 1;
    }
}

/// Sends commands into the command log for any source.
///
/// Borrowed from the engine for the duration of an input poll, an output
/// publish, or a direct host call.
pub struct CommandSender<'a> {
    commands: &'a mut dyn MessageStore,
    sequencers: &'a mut Sequencers,
    in_flight: &'a mut InFlightTracker,
    transient: &'a mut TransientEngineState,
    base_state: &'a dyn BaseState,
    time: &'a dyn TimeSource,
    buffer: &'a mut Vec<u8>,
}

impl<'a> CommandSender<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        commands: &'a mut dyn MessageStore,
        sequencers: &'a mut Sequencers,
        in_flight: &'a mut InFlightTracker,
        transient: &'a mut TransientEngineState,
        base_state: &'a dyn BaseState,
        time: &'a dyn TimeSource,
        buffer: &'a mut Vec<u8>,
    ) -> Self {
        Self {
            commands,
            sequencers,
            in_flight,
            transient,
            base_state,
            time,
            buffer,
        }
    }

    /// Send a command, returning its source sequence.
    pub fn send(
        &mut self,
        source_id: SourceId,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<u64> {
        let source_sequence =
            self.sequencers
                .next_sequence(source_id, self.base_state, self.transient);
        let command_time = self.time.now();

        self.buffer.clear();
        encode_command(
            self.buffer,
            &CommandHeader {
                source_id,
                source_sequence,
                command_time,
                payload_type,
            },
            payload,
        )
        .map_err(|e| match e {
            WireError::PayloadTooLarge(len) => LockstepError::PayloadTooLarge(len),
            other => LockstepError::Wire(other),
        })?;

        self.in_flight
            .on_command_sent(source_id, source_sequence, command_time);
        if let Err(source) = self.commands.append(self.buffer) {
            self.in_flight.undo_command_sent(source_id, source_sequence);
            warn!(source_id, source_sequence, error = %source, "command append failed");
            return Err(LockstepError::Send { source_id, source });
        }

        self.sequencers.commit(source_id, source_sequence);
        self.transient
            .on_command_available(source_id, source_sequence);
        debug!(source_id, source_sequence, payload_type, "command sent");
        Ok(source_sequence)
    }

    /// The sequence the next command of `source_id` will carry.
    pub fn next_sequence(&mut self, source_id: SourceId) -> u64 {
        self.sequencers
            .next_sequence(source_id, self.base_state, self.transient)
    }

    pub fn has_in_flight_command(&self) -> bool {
        self.in_flight.has_in_flight_command()
    }

    pub fn has_in_flight_command_for(&self, source_id: SourceId) -> bool {
        self.in_flight.has_in_flight_command_for(source_id)
    }

    pub fn in_flight_commands(&self) -> usize {
        self.in_flight.in_flight_commands()
    }

    pub fn base_state(&self) -> &dyn BaseState {
        self.base_state
    }

    pub fn transient(&self) -> &TransientEngineState {
        self.transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DefaultBaseState;
    use crate::store::{InMemoryStore, StoreError};
    use crate::time::ManualTimeSource;
    use crate::wire::CommandRecord;

    struct Parts {
        store: InMemoryStore,
        sequencers: Sequencers,
        in_flight: InFlightTracker,
        transient: TransientEngineState,
        base: DefaultBaseState,
        time: ManualTimeSource,
        buffer: Vec<u8>,
    }

    impl Parts {
        fn new(store: InMemoryStore) -> Self {
            Self {
                store,
                sequencers: Sequencers::new(),
                in_flight: InFlightTracker::with_capacity(4),
                transient: TransientEngineState::new(),
                base: DefaultBaseState::new(),
                time: ManualTimeSource::new(1_000),
                buffer: Vec::new(),
            }
        }

        fn sender(&mut self) -> CommandSender<'_> {
            CommandSender::new(
                &mut self.store,
                &mut self.sequencers,
                &mut self.in_flight,
                &mut self.transient,
                &self.base,
                &self.time,
                &mut self.buffer,
            )
        }
    }

    #[test]
    fn test_sequences_are_gapless_per_source() {
        let mut parts = Parts::new(InMemoryStore::new());
        let mut sender = parts.sender();
        assert_eq!(sender.send(7, 1, b"a").unwrap(), 1);
        assert_eq!(sender.send(7, 1, b"b").unwrap(), 2);
        assert_eq!(sender.send(8, 1, b"c").unwrap(), 1);
        assert_eq!(sender.in_flight_commands(), 3);
        assert!(sender.has_in_flight_command_for(8));

        let logged: Vec<_> = parts
            .store
            .iter()
            .map(|m| {
                let c = CommandRecord::parse(m.bytes).unwrap();
                (c.source_id(), c.source_sequence(), c.command_time())
            })
            .collect();
        assert_eq!(logged, vec![(7, 1, 1_000), (7, 2, 1_000), (8, 1, 1_000)]);
        assert_eq!(parts.sequencers.sent(), 3);
        assert_eq!(parts.transient.max_available_source_sequence(7), 2);
    }

    #[test]
    fn test_failed_append_does_not_advance_sequence() {
        let mut parts = Parts::new(InMemoryStore::with_capacity_limit(1));
        let mut sender = parts.sender();
        assert_eq!(sender.send(7, 1, b"a").unwrap(), 1);

        let err = sender.send(7, 1, b"b").unwrap_err();
        assert!(matches!(
            err,
            LockstepError::Send {
                source_id: 7,
                source: StoreError::Full { .. }
            }
        ));
        assert!(!err.is_fatal());
        // the failed command is not in flight and its sequence is reused
        assert_eq!(sender.in_flight_commands(), 1);
        assert_eq!(sender.next_sequence(7), 2);
    }

    #[test]
    fn test_seeding_uses_highest_known_sequence() {
        let mut parts = Parts::new(InMemoryStore::new());
        parts.transient.on_command_available(7, 5);
        parts.transient.on_command_available(8, 1);
        let mut sender = parts.sender();

        assert_eq!(sender.send(7, 1, b"x").unwrap(), 6);
        assert_eq!(sender.send(8, 1, b"x").unwrap(), 2);
        assert_eq!(sender.send(9, 1, b"x").unwrap(), 1);
    }

    #[test]
    fn test_time_is_stamped_from_time_source() {
        let mut parts = Parts::new(InMemoryStore::new());
        parts.time.advance(500);
        parts.sender().send(1, 1, b"").unwrap();

        let bytes = parts.store.read(0).unwrap();
        assert_eq!(CommandRecord::parse(bytes).unwrap().command_time(), 1_500);
        assert_eq!(parts.in_flight.oldest().unwrap().sending_time, 1_500);
    }
}
