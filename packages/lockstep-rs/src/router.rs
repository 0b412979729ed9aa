//! Event routing inside a command transaction.
//!
//! # Overview
//!
//! Every dispatched command runs inside exactly one transaction. The command
//! processors receive an [`EventRouter`] and route zero or more events
//! through it. Routed events are buffered, never written directly, and turned
//! into one atomic batch when the processor chain returns:
//!
//! | Chain result               | Appended batch                         |
//! |----------------------------|----------------------------------------|
//! | nothing routed             | one `AUTO_COMMIT` event                |
//! | `n` events routed          | `n - 1` `INTERMEDIARY`, then `COMMIT`  |
//! | aborted, failed or panicked| one `ROLLBACK` event, routed dropped   |
//!
//! Event indexes restart at 0 for every command.
//!
//! # Buffers
//!
//! Payloads are written into one arena that is reused across commands, and
//! the encoded batch goes into a second reusable buffer, so a warmed-up
//! transaction does not allocate.

use smallvec::SmallVec;
use thiserror::Error;

use crate::core::{EventType, PayloadType, SourceId, Timestamp, NO_PAYLOAD};
use crate::state::BaseState;
use crate::wire::{encode_event, CommandRecord, EventHeader, WireError};

/// Errors returned to a processor that routes an event.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The transaction was aborted; nothing more can be routed.
    #[error("transaction for command {source_id}:{source_sequence} is aborted")]
    Aborted {
        source_id: SourceId,
        source_sequence: u64,
    },

    /// The payload does not fit the record size field.
    #[error("event payload of {0} bytes is too large")]
    PayloadTooLarge(usize),

    /// The payload encoder passed to [`EventRouter::route_with`] failed.
    #[error("failed to encode event payload")]
    Encode(#[source] anyhow::Error),
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RoutedEvent {
    payload_type: PayloadType,
    start: usize,
    end: usize,
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Routed events were committed; the last one is the `COMMIT`.
    Committed { events: u32 },
    /// Nothing was routed; a single `AUTO_COMMIT` was produced.
    AutoCommitted,
    /// The transaction was aborted; a single `ROLLBACK` was produced.
    RolledBack,
}

impl TransactionOutcome {
    /// Number of events in the appended batch.
    pub fn event_count(&self) -> u32 {
        match self {
            TransactionOutcome::Committed { events } => *events,
            TransactionOutcome::AutoCommitted | TransactionOutcome::RolledBack => 1,
        }
    }
}

/// Buffers of one command transaction, reused for every command.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    arena: Vec<u8>,
    routed: SmallVec<[RoutedEvent; 4]>,
    aborted: bool,
    encoded: Vec<u8>,
    bounds: SmallVec<[(usize, usize); 4]>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reset for the next command.
    pub(crate) fn begin(&mut self) {
        self.arena.clear();
        self.routed.clear();
        self.aborted = false;
        self.encoded.clear();
        self.bounds.clear();
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn event_count(&self) -> usize {
        self.routed.len()
    }

    fn push(&mut self, payload_type: PayloadType, start: usize) -> Result<u32, RouteError> {
        let end = self.arena.len();
        if u32::try_from(end - start).is_err() {
            self.arena.truncate(start);
            return Err(RouteError::PayloadTooLarge(end - start));
        }
        let index = self.routed.len() as u32;
        self.routed.push(RoutedEvent {
            payload_type,
            start,
            end,
        });
        Ok(index)
    }

    /// Encode the terminal batch for `command`, numbering events from
    /// `first_event_sequence`.
    pub(crate) fn encode_batch(
        &mut self,
        command: &CommandRecord<'_>,
        first_event_sequence: u64,
        event_time: Timestamp,
    ) -> Result<TransactionOutcome, WireError> {
        self.encoded.clear();
        self.bounds.clear();

        let mut header = EventHeader {
            source_id: command.source_id(),
            source_sequence: command.source_sequence(),
            event_time,
            event_sequence: first_event_sequence,
            event_index: 0,
            event_type: EventType::AutoCommit,
            payload_type: NO_PAYLOAD,
        };

        if self.aborted || self.routed.is_empty() {
            header.event_type = if self.aborted {
                EventType::Rollback
            } else {
                EventType::AutoCommit
            };
            encode_event(&mut self.encoded, &header, &[])?;
            self.bounds.push((0, self.encoded.len()));
            return Ok(if self.aborted {
                TransactionOutcome::RolledBack
            } else {
                TransactionOutcome::AutoCommitted
            });
        }

        let last = self.routed.len() - 1;
        for (index, routed) in self.routed.iter().enumerate() {
            header.event_sequence = first_event_sequence + index as u64;
            header.event_index = index as u32;
            header.event_type = if index == last {
                EventType::Commit
            } else {
                EventType::Intermediary
            };
            header.payload_type = routed.payload_type;

            let start = self.encoded.len();
            encode_event(
                &mut self.encoded,
                &header,
                &self.arena[routed.start..routed.end],
            )?;
            self.bounds.push((start, self.encoded.len()));
        }
        Ok(TransactionOutcome::Committed {
            events: self.routed.len() as u32,
        })
    }

    /// The batch produced by the last [`encode_batch`](Self::encode_batch).
    pub(crate) fn batch(&self) -> SmallVec<[&[u8]; 4]> {
        self.bounds
            .iter()
            .map(|&(start, end)| &self.encoded[start..end])
            .collect()
    }
}

// =============================================================================
// Event Router
// =============================================================================

/// Routes the events of one command transaction.
///
/// Handed to every [`CommandProcessor`](crate::processor::CommandProcessor)
/// in the chain. Events accumulate across processors in routing order.
pub struct EventRouter<'a> {
    command: CommandRecord<'a>,
    base_state: &'a dyn BaseState,
    transaction: &'a mut Transaction,
}

impl<'a> EventRouter<'a> {
    pub(crate) fn new(
        command: CommandRecord<'a>,
        base_state: &'a dyn BaseState,
        transaction: &'a mut Transaction,
    ) -> Self {
        Self {
            command,
            base_state,
            transaction,
        }
    }

    /// The command being processed.
    pub fn command(&self) -> &CommandRecord<'a> {
        &self.command
    }

    /// Read-only base state as of the last applied event.
    pub fn base_state(&self) -> &dyn BaseState {
        self.base_state
    }

    /// Route an event, returning its event index.
    pub fn route(&mut self, payload_type: PayloadType, payload: &[u8]) -> Result<u32, RouteError> {
        self.ensure_open()?;
        let start = self.transaction.arena.len();
        self.transaction.arena.extend_from_slice(payload);
        self.transaction.push(payload_type, start)
    }

    /// Route an event whose payload is written by `encode` straight into the
    /// transaction buffer.
    ///
    /// If `encode` fails nothing is routed.
    pub fn route_with<F>(&mut self, payload_type: PayloadType, encode: F) -> Result<u32, RouteError>
    where
        F: FnOnce(&mut Vec<u8>) -> anyhow::Result<()>,
    {
        self.ensure_open()?;
        let start = self.transaction.arena.len();
        if let Err(e) = encode(&mut self.transaction.arena) {
            self.transaction.arena.truncate(start);
            return Err(RouteError::Encode(e));
        }
        self.transaction.push(payload_type, start)
    }

    /// Abort the transaction. Already routed events are discarded and a
    /// single `ROLLBACK` event is appended instead.
    pub fn abort(&mut self) {
        self.transaction.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.transaction.is_aborted()
    }

    /// Number of events routed so far.
    pub fn event_count(&self) -> usize {
        self.transaction.event_count()
    }

    fn ensure_open(&self) -> Result<(), RouteError> {
        if self.transaction.is_aborted() {
            return Err(RouteError::Aborted {
                source_id: self.command.source_id(),
                source_sequence: self.command.source_sequence(),
            });
        }
        Ok(())
    }
}
