//! Core record types for the lockstep engine.
//!
//! # Overview
//!
//! Lockstep separates **intent** from **facts**:
//! - [`Command`] = Intent (a request from a source, sequenced and logged)
//! - [`Event`] = Facts (what the command turned into, logged and applied)
//!
//! The key principle: **One Command = One Transaction = One Terminal Event**.
//! Every command that is not a duplicate produces exactly one terminal event
//! ([`EventType::Commit`], [`EventType::AutoCommit`] or [`EventType::Rollback`]),
//! optionally preceded by [`EventType::Intermediary`] events of the same
//! transaction.
//!
//! # Sequences
//!
//! - A source sequence starts at 1 and grows by exactly one per command.
//! - An event sequence starts at 1 and grows by exactly one per event across
//!   the whole event log.
//! - [`NIL_SEQUENCE`] (zero) means "nothing applied yet".

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a logical command producer.
pub type SourceId = i32;

/// Monotonic clock reading in nanoseconds.
pub type Timestamp = i64;

/// Application-defined discriminator for payload bytes.
pub type PayloadType = i32;

/// Sequence value meaning "nothing applied or sent yet".
pub const NIL_SEQUENCE: u64 = 0;

/// Payload type of engine-generated events that carry no payload
/// (auto-commit and rollback).
pub const NO_PAYLOAD: PayloadType = 0;

// =============================================================================
// Event Type
// =============================================================================

/// Role of an event inside its command transaction.
///
/// Exactly one event per command is terminal. Only terminal events advance
/// the per-source watermark in the base state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A non-final event of a transaction that routed more than one event.
    Intermediary,
    /// The last routed event of a committed transaction.
    Commit,
    /// Engine-generated terminal event for a command that routed nothing.
    AutoCommit,
    /// Engine-generated terminal event for an aborted transaction.
    Rollback,
}

impl EventType {
    /// Wire code of this event type.
    pub fn code(self) -> u8 {
        match self {
            EventType::Intermediary => 0,
            EventType::Commit => 1,
            EventType::AutoCommit => 2,
            EventType::Rollback => 3,
        }
    }

    /// Decode a wire code, returning `None` for unknown codes.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EventType::Intermediary),
            1 => Some(EventType::Commit),
            2 => Some(EventType::AutoCommit),
            3 => Some(EventType::Rollback),
            _ => None,
        }
    }

    /// Returns true for the one event per command that ends its transaction.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventType::Intermediary)
    }

    /// Returns true if the transaction was committed (explicitly or not).
    pub fn is_committed(self) -> bool {
        matches!(self, EventType::Commit | EventType::AutoCommit)
    }

    /// Returns true if the transaction was aborted.
    pub fn is_rollback(self) -> bool {
        matches!(self, EventType::Rollback)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Intermediary => write!(f, "INTERMEDIARY"),
            EventType::Commit => write!(f, "COMMIT"),
            EventType::AutoCommit => write!(f, "AUTO_COMMIT"),
            EventType::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

// =============================================================================
// Command
// =============================================================================

/// An owned, immutable command record.
///
/// The engine itself works on borrowed [`CommandRecord`](crate::wire::CommandRecord)
/// views over the logged bytes; this owned form is for hosts and tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    /// Source that sent the command.
    pub source_id: SourceId,
    /// Gapless per-source sequence, starting at 1.
    pub source_sequence: u64,
    /// Time the command was sent.
    pub command_time: Timestamp,
    /// Application-defined payload discriminator.
    pub payload_type: PayloadType,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Command {
    /// Create a new command.
    pub fn new(
        source_id: SourceId,
        source_sequence: u64,
        command_time: Timestamp,
        payload_type: PayloadType,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source_id,
            source_sequence,
            command_time,
            payload_type,
            payload: payload.into(),
        }
    }

    /// The payload interpreted as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command {}:{} (type {}, {} bytes)",
            self.source_id,
            self.source_sequence,
            self.payload_type,
            self.payload.len()
        )
    }
}

// =============================================================================
// Event
// =============================================================================

/// An owned, immutable event record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    /// Source of the originating command.
    pub source_id: SourceId,
    /// Sequence of the originating command.
    pub source_sequence: u64,
    /// Global event sequence, starting at 1.
    pub event_sequence: u64,
    /// Position among the events of one command, starting at 0.
    pub event_index: u32,
    /// Role of the event in its transaction.
    pub event_type: EventType,
    /// Time the event was routed.
    pub event_time: Timestamp,
    /// Application-defined payload discriminator.
    pub payload_type: PayloadType,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Event {
    /// The payload interpreted as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Returns true if this event ends its transaction.
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event #{} {} for {}:{} [{}] (type {}, {} bytes)",
            self.event_sequence,
            self.event_type,
            self.source_id,
            self.source_sequence,
            self.event_index,
            self.payload_type,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_codes_are_stable() {
        assert_eq!(EventType::Intermediary.code(), 0);
        assert_eq!(EventType::Commit.code(), 1);
        assert_eq!(EventType::AutoCommit.code(), 2);
        assert_eq!(EventType::Rollback.code(), 3);
        assert_eq!(EventType::from_code(4), None);
        assert_eq!(EventType::from_code(255), None);
    }

    #[test]
    fn test_event_type_from_code_inverts_code() {
        for ty in [
            EventType::Intermediary,
            EventType::Commit,
            EventType::AutoCommit,
            EventType::Rollback,
        ] {
            assert_eq!(EventType::from_code(ty.code()), Some(ty));
        }
    }

    #[test]
    fn test_only_intermediary_is_not_terminal() {
        assert!(!EventType::Intermediary.is_terminal());
        assert!(EventType::Commit.is_terminal());
        assert!(EventType::AutoCommit.is_terminal());
        assert!(EventType::Rollback.is_terminal());
    }

    #[test]
    fn test_committed_and_rollback_classification() {
        assert!(EventType::Commit.is_committed());
        assert!(EventType::AutoCommit.is_committed());
        assert!(!EventType::Rollback.is_committed());
        assert!(EventType::Rollback.is_rollback());
        assert!(!EventType::Intermediary.is_committed());
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::AutoCommit.to_string(), "AUTO_COMMIT");
        assert_eq!(EventType::Rollback.to_string(), "ROLLBACK");
    }

    #[test]
    fn test_command_display_and_payload_str() {
        let cmd = Command::new(7, 1, 100, 1, "deposit:100");
        assert_eq!(cmd.payload_str(), Some("deposit:100"));
        assert_eq!(cmd.to_string(), "command 7:1 (type 1, 11 bytes)");
    }

    #[test]
    fn test_event_display_mentions_type() {
        let event = Event {
            source_id: 7,
            source_sequence: 1,
            event_sequence: 1,
            event_index: 0,
            event_type: EventType::Commit,
            event_time: 0,
            payload_type: 1,
            payload: b"balance:100".to_vec(),
        };
        assert!(event.is_terminal());
        assert!(event.to_string().contains("COMMIT"));
        assert!(event.to_string().contains("7:1"));
    }
}
