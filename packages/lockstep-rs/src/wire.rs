//! Binary record layout for logged commands and events.
//!
//! Both records are a fixed-size little-endian header followed by the raw
//! payload. Offsets are part of the durable format and must never change
//! once logs exist.
//!
//! ```text
//! Command
//!  0  source_id        i32
//!  4  source_sequence  u64
//! 12  command_time     i64
//! 20  payload_type     i32
//! 24  payload_size     u32
//! 28  payload ...
//!
//! Event
//!  0  source_id        i32
//!  4  source_sequence  u64
//! 12  event_time       i64
//! 20  event_sequence   u64
//! 28  event_index      u32
//! 32  event_type       u8
//! 33  payload_type     i32
//! 37  payload_size     u32
//! 41  payload ...
//! ```
//!
//! The engine reads records through the borrowed [`CommandRecord`] and
//! [`EventRecord`] views, which validate once on parse and then decode fields
//! in place without copying the payload.

use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::core::{Command, Event, EventType, PayloadType, SourceId, Timestamp};

/// Length of the fixed command header.
pub const COMMAND_HEADER_LEN: usize = 28;

/// Length of the fixed event header.
pub const EVENT_HEADER_LEN: usize = 41;

mod command_offsets {
    pub const SOURCE_ID: usize = 0;
    pub const SOURCE_SEQUENCE: usize = 4;
    pub const COMMAND_TIME: usize = 12;
    pub const PAYLOAD_TYPE: usize = 20;
    pub const PAYLOAD_SIZE: usize = 24;
}

mod event_offsets {
    pub const SOURCE_ID: usize = 0;
    pub const SOURCE_SEQUENCE: usize = 4;
    pub const EVENT_TIME: usize = 12;
    pub const EVENT_SEQUENCE: usize = 20;
    pub const EVENT_INDEX: usize = 28;
    pub const EVENT_TYPE: usize = 32;
    pub const PAYLOAD_TYPE: usize = 33;
    pub const PAYLOAD_SIZE: usize = 37;
}

// =============================================================================
// Wire Error
// =============================================================================

/// Errors decoding or encoding a record.
///
/// A decode error on a record read back from a durable log means the log is
/// corrupt, which the engine treats as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer is shorter than the fixed header.
    #[error("record too short: {len} bytes, header needs {required}")]
    Truncated {
        /// Bytes available.
        len: usize,
        /// Header length required.
        required: usize,
    },

    /// The declared payload size runs past the end of the buffer.
    #[error("declared payload size {declared} exceeds the {available} bytes available")]
    PayloadOverflow {
        /// Payload size from the header.
        declared: usize,
        /// Bytes after the header.
        available: usize,
    },

    /// The event type byte is not a known code.
    #[error("unknown event type code {0}")]
    UnknownEventType(u8),

    /// A payload is too large for the 32-bit size field.
    #[error("payload of {0} bytes does not fit the size field")]
    PayloadTooLarge(usize),
}

// =============================================================================
// Encoding
// =============================================================================

/// Header fields of a command about to be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub source_id: SourceId,
    pub source_sequence: u64,
    pub command_time: Timestamp,
    pub payload_type: PayloadType,
}

/// Header fields of an event about to be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub source_id: SourceId,
    pub source_sequence: u64,
    pub event_time: Timestamp,
    pub event_sequence: u64,
    pub event_index: u32,
    pub event_type: EventType,
    pub payload_type: PayloadType,
}

fn payload_size(payload: &[u8]) -> Result<u32, WireError> {
    u32::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge(payload.len()))
}

/// Append an encoded command to `buf`.
pub fn encode_command(
    buf: &mut Vec<u8>,
    header: &CommandHeader,
    payload: &[u8],
) -> Result<(), WireError> {
    let size = payload_size(payload)?;
    buf.reserve(COMMAND_HEADER_LEN + payload.len());
    buf.put_i32_le(header.source_id);
    buf.put_u64_le(header.source_sequence);
    buf.put_i64_le(header.command_time);
    buf.put_i32_le(header.payload_type);
    buf.put_u32_le(size);
    buf.put_slice(payload);
    Ok(())
}

/// Append an encoded event to `buf`.
pub fn encode_event(buf: &mut Vec<u8>, header: &EventHeader, payload: &[u8]) -> Result<(), WireError> {
    let size = payload_size(payload)?;
    buf.reserve(EVENT_HEADER_LEN + payload.len());
    buf.put_i32_le(header.source_id);
    buf.put_u64_le(header.source_sequence);
    buf.put_i64_le(header.event_time);
    buf.put_u64_le(header.event_sequence);
    buf.put_u32_le(header.event_index);
    buf.put_u8(header.event_type.code());
    buf.put_i32_le(header.payload_type);
    buf.put_u32_le(size);
    buf.put_slice(payload);
    Ok(())
}

// =============================================================================
// Decoding helpers
// =============================================================================

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    (&bytes[offset..]).get_i32_le()
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    (&bytes[offset..]).get_u32_le()
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    (&bytes[offset..]).get_u64_le()
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    (&bytes[offset..]).get_i64_le()
}

fn checked_payload(bytes: &[u8], header_len: usize, size_offset: usize) -> Result<usize, WireError> {
    if bytes.len() < header_len {
        return Err(WireError::Truncated {
            len: bytes.len(),
            required: header_len,
        });
    }
    let declared = read_u32(bytes, size_offset) as usize;
    let available = bytes.len() - header_len;
    if declared > available {
        return Err(WireError::PayloadOverflow {
            declared,
            available,
        });
    }
    Ok(declared)
}

// =============================================================================
// Command Record
// =============================================================================

/// Borrowed view over an encoded command.
#[derive(Clone, Copy)]
pub struct CommandRecord<'a> {
    bytes: &'a [u8],
    payload_len: usize,
}

impl<'a> CommandRecord<'a> {
    /// Validate `bytes` and wrap them. Trailing bytes after the payload are
    /// ignored.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        let payload_len = checked_payload(bytes, COMMAND_HEADER_LEN, command_offsets::PAYLOAD_SIZE)?;
        Ok(Self { bytes, payload_len })
    }

    pub fn source_id(&self) -> SourceId {
        read_i32(self.bytes, command_offsets::SOURCE_ID)
    }

    pub fn source_sequence(&self) -> u64 {
        read_u64(self.bytes, command_offsets::SOURCE_SEQUENCE)
    }

    pub fn command_time(&self) -> Timestamp {
        read_i64(self.bytes, command_offsets::COMMAND_TIME)
    }

    pub fn payload_type(&self) -> PayloadType {
        read_i32(self.bytes, command_offsets::PAYLOAD_TYPE)
    }

    /// The raw payload, borrowed from the log.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[COMMAND_HEADER_LEN..COMMAND_HEADER_LEN + self.payload_len]
    }

    /// The payload interpreted as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.payload()).ok()
    }

    /// The encoded record, header included.
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.bytes[..COMMAND_HEADER_LEN + self.payload_len]
    }

    /// Copy into an owned [`Command`].
    pub fn to_command(&self) -> Command {
        Command {
            source_id: self.source_id(),
            source_sequence: self.source_sequence(),
            command_time: self.command_time(),
            payload_type: self.payload_type(),
            payload: self.payload().to_vec(),
        }
    }
}

impl fmt::Debug for CommandRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRecord")
            .field("source_id", &self.source_id())
            .field("source_sequence", &self.source_sequence())
            .field("command_time", &self.command_time())
            .field("payload_type", &self.payload_type())
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

impl Command {
    /// Append this command's encoding to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        encode_command(
            buf,
            &CommandHeader {
                source_id: self.source_id,
                source_sequence: self.source_sequence,
                command_time: self.command_time,
                payload_type: self.payload_type,
            },
            &self.payload,
        )
    }

    /// Decode an owned command from its encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        CommandRecord::parse(bytes).map(|record| record.to_command())
    }
}

// =============================================================================
// Event Record
// =============================================================================

/// Borrowed view over an encoded event.
#[derive(Clone, Copy)]
pub struct EventRecord<'a> {
    bytes: &'a [u8],
    payload_len: usize,
    event_type: EventType,
}

impl<'a> EventRecord<'a> {
    /// Validate `bytes` and wrap them. Trailing bytes after the payload are
    /// ignored.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        let payload_len = checked_payload(bytes, EVENT_HEADER_LEN, event_offsets::PAYLOAD_SIZE)?;
        let code = bytes[event_offsets::EVENT_TYPE];
        let event_type = EventType::from_code(code).ok_or(WireError::UnknownEventType(code))?;
        Ok(Self {
            bytes,
            payload_len,
            event_type,
        })
    }

    pub fn source_id(&self) -> SourceId {
        read_i32(self.bytes, event_offsets::SOURCE_ID)
    }

    pub fn source_sequence(&self) -> u64 {
        read_u64(self.bytes, event_offsets::SOURCE_SEQUENCE)
    }

    pub fn event_time(&self) -> Timestamp {
        read_i64(self.bytes, event_offsets::EVENT_TIME)
    }

    pub fn event_sequence(&self) -> u64 {
        read_u64(self.bytes, event_offsets::EVENT_SEQUENCE)
    }

    pub fn event_index(&self) -> u32 {
        read_u32(self.bytes, event_offsets::EVENT_INDEX)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn payload_type(&self) -> PayloadType {
        read_i32(self.bytes, event_offsets::PAYLOAD_TYPE)
    }

    /// The raw payload, borrowed from the log.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[EVENT_HEADER_LEN..EVENT_HEADER_LEN + self.payload_len]
    }

    /// The payload interpreted as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.payload()).ok()
    }

    /// Returns true if this event ends its transaction.
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    /// The encoded record, header included.
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.bytes[..EVENT_HEADER_LEN + self.payload_len]
    }

    /// Copy into an owned [`Event`].
    pub fn to_event(&self) -> Event {
        Event {
            source_id: self.source_id(),
            source_sequence: self.source_sequence(),
            event_sequence: self.event_sequence(),
            event_index: self.event_index(),
            event_type: self.event_type,
            event_time: self.event_time(),
            payload_type: self.payload_type(),
            payload: self.payload().to_vec(),
        }
    }
}

impl fmt::Debug for EventRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("source_id", &self.source_id())
            .field("source_sequence", &self.source_sequence())
            .field("event_sequence", &self.event_sequence())
            .field("event_index", &self.event_index())
            .field("event_type", &self.event_type)
            .field("payload_type", &self.payload_type())
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

impl Event {
    /// Append this event's encoding to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        encode_event(
            buf,
            &EventHeader {
                source_id: self.source_id,
                source_sequence: self.source_sequence,
                event_time: self.event_time,
                event_sequence: self.event_sequence,
                event_index: self.event_index,
                event_type: self.event_type,
                payload_type: self.payload_type,
            },
            &self.payload,
        )
    }

    /// Decode an owned event from its encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        EventRecord::parse(bytes).map(|record| record.to_event())
    }
}
