//! Append-only message stores with named, resumable pollers.
//!
//! # Contract
//!
//! A [`MessageStore`] is an append-only log of opaque byte messages:
//! - `append` returns the message's index, gapless and monotonic from 0
//! - readers are **pollers**, identified by name, each with its own cursor
//! - a poller's cursor belongs to the store, so it survives an engine restart
//!   as long as the store does
//!
//! The engine uses one store for commands and one for events. Several
//! pollers progress independently over the event store: the applier and one
//! per output.
//!
//! # Reading
//!
//! Reading is two-phase so a message is only consumed once handled:
//!
//! ```ignore
//! if let Some(message) = store.peek("applier") {
//!     handle(message.bytes);
//! }
//! store.advance("applier")?;
//! ```
//!
//! If the handler fails (or the process dies) before `advance`, the same
//! message is delivered again, which makes every poller at-least-once.

use std::collections::HashMap;

use thiserror::Error;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from a message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused the append because it is full.
    #[error("message store is full: capacity {capacity} messages")]
    Full {
        /// Maximum number of messages.
        capacity: u64,
    },

    /// A poller was asked to move outside the log.
    #[error("poller '{poller}' cannot move to position {position}: store holds {len} messages")]
    InvalidPosition {
        /// Poller name.
        poller: String,
        /// Requested position.
        position: u64,
        /// Current log length.
        len: u64,
    },

    /// A poller was advanced past the end of the log.
    #[error("poller '{poller}' is already at the end of the log")]
    EndOfLog {
        /// Poller name.
        poller: String,
    },

    /// Storage backend failed (I/O, corruption, ...).
    #[error("message store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

// =============================================================================
// Message Store
// =============================================================================

/// A message read from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMessage<'a> {
    /// Position of the message in the log, starting at 0.
    pub index: u64,
    /// The message bytes, borrowed from the store.
    pub bytes: &'a [u8],
}

/// Append-only log with named pollers.
///
/// Implementations must be gapless: the n-th successful append returns
/// index `n - 1`.
pub trait MessageStore {
    /// Append one message, returning its index.
    fn append(&mut self, message: &[u8]) -> Result<u64, StoreError>;

    /// Append several messages atomically, returning the index of the first.
    ///
    /// Either all messages are appended or none are. The default appends one
    /// by one and is therefore only atomic for stores whose `append` cannot
    /// fail part-way through a batch; stores that can fail must override it.
    fn append_batch(&mut self, messages: &[&[u8]]) -> Result<u64, StoreError> {
        let first = self.len();
        for message in messages {
            self.append(message)?;
        }
        Ok(first)
    }

    /// Number of messages in the log.
    fn len(&self) -> u64;

    /// Returns true if nothing was ever appended.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a message by index.
    fn read(&self, index: u64) -> Option<&[u8]>;

    /// Index of the next message the poller will read. Unknown pollers start
    /// at 0.
    fn position(&self, poller: &str) -> u64;

    /// The next message for the poller, without consuming it.
    fn peek(&self, poller: &str) -> Option<StoredMessage<'_>> {
        let index = self.position(poller);
        self.read(index).map(|bytes| StoredMessage { index, bytes })
    }

    /// Consume the message the poller last peeked.
    fn advance(&mut self, poller: &str) -> Result<(), StoreError>;

    /// Move a poller to an absolute position (0..=len).
    fn move_to(&mut self, poller: &str, position: u64) -> Result<(), StoreError>;

    /// Peek, hand the message to `handler`, then advance.
    ///
    /// Returns `Ok(false)` if the poller is at the end of the log.
    fn poll(
        &mut self,
        poller: &str,
        handler: &mut dyn FnMut(StoredMessage<'_>),
    ) -> Result<bool, StoreError> {
        match self.peek(poller) {
            Some(message) => handler(message),
            None => return Ok(false),
        }
        self.advance(poller)?;
        Ok(true)
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// A [`MessageStore`] backed by a single growable byte arena.
///
/// Messages are stored back to back in one buffer with an offset table, so
/// appending does not allocate per message. Poller positions live in the
/// store and survive an engine that is dropped and rebuilt over it.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    data: Vec<u8>,
    bounds: Vec<(usize, usize)>,
    pollers: HashMap<String, u64>,
    capacity: Option<u64>,
}

impl InMemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses appends once it holds `capacity` messages.
    pub fn with_capacity_limit(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Iterate all messages in log order.
    pub fn iter(&self) -> impl Iterator<Item = StoredMessage<'_>> {
        self.bounds
            .iter()
            .enumerate()
            .map(|(index, &(start, end))| StoredMessage {
                index: index as u64,
                bytes: &self.data[start..end],
            })
    }

    /// Names of all pollers that have a saved position.
    pub fn pollers(&self) -> impl Iterator<Item = &str> {
        self.pollers.keys().map(String::as_str)
    }

    fn check_capacity(&self, additional: u64) -> Result<(), StoreError> {
        match self.capacity {
            Some(capacity) if self.len() + additional > capacity => {
                Err(StoreError::Full { capacity })
            }
            _ => Ok(()),
        }
    }

    fn push(&mut self, message: &[u8]) -> u64 {
        let start = self.data.len();
        self.data.extend_from_slice(message);
        self.bounds.push((start, self.data.len()));
        (self.bounds.len() - 1) as u64
    }
}

impl MessageStore for InMemoryStore {
    fn append(&mut self, message: &[u8]) -> Result<u64, StoreError> {
        self.check_capacity(1)?;
        Ok(self.push(message))
    }

    fn append_batch(&mut self, messages: &[&[u8]]) -> Result<u64, StoreError> {
        self.check_capacity(messages.len() as u64)?;
        let first = self.len();
        for message in messages {
            self.push(message);
        }
        Ok(first)
    }

    fn len(&self) -> u64 {
        self.bounds.len() as u64
    }

    fn read(&self, index: u64) -> Option<&[u8]> {
        let (start, end) = *self.bounds.get(usize::try_from(index).ok()?)?;
        Some(&self.data[start..end])
    }

    fn position(&self, poller: &str) -> u64 {
        self.pollers.get(poller).copied().unwrap_or(0)
    }

    fn advance(&mut self, poller: &str) -> Result<(), StoreError> {
        let position = self.position(poller);
        if position >= self.len() {
            return Err(StoreError::EndOfLog {
                poller: poller.to_string(),
            });
        }
        self.pollers.insert(poller.to_string(), position + 1);
        Ok(())
    }

    fn move_to(&mut self, poller: &str, position: u64) -> Result<(), StoreError> {
        if position > self.len() {
            return Err(StoreError::InvalidPosition {
                poller: poller.to_string(),
                position,
                len: self.len(),
            });
        }
        self.pollers.insert(poller.to_string(), position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_returns_gapless_indexes() {
        let mut store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.append(b"a").unwrap(), 0);
        assert_eq!(store.append(b"bb").unwrap(), 1);
        assert_eq!(store.append(b"").unwrap(), 2);
        assert_eq!(store.len(), 3);
        assert_eq!(store.read(1), Some(&b"bb"[..]));
        assert_eq!(store.read(2), Some(&b""[..]));
        assert_eq!(store.read(3), None);
    }

    #[test]
    fn test_pollers_progress_independently() {
        let mut store = InMemoryStore::new();
        store.append(b"one").unwrap();
        store.append(b"two").unwrap();

        assert_eq!(store.peek("fast").unwrap().bytes, b"one");
        store.advance("fast").unwrap();
        store.advance("fast").unwrap();
        assert!(store.peek("fast").is_none());

        // "slow" has not moved
        let message = store.peek("slow").unwrap();
        assert_eq!(message.index, 0);
        assert_eq!(message.bytes, b"one");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut store = InMemoryStore::new();
        store.append(b"x").unwrap();
        assert_eq!(store.peek("p").unwrap().index, 0);
        assert_eq!(store.peek("p").unwrap().index, 0);
        assert_eq!(store.position("p"), 0);
    }

    #[test]
    fn test_advance_at_end_is_an_error() {
        let mut store = InMemoryStore::new();
        let err = store.advance("p").unwrap_err();
        assert!(matches!(err, StoreError::EndOfLog { .. }));
    }

    #[test]
    fn test_move_to_rewinds_and_validates() {
        let mut store = InMemoryStore::new();
        store.append(b"a").unwrap();
        store.append(b"b").unwrap();
        store.move_to("p", 2).unwrap();
        assert!(store.peek("p").is_none());
        store.move_to("p", 1).unwrap();
        assert_eq!(store.peek("p").unwrap().bytes, b"b");

        let err = store.move_to("p", 3).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPosition { position: 3, len: 2, .. }));
    }

    #[test]
    fn test_poll_hands_over_and_advances() {
        let mut store = InMemoryStore::new();
        store.append(b"a").unwrap();

        let mut seen = Vec::new();
        assert!(store
            .poll("p", &mut |m| seen.push(m.bytes.to_vec()))
            .unwrap());
        assert!(!store
            .poll("p", &mut |m| seen.push(m.bytes.to_vec()))
            .unwrap());
        assert_eq!(seen, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_capacity_limit_rejects_whole_batch() {
        let mut store = InMemoryStore::with_capacity_limit(2);
        store.append(b"a").unwrap();

        let err = store.append_batch(&[&b"b"[..], &b"c"[..]]).unwrap_err();
        assert!(matches!(err, StoreError::Full { capacity: 2 }));
        assert_eq!(store.len(), 1);

        assert_eq!(store.append_batch(&[&b"b"[..]]).unwrap(), 1);
        assert!(store.append(b"c").is_err());
    }

    #[test]
    fn test_iter_in_log_order() {
        let mut store = InMemoryStore::new();
        store.append_batch(&[&b"a"[..], &b"b"[..], &b"c"[..]]).unwrap();
        let collected: Vec<_> = store.iter().map(|m| (m.index, m.bytes.to_vec())).collect();
        assert_eq!(
            collected,
            vec![(0, b"a".to_vec()), (1, b"b".to_vec()), (2, b"c".to_vec())]
        );
    }

    #[test]
    fn test_poller_positions_survive_clone() {
        let mut store = InMemoryStore::new();
        store.append(b"a").unwrap();
        store.advance("p").unwrap();

        let copy = store.clone();
        assert_eq!(copy.position("p"), 1);
        assert_eq!(copy.pollers().collect::<Vec<_>>(), vec!["p"]);
    }
}
