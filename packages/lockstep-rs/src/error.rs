//! Structured error types for lockstep.
//!
//! [`LockstepError`] is the one error type returned by the engine. It wraps
//! the component errors so callers can pattern match on what went wrong.
//!
//! # Fatal vs Recoverable
//!
//! Errors fall in two groups, see [`LockstepError::is_fatal`]:
//!
//! - **Fatal**: a corrupt log record, an event applied out of sequence, an
//!   in-flight acknowledgement out of order, or a store failure while the
//!   engine writes events. Continuing would break replay equivalence, so the
//!   duty cycle stops and the error is returned to the host.
//! - **Recoverable**: a failed send (the sequence counter did not advance, so
//!   the send can be retried), a misconfigured builder, calling the engine in
//!   the wrong lifecycle state.
//!
//! Application callbacks (processors, outputs, inputs) return
//! `anyhow::Result`. Those errors never surface here: they are reported to the
//! [`ExceptionHandler`](crate::handler::ExceptionHandler) and the engine
//! continues.

use thiserror::Error;

use crate::applier::ReplayError;
use crate::core::SourceId;
use crate::inflight::InFlightError;
use crate::store::StoreError;
use crate::wire::WireError;

/// Errors returned by the lockstep engine.
#[derive(Debug, Error)]
pub enum LockstepError {
    /// A record read back from a log could not be decoded.
    #[error("corrupt log record: {0}")]
    Wire(#[from] WireError),

    /// The message store failed while the engine was writing or moving a
    /// poller.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A terminal event acknowledged a command out of order.
    #[error("in-flight ordering violation: {0}")]
    InFlight(#[from] InFlightError),

    /// An event was applied out of sequence.
    #[error("replay violation: {0}")]
    Replay(#[from] ReplayError),

    /// A command could not be handed off to the command store. The source
    /// sequence did not advance.
    #[error("failed to send command for source {source_id}")]
    Send {
        source_id: SourceId,
        #[source]
        source: StoreError,
    },

    /// A payload does not fit the record size field.
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),

    /// Two outputs were registered under the same name.
    #[error("output '{name}' is registered more than once")]
    DuplicateOutput { name: String },

    /// The engine must be started before it can send or run.
    #[error("engine is not started")]
    NotStarted,

    /// `start` was called twice.
    #[error("engine is already started")]
    AlreadyStarted,
}

impl LockstepError {
    /// Returns true if the engine must stop.
    ///
    /// Fatal errors are never routed to the exception handler.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LockstepError::Wire(_)
                | LockstepError::Store(_)
                | LockstepError::InFlight(_)
                | LockstepError::Replay(_)
        )
    }
}

/// Result alias for lockstep operations.
pub type Result<T, E = LockstepError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_and_corruption_are_fatal() {
        let err: LockstepError = InFlightError::SequenceMismatch {
            source_id: 1,
            expected: 1,
            received: 2,
        }
        .into();
        assert!(err.is_fatal());

        let err: LockstepError = ReplayError::Gap {
            expected: 2,
            received: 4,
        }
        .into();
        assert!(err.is_fatal());

        let err: LockstepError = WireError::UnknownEventType(7).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_send_failures_are_recoverable() {
        let err = LockstepError::Send {
            source_id: 3,
            source: StoreError::Full { capacity: 1 },
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("source 3"));

        assert!(!LockstepError::PayloadTooLarge(10).is_fatal());
        assert!(!LockstepError::NotStarted.is_fatal());
    }

    #[test]
    fn test_duplicate_output_message_names_output() {
        let err = LockstepError::DuplicateOutput {
            name: "audit".into(),
        };
        assert_eq!(err.to_string(), "output 'audit' is registered more than once");
    }
}
