//! Hooks for duplicates and recoverable failures.
//!
//! All non-fatal failures are funneled through one [`ExceptionHandler`] so a
//! host can choose between logging, alerting or custom escalation without
//! touching the engine's control flow. Fatal errors never reach it; they are
//! returned from the duty cycle instead.

use tracing::{debug, error, warn};

use crate::wire::{CommandRecord, EventRecord};

/// Receives recoverable failures.
pub trait ExceptionHandler {
    /// A command processor failed or panicked. The transaction was rolled
    /// back.
    fn on_processing_error(&mut self, command: &CommandRecord<'_>, error: &anyhow::Error);

    /// An output exhausted its retry budget for `event`. The event is not
    /// published again.
    fn on_output_error(
        &mut self,
        output: &str,
        event: &EventRecord<'_>,
        attempts: u32,
        error: &anyhow::Error,
    );

    /// An input failed while polling.
    fn on_input_error(&mut self, input: &str, error: &anyhow::Error);
}

/// Logs every failure through `tracing` and continues.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn on_processing_error(&mut self, command: &CommandRecord<'_>, error: &anyhow::Error) {
        error!(
            source_id = command.source_id(),
            source_sequence = command.source_sequence(),
            payload_type = command.payload_type(),
            error = %format!("{error:#}"),
            "command processing failed, transaction rolled back"
        );
    }

    fn on_output_error(
        &mut self,
        output: &str,
        event: &EventRecord<'_>,
        attempts: u32,
        error: &anyhow::Error,
    ) {
        warn!(
            output,
            event_sequence = event.event_sequence(),
            attempts,
            error = %format!("{error:#}"),
            "output gave up on event"
        );
    }

    fn on_input_error(&mut self, input: &str, error: &anyhow::Error) {
        warn!(input, error = %format!("{error:#}"), "input poll failed");
    }
}

/// Receives commands whose source sequence was already applied.
pub trait DuplicateHandler {
    fn on_duplicate(&mut self, command: &CommandRecord<'_>, last_applied: u64);
}

/// Skips duplicates, logging at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipDuplicateHandler;

impl DuplicateHandler for SkipDuplicateHandler {
    fn on_duplicate(&mut self, command: &CommandRecord<'_>, last_applied: u64) {
        debug!(
            source_id = command.source_id(),
            source_sequence = command.source_sequence(),
            last_applied,
            "skipping duplicate command"
        );
    }
}
