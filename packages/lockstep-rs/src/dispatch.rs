//! Command dispatch.
//!
//! The [`CommandDispatcher`] reads the command log strictly in order through
//! its own durable poller and, for each command:
//!
//! 1. Compares the source sequence with the base state. A sequence at or
//!    below the last applied one is a **duplicate**: it goes to the
//!    [`DuplicateHandler`] and the processors never see it.
//! 2. Opens the transaction and runs the processor chain. Errors and panics
//!    are reported to the [`ExceptionHandler`] and turn the transaction into
//!    a rollback.
//! 3. Appends the whole event batch atomically.
//! 4. Advances its poller past the command.
//!
//! A store failure in step 3 is fatal: the poller has not moved, so after a
//! restart the command is dispatched again.
//!
//! The dispatcher does not apply events. The engine drains the applier after
//! every dispatched command so the base state is current for the next
//! duplicate check.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, error, warn};

use crate::error::Result;
use crate::handler::{DuplicateHandler, ExceptionHandler};
use crate::processor::{CommandProcessor, CompositeProcessor};
use crate::router::{EventRouter, Transaction, TransactionOutcome};
use crate::state::{BaseState, TransientEngineState};
use crate::store::MessageStore;
use crate::time::TimeSource;
use crate::wire::CommandRecord;

/// Result of dispatching one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No command was waiting.
    Idle,
    /// The command was already applied and was skipped.
    Duplicate,
    /// The transaction ended and its batch was appended.
    Processed(TransactionOutcome),
}

impl DispatchOutcome {
    /// Number of events appended to the event store.
    pub fn events_appended(&self) -> u32 {
        match self {
            DispatchOutcome::Processed(outcome) => outcome.event_count(),
            DispatchOutcome::Idle | DispatchOutcome::Duplicate => 0,
        }
    }
}

/// Borrowed engine parts a transaction needs.
pub(crate) struct DispatchContext<'a> {
    pub events: &'a mut dyn MessageStore,
    pub base_state: &'a dyn BaseState,
    pub transient: &'a mut TransientEngineState,
    pub time: &'a dyn TimeSource,
    pub exceptions: &'a mut dyn ExceptionHandler,
}

/// Reads commands and turns each into one transaction.
pub struct CommandDispatcher {
    poller: String,
    processor: CompositeProcessor,
    duplicates: Box<dyn DuplicateHandler>,
    transaction: Transaction,
}

impl CommandDispatcher {
    pub fn new(
        poller: impl Into<String>,
        processor: CompositeProcessor,
        duplicates: Box<dyn DuplicateHandler>,
    ) -> Self {
        Self {
            poller: poller.into(),
            processor,
            duplicates,
            transaction: Transaction::new(),
        }
    }

    pub fn poller(&self) -> &str {
        &self.poller
    }

    pub fn processor(&self) -> &CompositeProcessor {
        &self.processor
    }

    /// Dispatch the next command, if any.
    pub(crate) fn dispatch_next(
        &mut self,
        commands: &mut dyn MessageStore,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<DispatchOutcome> {
        let outcome = {
            let Some(message) = commands.peek(&self.poller) else {
                return Ok(DispatchOutcome::Idle);
            };
            let command = CommandRecord::parse(message.bytes)?;
            let source_id = command.source_id();
            let source_sequence = command.source_sequence();
            ctx.transient.on_command_available(source_id, source_sequence);

            let last_applied = ctx.base_state.last_applied_command_sequence(source_id);
            if source_sequence <= last_applied {
                self.duplicates.on_duplicate(&command, last_applied);
                DispatchOutcome::Duplicate
            } else {
                if source_sequence != last_applied + 1 {
                    warn!(
                        source_id,
                        source_sequence,
                        last_applied,
                        "source sequence gap in command log"
                    );
                }
                let outcome = self.process(&command, ctx)?;
                DispatchOutcome::Processed(outcome)
            }
        };

        commands.advance(&self.poller)?;
        Ok(outcome)
    }

    fn process(
        &mut self,
        command: &CommandRecord<'_>,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<TransactionOutcome> {
        self.transaction.begin();

        let processor = &mut self.processor;
        let transaction = &mut self.transaction;
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut router = EventRouter::new(*command, ctx.base_state, transaction);
            processor.on_command(command, &mut router)
        }));

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(
                    source_id = command.source_id(),
                    source_sequence = command.source_sequence(),
                    panic = %message,
                    "command processor panicked"
                );
                Some(anyhow::anyhow!("command processor panicked: {message}"))
            }
        };
        if let Some(e) = failure {
            ctx.exceptions.on_processing_error(command, &e);
            self.transaction.abort();
        }

        let first_event_sequence = ctx.events.len() + 1;
        let event_time = ctx.time.now();
        let outcome = self
            .transaction
            .encode_batch(command, first_event_sequence, event_time)?;
        ctx.events.append_batch(&self.transaction.batch())?;

        let count = u64::from(outcome.event_count());
        ctx.transient
            .on_event_available(first_event_sequence + count - 1, event_time);
        debug!(
            source_id = command.source_id(),
            source_sequence = command.source_sequence(),
            first_event_sequence,
            events = count,
            outcome = ?outcome,
            "command transaction appended"
        );
        Ok(outcome)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
