//! Output publishing.
//!
//! # Overview
//!
//! Outputs perform the side effects of applied events: notify a client, call
//! another service, or enqueue follow-up work as a **loopback command**.
//! Output sits outside the transaction boundary:
//!
//! - each output reads the event log through its own durable poller
//!   (`output:<name>`), so a slow or failing output never holds back another
//! - only events that are already applied are published
//! - a failing event is retried on later cycles, up to the retry budget, then
//!   reported to the [`ExceptionHandler`] and skipped
//! - nothing is ever rolled back: delivery is at-least-once
//!
//! # Acknowledgement
//!
//! ```text
//! publish(event) ──► Ok(Ack::Committed) ──► advance
//!                ├─► Ok(Ack::Ignored)   ──► advance
//!                ├─► Ok(Ack::Retry)     ──┐
//!                └─► Err(e)             ──┴─► attempts < budget ? retry next cycle
//!                                                              : report, advance
//! ```

use std::fmt;

use serde::Serialize;
use tracing::{trace, warn};

use crate::composite::{Capability, Chain, ChainOrder};
use crate::core::{PayloadType, SourceId};
use crate::error::{LockstepError, Result};
use crate::handler::ExceptionHandler;
use crate::sequencer::CommandSender;
use crate::store::MessageStore;
use crate::wire::EventRecord;

/// What an output did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Ack {
    /// The side effect happened.
    Committed,
    /// The event is of no interest to this output.
    Ignored,
    /// Try the same event again on a later cycle.
    Retry,
}

/// Publishes applied events to the outside world.
pub trait Output: Capability {
    fn publish(&mut self, event: &EventRecord<'_>, ctx: &mut OutputContext<'_, '_>)
        -> anyhow::Result<Ack>;
}

/// Per-event context handed to [`Output::publish`].
pub struct OutputContext<'s, 'a> {
    replay: bool,
    attempt: u32,
    loopback_source_id: SourceId,
    sender: &'s mut CommandSender<'a>,
}

impl<'s, 'a> OutputContext<'s, 'a> {
    pub(crate) fn new(
        replay: bool,
        attempt: u32,
        loopback_source_id: SourceId,
        sender: &'s mut CommandSender<'a>,
    ) -> Self {
        Self {
            replay,
            attempt,
            loopback_source_id,
            sender,
        }
    }

    /// Returns true if the event was already in the log when the engine
    /// started.
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// Attempt number for this event, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Feed a command back into the pipeline from the loopback source.
    pub fn loopback(&mut self, payload_type: PayloadType, payload: &[u8]) -> Result<u64> {
        self.sender
            .send(self.loopback_source_id, payload_type, payload)
    }

    /// Full sender access, for outputs that own their own source.
    pub fn sender(&mut self) -> &mut CommandSender<'a> {
        self.sender
    }
}

// =============================================================================
// Publisher
// =============================================================================

struct OutputSlot {
    output: Box<dyn Output>,
    poller: String,
    attempts: u32,
}

/// Tallies of one publish step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Events acknowledged with [`Ack::Committed`].
    pub published: u64,
    /// Events acknowledged with [`Ack::Ignored`].
    pub ignored: u64,
    /// Failed attempts that will be retried.
    pub retries: u64,
    /// Events given up on after the retry budget.
    pub failures: u64,
}

impl PublishReport {
    /// Units of work done, for duty-cycle progress.
    pub fn work(&self) -> usize {
        (self.published + self.ignored + self.retries + self.failures) as usize
    }
}

/// Borrowed engine parts a publish step needs.
pub(crate) struct PublishContext<'a> {
    pub events: &'a mut dyn MessageStore,
    pub last_applied_event_sequence: u64,
    pub replay_end: u64,
    pub exceptions: &'a mut dyn ExceptionHandler,
}

/// Drives every output over the applied part of the event log.
pub struct OutputPublisher {
    slots: Vec<OutputSlot>,
    retry_budget: u32,
    loopback_source_id: SourceId,
}

impl OutputPublisher {
    /// Build the publisher. Application outputs run before extension outputs.
    ///
    /// Output names must be unique: they name the durable pollers.
    pub fn new(
        application: Vec<Box<dyn Output>>,
        extensions: Vec<Box<dyn Output>>,
        retry_budget: u32,
        loopback_source_id: SourceId,
    ) -> Result<Self> {
        let chain: Chain<dyn Output> =
            Chain::compose(application, extensions, ChainOrder::ApplicationFirst);

        let mut slots: Vec<OutputSlot> = Vec::with_capacity(chain.len());
        for output in chain.into_members() {
            let name = output.name().to_string();
            if slots.iter().any(|slot| slot.output.name() == name) {
                return Err(LockstepError::DuplicateOutput { name });
            }
            slots.push(OutputSlot {
                poller: format!("output:{name}"),
                output,
                attempts: 0,
            });
        }

        Ok(Self {
            slots,
            retry_budget: retry_budget.max(1),
            loopback_source_id,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Names of the outputs in publish order.
    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.output.name()).collect()
    }

    /// Durable poller names, one per output.
    pub fn pollers(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.poller.as_str())
    }

    /// Publish up to `limit` events per output.
    pub(crate) fn publish(
        &mut self,
        ctx: &mut PublishContext<'_>,
        sender: &mut CommandSender<'_>,
        limit: usize,
    ) -> Result<PublishReport> {
        let mut report = PublishReport::default();
        for slot in &mut self.slots {
            for _ in 0..limit {
                let Some(message) = ctx.events.peek(&slot.poller) else {
                    break;
                };
                let event = EventRecord::parse(message.bytes)?;
                if event.event_sequence() > ctx.last_applied_event_sequence {
                    break;
                }

                slot.attempts += 1;
                let attempt = slot.attempts;
                let replay = message.index < ctx.replay_end;
                let result = {
                    let mut octx =
                        OutputContext::new(replay, attempt, self.loopback_source_id, sender);
                    slot.output.publish(&event, &mut octx)
                };

                let failure = match result {
                    Ok(Ack::Committed) => {
                        report.published += 1;
                        None
                    }
                    Ok(Ack::Ignored) => {
                        report.ignored += 1;
                        None
                    }
                    Ok(Ack::Retry) => Some(anyhow::anyhow!(
                        "output requested a retry on attempt {attempt}"
                    )),
                    Err(e) => Some(e),
                };

                if let Some(e) = failure {
                    if attempt < self.retry_budget {
                        warn!(
                            output = slot.output.name(),
                            event_sequence = event.event_sequence(),
                            attempt,
                            error = %format!("{e:#}"),
                            "output failed, will retry"
                        );
                        report.retries += 1;
                        break;
                    }
                    ctx.exceptions
                        .on_output_error(slot.output.name(), &event, attempt, &e);
                    report.failures += 1;
                }

                trace!(
                    output = slot.output.name(),
                    event_sequence = event.event_sequence(),
                    attempt,
                    "output done with event"
                );
                slot.attempts = 0;
                ctx.events.advance(&slot.poller)?;
            }
        }
        Ok(report)
    }
}

impl fmt::Debug for OutputPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPublisher")
            .field("outputs", &self.names())
            .field("retry_budget", &self.retry_budget)
            .field("loopback_source_id", &self.loopback_source_id)
            .finish()
    }
}

// =============================================================================
// Adapters
// =============================================================================

/// Output backed by a closure. See [`output_fn`].
pub struct FnOutput<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named [`Output`].
pub fn output_fn<F>(name: impl Into<String>, f: F) -> FnOutput<F>
where
    F: FnMut(&EventRecord<'_>, &mut OutputContext<'_, '_>) -> anyhow::Result<Ack>,
{
    FnOutput {
        name: name.into(),
        f,
    }
}

impl<F> Capability for FnOutput<F> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> Output for FnOutput<F>
where
    F: FnMut(&EventRecord<'_>, &mut OutputContext<'_, '_>) -> anyhow::Result<Ack>,
{
    fn publish(
        &mut self,
        event: &EventRecord<'_>,
        ctx: &mut OutputContext<'_, '_>,
    ) -> anyhow::Result<Ack> {
        (self.f)(event, ctx)
    }
}
