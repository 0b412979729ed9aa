//! Command processors.
//!
//! A [`CommandProcessor`] turns a command into events by routing them through
//! the [`EventRouter`]. Processors hold the business rules, so they may read
//! any deterministic state (the base state, application state rebuilt by
//! appliers) but must never mutate it: state only changes when the routed
//! events are applied.
//!
//! Returning an error, panicking, or calling [`EventRouter::abort`] all end
//! the transaction with a single `ROLLBACK` event.

use anyhow::Context;

use crate::composite::{Capability, Chain, ChainOrder};
use crate::router::EventRouter;
use crate::wire::CommandRecord;

/// Handles one command inside its transaction.
pub trait CommandProcessor: Capability {
    fn on_command(
        &mut self,
        command: &CommandRecord<'_>,
        router: &mut EventRouter<'_>,
    ) -> anyhow::Result<()>;
}

/// The processor chain: application processor first, then extensions.
///
/// Members after an aborting member are not invoked.
#[derive(Debug, Default)]
pub struct CompositeProcessor {
    chain: Chain<dyn CommandProcessor>,
}

impl CompositeProcessor {
    pub fn new(
        application: Vec<Box<dyn CommandProcessor>>,
        extensions: Vec<Box<dyn CommandProcessor>>,
    ) -> Self {
        Self {
            chain: Chain::compose(application, extensions, ChainOrder::ApplicationFirst),
        }
    }

    pub fn chain(&self) -> &Chain<dyn CommandProcessor> {
        &self.chain
    }
}

impl Capability for CompositeProcessor {
    fn name(&self) -> &str {
        "composite-processor"
    }

    fn is_noop(&self) -> bool {
        self.chain.is_empty()
    }
}

impl CommandProcessor for CompositeProcessor {
    fn on_command(
        &mut self,
        command: &CommandRecord<'_>,
        router: &mut EventRouter<'_>,
    ) -> anyhow::Result<()> {
        for processor in self.chain.iter_mut() {
            if router.is_aborted() {
                break;
            }
            // name is read up front: the processor is borrowed mutably below
            let name = processor.name().to_string();
            processor
                .on_command(command, router)
                .with_context(|| format!("command processor '{name}' failed"))?;
        }
        Ok(())
    }
}

// =============================================================================
// Adapters
// =============================================================================

/// A processor that does nothing; dropped from chains at build time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProcessor;

impl Capability for NoopProcessor {
    fn is_noop(&self) -> bool {
        true
    }
}

impl CommandProcessor for NoopProcessor {
    fn on_command(&mut self, _: &CommandRecord<'_>, _: &mut EventRouter<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Processor backed by a closure. See [`processor_fn`].
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named [`CommandProcessor`].
///
/// ```ignore
/// let echo = processor_fn("echo", |command, router| {
///     router.route(command.payload_type(), command.payload())?;
///     Ok(())
/// });
/// ```
pub fn processor_fn<F>(name: impl Into<String>, f: F) -> FnProcessor<F>
where
    F: FnMut(&CommandRecord<'_>, &mut EventRouter<'_>) -> anyhow::Result<()>,
{
    FnProcessor {
        name: name.into(),
        f,
    }
}

impl<F> Capability for FnProcessor<F> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> CommandProcessor for FnProcessor<F>
where
    F: FnMut(&CommandRecord<'_>, &mut EventRouter<'_>) -> anyhow::Result<()>,
{
    fn on_command(
        &mut self,
        command: &CommandRecord<'_>,
        router: &mut EventRouter<'_>,
    ) -> anyhow::Result<()> {
        (self.f)(command, router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Command, EventType};
    use crate::router::Transaction;
    use crate::state::DefaultBaseState;
    use crate::wire::EventRecord;

    fn run(processor: &mut CompositeProcessor) -> (anyhow::Result<()>, Vec<(EventType, Vec<u8>)>) {
        let mut bytes = Vec::new();
        Command::new(1, 1, 0, 1, "go").encode(&mut bytes).unwrap();
        let command = CommandRecord::parse(&bytes).unwrap();
        let state = DefaultBaseState::new();
        let mut tx = Transaction::new();
        tx.begin();

        let result = {
            let mut router = EventRouter::new(command, &state, &mut tx);
            processor.on_command(&command, &mut router)
        };
        if result.is_err() {
            tx.abort();
        }
        tx.encode_batch(&command, 1, 0).unwrap();
        let events = tx
            .batch()
            .iter()
            .map(|b| {
                let e = EventRecord::parse(b).unwrap();
                (e.event_type(), e.payload().to_vec())
            })
            .collect();
        (result, events)
    }

    fn router_with(tag: &'static str) -> Box<dyn CommandProcessor> {
        Box::new(processor_fn(tag, move |_, router| {
            router.route(1, tag.as_bytes())?;
            Ok(())
        }))
    }

    #[test]
    fn test_application_processor_routes_first() {
        let mut composite =
            CompositeProcessor::new(vec![router_with("app")], vec![router_with("ext")]);
        let (result, events) = run(&mut composite);
        assert!(result.is_ok());
        assert_eq!(
            events,
            vec![
                (EventType::Intermediary, b"app".to_vec()),
                (EventType::Commit, b"ext".to_vec()),
            ]
        );
    }

    #[test]
    fn test_abort_stops_the_chain() {
        let aborting: Box<dyn CommandProcessor> = Box::new(processor_fn("abort", |_, router| {
            router.abort();
            Ok(())
        }));
        let never: Box<dyn CommandProcessor> = Box::new(processor_fn("never", |_, _| {
            panic!("members after an abort must not run")
        }));
        let mut composite =
            CompositeProcessor::new(vec![router_with("app"), aborting], vec![never]);
        let (result, events) = run(&mut composite);
        assert!(result.is_ok());
        assert_eq!(events, vec![(EventType::Rollback, vec![])]);
    }

    #[test]
    fn test_error_is_wrapped_with_processor_name() {
        let failing: Box<dyn CommandProcessor> =
            Box::new(processor_fn("validator", |_, _| anyhow::bail!("bad amount")));
        let mut composite = CompositeProcessor::new(vec![failing], vec![]);
        let (result, events) = run(&mut composite);

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "command processor 'validator' failed");
        assert_eq!(err.root_cause().to_string(), "bad amount");
        assert_eq!(events, vec![(EventType::Rollback, vec![])]);
    }

    #[test]
    fn test_noop_processors_are_skipped() {
        let noop: Box<dyn CommandProcessor> = Box::new(NoopProcessor);
        let composite = CompositeProcessor::new(vec![noop], vec![router_with("ext")]);
        assert_eq!(composite.chain().names(), vec!["ext"]);
        assert_eq!(composite.chain().skipped().len(), 1);
    }

    #[test]
    fn test_empty_chain_auto_commits() {
        let mut composite = CompositeProcessor::default();
        assert!(composite.is_noop());
        let (result, events) = run(&mut composite);
        assert!(result.is_ok());
        assert_eq!(events, vec![(EventType::AutoCommit, vec![])]);
    }
}
