//! The lockstep engine and its duty cycle.
//!
//! # Overview
//!
//! [`Engine`] owns every piece of mutable state and drives it from a single
//! thread. There are no locks: each step borrows exactly the parts it needs.
//!
//! ```text
//! Input ──send──► [command store] ──► Dispatcher ──► Transaction
//!                       ▲                                 │ append batch
//!                       │ loopback                        ▼
//!                    Outputs ◄────── Applier ◄──── [event store]
//!                                       │
//!                                       ▼
//!                          BaseState + application state
//! ```
//!
//! # Duty Cycle
//!
//! [`Engine::run_cycle`] runs the steps in a fixed order and returns the
//! amount of work done; zero means idle:
//!
//! 1. application inputs
//! 2. command dispatch (each command's events are applied right away)
//! 3. event application (events appended by anyone else)
//! 4. output publishing
//! 5. extension inputs
//!
//! # Lifecycle
//!
//! ```ignore
//! let mut engine = Engine::builder(Box::new(commands), Box::new(events))
//!     .with_processor(LedgerProcessor::new(ledger.clone()))
//!     .with_applier(LedgerApplier::new(ledger.clone()))
//!     .build()?;
//!
//! engine.start()?;                       // replay the event log
//! engine.send(7, DEPOSIT, b"deposit:100")?;
//! engine.run_until_idle()?;
//! ```
//!
//! `start` replays every event the base state has not seen through the
//! applier chain, then scans the command log so sequencers resume after the
//! highest logged sequence. Commands logged but not yet applied are put back
//! in flight in log order.

use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::applier::{CompositeApplier, EventApplication, EventApplier};
use crate::composite::{Chain, ChainOrder};
use crate::config::EngineConfig;
use crate::core::{PayloadType, SourceId};
use crate::dispatch::{CommandDispatcher, DispatchContext, DispatchOutcome};
use crate::error::{LockstepError, Result};
use crate::handler::{
    DuplicateHandler, ExceptionHandler, LoggingExceptionHandler, SkipDuplicateHandler,
};
use crate::inflight::InFlightTracker;
use crate::input::Input;
use crate::output::{Output, OutputPublisher, PublishContext};
use crate::plugin::{Installer, Plugin};
use crate::processor::{CommandProcessor, CompositeProcessor};
use crate::router::TransactionOutcome;
use crate::sequencer::{CommandSender, Sequencers};
use crate::state::{BaseState, DefaultBaseState, MutableBaseState, TransientEngineState};
use crate::store::MessageStore;
use crate::time::{SystemTimeSource, TimeSource};
use crate::wire::{CommandRecord, EventRecord};

// =============================================================================
// Status and Counters
// =============================================================================

/// Lifecycle status of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub started: bool,
    /// Events applied by the startup replay.
    pub replayed_events: u64,
    /// Event log length at start; events below it are replays for outputs.
    pub replay_end: u64,
    /// Commands found in the command log at start.
    pub commands_scanned: u64,
    /// Logged but unapplied commands put back in flight at start.
    pub in_flight_restored: u64,
}

/// Running totals since the engine was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub cycles: u64,
    pub commands_sent: u64,
    pub commands_dispatched: u64,
    pub duplicates_skipped: u64,
    pub commits: u64,
    pub auto_commits: u64,
    pub rollbacks: u64,
    pub events_appended: u64,
    pub events_applied: u64,
    pub events_replayed: u64,
    pub outputs_published: u64,
    pub outputs_ignored: u64,
    pub output_retries: u64,
    pub output_failures: u64,
    pub input_failures: u64,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Engine`].
pub struct EngineBuilder {
    commands: Box<dyn MessageStore>,
    events: Box<dyn MessageStore>,
    config: EngineConfig,
    processor: Option<Box<dyn CommandProcessor>>,
    applier: Option<Box<dyn EventApplier>>,
    outputs: Vec<Box<dyn Output>>,
    inputs: Vec<Box<dyn Input>>,
    plugins: Vec<Box<dyn Plugin>>,
    base_state: Option<Box<dyn MutableBaseState>>,
    time: Option<Box<dyn TimeSource>>,
    exceptions: Option<Box<dyn ExceptionHandler>>,
    duplicates: Option<Box<dyn DuplicateHandler>>,
}

impl EngineBuilder {
    pub fn new(commands: Box<dyn MessageStore>, events: Box<dyn MessageStore>) -> Self {
        Self {
            commands,
            events,
            config: EngineConfig::default(),
            processor: None,
            applier: None,
            outputs: Vec::new(),
            inputs: Vec::new(),
            plugins: Vec::new(),
            base_state: None,
            time: None,
            exceptions: None,
            duplicates: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the application's command processor.
    pub fn with_processor(mut self, processor: impl CommandProcessor + 'static) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    /// Set the application's event applier.
    pub fn with_applier(mut self, applier: impl EventApplier + 'static) -> Self {
        self.applier = Some(Box::new(applier));
        self
    }

    /// Add an application output. Outputs publish in registration order.
    pub fn with_output(mut self, output: impl Output + 'static) -> Self {
        self.outputs.push(Box::new(output));
        self
    }

    /// Add an application input, polled in step 1 of the duty cycle.
    pub fn with_input(mut self, input: impl Input + 'static) -> Self {
        self.inputs.push(Box::new(input));
        self
    }

    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Use a custom base state, for example one restored from a snapshot.
    pub fn with_base_state(mut self, base_state: impl MutableBaseState + 'static) -> Self {
        self.base_state = Some(Box::new(base_state));
        self
    }

    pub fn with_time_source(mut self, time: impl TimeSource + 'static) -> Self {
        self.time = Some(Box::new(time));
        self
    }

    pub fn with_exception_handler(mut self, handler: impl ExceptionHandler + 'static) -> Self {
        self.exceptions = Some(Box::new(handler));
        self
    }

    pub fn with_duplicate_handler(mut self, handler: impl DuplicateHandler + 'static) -> Self {
        self.duplicates = Some(Box::new(handler));
        self
    }

    /// Install plugins and assemble the engine.
    ///
    /// Fails if two outputs share a name.
    pub fn build(mut self) -> Result<Engine> {
        let mut installer = Installer::new();
        let mut base_state = self.base_state.take();
        for plugin in &mut self.plugins {
            if base_state.is_none() {
                if let Some(provided) = plugin.base_state_provider() {
                    debug!(plugin = plugin.name(), "using base state provided by plugin");
                    base_state = Some(provided);
                }
            }
            plugin.install(&mut installer);
            debug!(plugin = plugin.name(), "plugin installed");
        }
        let base_state = base_state.unwrap_or_else(|| Box::new(DefaultBaseState::new()));

        let config = self.config;
        let processor =
            CompositeProcessor::new(self.processor.into_iter().collect(), installer.processors);
        let appliers = CompositeApplier::new(self.applier.into_iter().collect(), installer.appliers);
        let publisher = OutputPublisher::new(
            self.outputs,
            installer.outputs,
            config.output_retry_budget,
            config.loopback_source_id,
        )?;

        let dispatcher = CommandDispatcher::new(
            config.dispatcher_poller.clone(),
            processor,
            self.duplicates
                .unwrap_or_else(|| Box::new(SkipDuplicateHandler)),
        );
        let application = EventApplication::new(base_state, appliers, config.replay_mode);

        Ok(Engine {
            in_flight: InFlightTracker::with_capacity(config.in_flight_initial_capacity),
            commands: self.commands,
            events: self.events,
            dispatcher,
            application,
            publisher,
            inputs: Chain::compose(self.inputs, Vec::new(), ChainOrder::ApplicationFirst),
            extension_inputs: Chain::compose(Vec::new(), installer.inputs, ChainOrder::ApplicationFirst),
            sequencers: Sequencers::new(),
            transient: TransientEngineState::new(),
            time: self.time.unwrap_or_else(|| Box::new(SystemTimeSource::new())),
            exceptions: self
                .exceptions
                .unwrap_or_else(|| Box::new(LoggingExceptionHandler)),
            send_buffer: Vec::new(),
            counters: EngineCounters::default(),
            status: EngineStatus::default(),
            config,
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A single-threaded command/event engine.
pub struct Engine {
    config: EngineConfig,
    commands: Box<dyn MessageStore>,
    events: Box<dyn MessageStore>,
    dispatcher: CommandDispatcher,
    application: EventApplication,
    publisher: OutputPublisher,
    inputs: Chain<dyn Input>,
    extension_inputs: Chain<dyn Input>,
    sequencers: Sequencers,
    in_flight: InFlightTracker,
    transient: TransientEngineState,
    time: Box<dyn TimeSource>,
    exceptions: Box<dyn ExceptionHandler>,
    send_buffer: Vec<u8>,
    counters: EngineCounters,
    status: EngineStatus,
}

impl Engine {
    /// Start building an engine over a command store and an event store.
    pub fn builder(commands: Box<dyn MessageStore>, events: Box<dyn MessageStore>) -> EngineBuilder {
        EngineBuilder::new(commands, events)
    }

    /// Replay the event log and prepare the sequencers.
    pub fn start(&mut self) -> Result<EngineStatus> {
        if self.status.started {
            return Err(LockstepError::AlreadyStarted);
        }

        let from = self.application.base_state().last_applied_event_sequence();
        self.events.move_to(&self.config.applier_poller, from)?;
        let mut replayed = 0;
        while self.apply_next()? {
            replayed += 1;
        }
        self.counters.events_replayed += replayed;
        self.status.replayed_events = replayed;
        self.status.replay_end = self.events.len();

        self.scan_commands()?;
        self.status.started = true;
        info!(
            replayed_events = replayed,
            last_applied_event_sequence = self.application.base_state().last_applied_event_sequence(),
            commands_scanned = self.status.commands_scanned,
            in_flight = self.in_flight.in_flight_commands(),
            "engine started"
        );
        Ok(self.status)
    }

    fn scan_commands(&mut self) -> Result<()> {
        let base_state = self.application.base_state();
        let total = self.commands.len();
        for index in 0..total {
            let Some(bytes) = self.commands.read(index) else {
                break;
            };
            let command = CommandRecord::parse(bytes)?;
            let source_id = command.source_id();
            let source_sequence = command.source_sequence();

            let pending = source_sequence > base_state.last_applied_command_sequence(source_id)
                && source_sequence > self.transient.max_available_source_sequence(source_id);
            if pending {
                self.in_flight
                    .on_command_sent(source_id, source_sequence, command.command_time());
                self.status.in_flight_restored += 1;
            }
            self.transient
                .on_command_available(source_id, source_sequence);
        }
        self.status.commands_scanned = total;
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        if self.status.started {
            Ok(())
        } else {
            Err(LockstepError::NotStarted)
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// A sender for commands of any source.
    pub fn sender(&mut self) -> Result<CommandSender<'_>> {
        self.ensure_started()?;
        Ok(CommandSender::new(
            &mut *self.commands,
            &mut self.sequencers,
            &mut self.in_flight,
            &mut self.transient,
            self.application.base_state(),
            &*self.time,
            &mut self.send_buffer,
        ))
    }

    /// Send one command, returning its source sequence.
    pub fn send(
        &mut self,
        source_id: SourceId,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<u64> {
        self.sender()?.send(source_id, payload_type, payload)
    }

    // =========================================================================
    // Duty Cycle
    // =========================================================================

    /// Run all steps once, returning the work done.
    pub fn run_cycle(&mut self) -> Result<usize> {
        self.ensure_started()?;
        let result = self.run_steps();
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "fatal engine error, duty cycle stopped");
            }
        }
        self.counters.cycles += 1;
        result
    }

    fn run_steps(&mut self) -> Result<usize> {
        let mut work = self.poll_inputs(false);
        work += self.dispatch()?;
        work += self.apply(self.config.apply_batch_limit)?;
        work += self.publish()?;
        work += self.poll_inputs(true);
        Ok(work)
    }

    /// Run cycles until one does no work, returning the total work done.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..self.config.max_idle_cycles {
            let work = self.run_cycle()?;
            if work == 0 {
                return Ok(total);
            }
            total += work;
        }
        warn!(
            cycles = self.config.max_idle_cycles,
            "engine still busy after cycle cap"
        );
        Ok(total)
    }

    /// Step 1 and 5: poll application or extension inputs.
    fn poll_inputs(&mut self, extensions: bool) -> usize {
        let chain = if extensions {
            &mut self.extension_inputs
        } else {
            &mut self.inputs
        };
        if chain.is_empty() {
            return 0;
        }

        let mut sender = CommandSender::new(
            &mut *self.commands,
            &mut self.sequencers,
            &mut self.in_flight,
            &mut self.transient,
            self.application.base_state(),
            &*self.time,
            &mut self.send_buffer,
        );
        let mut work = 0;
        for input in chain.iter_mut() {
            match input.poll(&mut sender) {
                Ok(done) => work += done,
                Err(e) => {
                    self.exceptions.on_input_error(input.name(), &e);
                    self.counters.input_failures += 1;
                }
            }
        }
        work
    }

    /// Step 2: dispatch up to the batch limit of commands.
    pub fn dispatch(&mut self) -> Result<usize> {
        self.ensure_started()?;
        let mut work = 0;
        for _ in 0..self.config.dispatch_batch_limit {
            let outcome = {
                let mut ctx = DispatchContext {
                    events: &mut *self.events,
                    base_state: self.application.base_state(),
                    transient: &mut self.transient,
                    time: &*self.time,
                    exceptions: &mut *self.exceptions,
                };
                self.dispatcher
                    .dispatch_next(&mut *self.commands, &mut ctx)?
            };

            match outcome {
                DispatchOutcome::Idle => break,
                DispatchOutcome::Duplicate => self.counters.duplicates_skipped += 1,
                DispatchOutcome::Processed(transaction) => {
                    self.counters.commands_dispatched += 1;
                    self.counters.events_appended += u64::from(transaction.event_count());
                    match transaction {
                        TransactionOutcome::Committed { .. } => self.counters.commits += 1,
                        TransactionOutcome::AutoCommitted => self.counters.auto_commits += 1,
                        TransactionOutcome::RolledBack => self.counters.rollbacks += 1,
                    }
                }
            }
            work += 1;
            // the next duplicate check needs this command's terminal event
            work += self.apply(usize::MAX)?;
        }
        Ok(work)
    }

    /// Step 3: apply up to `limit` pending events.
    pub fn apply(&mut self, limit: usize) -> Result<usize> {
        self.ensure_started()?;
        let mut applied = 0;
        while applied < limit && self.apply_next()? {
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_next(&mut self) -> Result<bool> {
        let Some(message) = self.events.peek(&self.config.applier_poller) else {
            return Ok(false);
        };
        let event = EventRecord::parse(message.bytes)?;
        let (source_id, source_sequence) = (event.source_id(), event.source_sequence());
        // an ordering violation must leave state untouched
        self.in_flight
            .check(source_id, source_sequence, event.event_type())?;
        self.application.apply(&event)?;
        self.in_flight
            .on_event(source_id, source_sequence, event.event_type())?;
        self.transient
            .on_event_available(event.event_sequence(), event.event_time());
        self.events.advance(&self.config.applier_poller)?;
        self.counters.events_applied += 1;
        Ok(true)
    }

    /// Step 4: publish applied events to the outputs.
    pub fn publish(&mut self) -> Result<usize> {
        self.ensure_started()?;
        if self.publisher.is_empty() {
            return Ok(0);
        }

        let base_state = self.application.base_state();
        let mut sender = CommandSender::new(
            &mut *self.commands,
            &mut self.sequencers,
            &mut self.in_flight,
            &mut self.transient,
            base_state,
            &*self.time,
            &mut self.send_buffer,
        );
        let mut ctx = PublishContext {
            events: &mut *self.events,
            last_applied_event_sequence: base_state.last_applied_event_sequence(),
            replay_end: self.status.replay_end,
            exceptions: &mut *self.exceptions,
        };
        let report = self
            .publisher
            .publish(&mut ctx, &mut sender, self.config.publish_batch_limit)?;

        self.counters.outputs_published += report.published;
        self.counters.outputs_ignored += report.ignored;
        self.counters.output_retries += report.retries;
        self.counters.output_failures += report.failures;
        Ok(report.work())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            commands_sent: self.sequencers.sent(),
            ..self.counters
        }
    }

    pub fn base_state(&self) -> &dyn BaseState {
        self.application.base_state()
    }

    pub fn transient(&self) -> &TransientEngineState {
        &self.transient
    }

    pub fn in_flight(&self) -> &InFlightTracker {
        &self.in_flight
    }

    pub fn has_in_flight_command(&self) -> bool {
        self.in_flight.has_in_flight_command()
    }

    pub fn command_store(&self) -> &dyn MessageStore {
        &*self.commands
    }

    /// Raw access for external producers appending encoded commands.
    ///
    /// Commands appended here bypass the sequencers and in-flight tracking.
    /// A producer must own its sources: if it shares one with the engine's
    /// sender, the in-flight check fails the next cycle.
    pub fn command_store_mut(&mut self) -> &mut dyn MessageStore {
        &mut *self.commands
    }

    pub fn event_store(&self) -> &dyn MessageStore {
        &*self.events
    }

    /// Processor names in invocation order.
    pub fn processor_names(&self) -> Vec<&str> {
        self.dispatcher.processor().chain().names()
    }

    /// Applier names in invocation order.
    pub fn applier_names(&self) -> Vec<&str> {
        self.application.appliers().chain().names()
    }

    /// Output names in publish order.
    pub fn output_names(&self) -> Vec<&str> {
        self.publisher.names()
    }

    /// Drop the engine and hand back its stores, poller positions included.
    pub fn into_stores(self) -> (Box<dyn MessageStore>, Box<dyn MessageStore>) {
        (self.commands, self.events)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("status", &self.status)
            .field("counters", &self.counters())
            .field("dispatcher", &self.dispatcher.poller())
            .field("application", &self.application)
            .field("publisher", &self.publisher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::applier_fn;
    use crate::output::{output_fn, Ack};
    use crate::processor::processor_fn;
    use crate::store::InMemoryStore;
    use crate::testing::{ledger, RecordingApplier};
    use crate::time::ManualTimeSource;

    fn stores() -> (Box<dyn MessageStore>, Box<dyn MessageStore>) {
        (Box::new(InMemoryStore::new()), Box::new(InMemoryStore::new()))
    }

    struct AuditPlugin {
        with_state: bool,
    }

    impl Plugin for AuditPlugin {
        fn name(&self) -> &str {
            "audit"
        }

        fn install(&mut self, installer: &mut Installer) {
            installer
                .add_processor(processor_fn("audit-processor", |_, _| Ok(())))
                .add_applier(applier_fn("audit-applier", |_| {}))
                .add_output(output_fn("audit-output", |_, _| Ok(Ack::Ignored)));
        }

        fn base_state_provider(&mut self) -> Option<Box<dyn MutableBaseState>> {
            self.with_state
                .then(|| Box::new(DefaultBaseState::new()) as Box<dyn MutableBaseState>)
        }
    }

    #[test]
    fn test_send_before_start_is_rejected() {
        let (commands, events) = stores();
        let mut engine = Engine::builder(commands, events).build().unwrap();
        assert!(matches!(
            engine.send(1, 1, b"x"),
            Err(LockstepError::NotStarted)
        ));
        assert!(matches!(engine.run_cycle(), Err(LockstepError::NotStarted)));
        assert!(matches!(engine.apply(16), Err(LockstepError::NotStarted)));
        assert!(matches!(engine.dispatch(), Err(LockstepError::NotStarted)));

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(LockstepError::AlreadyStarted)));
    }

    #[test]
    fn test_plugin_members_follow_chain_order() {
        let (commands, events) = stores();
        let engine = Engine::builder(commands, events)
            .with_processor(processor_fn("app-processor", |_, _| Ok(())))
            .with_applier(applier_fn("app-applier", |_| {}))
            .with_output(output_fn("app-output", |_, _| Ok(Ack::Ignored)))
            .with_plugin(AuditPlugin { with_state: true })
            .build()
            .unwrap();

        assert_eq!(engine.processor_names(), vec!["app-processor", "audit-processor"]);
        assert_eq!(engine.applier_names(), vec!["audit-applier", "app-applier"]);
        assert_eq!(engine.output_names(), vec!["app-output", "audit-output"]);
    }

    #[test]
    fn test_duplicate_output_names_fail_the_build() {
        let (commands, events) = stores();
        let result = Engine::builder(commands, events)
            .with_output(output_fn("audit-output", |_, _| Ok(Ack::Ignored)))
            .with_plugin(AuditPlugin { with_state: false })
            .build();
        assert!(matches!(result, Err(LockstepError::DuplicateOutput { .. })));
    }

    #[test]
    fn test_deposit_scenario_and_duplicate_resubmission() {
        let (commands, events) = stores();
        let ledger = ledger::Ledger::new();
        let mut engine = Engine::builder(commands, events)
            .with_processor(ledger.processor())
            .with_applier(ledger.applier())
            .with_time_source(ManualTimeSource::new(1))
            .build()
            .unwrap();
        engine.start().unwrap();

        assert_eq!(engine.send(7, ledger::DEPOSIT, b"deposit:100").unwrap(), 1);
        engine.run_until_idle().unwrap();

        let event = crate::core::Event::decode(engine.event_store().read(0).unwrap()).unwrap();
        assert_eq!(event.event_index, 0);
        assert_eq!(event.event_type, crate::core::EventType::Commit);
        assert_eq!(event.payload_str(), Some("balance:100"));
        assert_eq!(engine.base_state().last_applied_command_sequence(7), 1);
        assert_eq!(engine.base_state().last_applied_event_sequence(), 1);
        assert!(!engine.has_in_flight_command());

        // redeliver the exact same command bytes
        let original = engine.command_store().read(0).unwrap().to_vec();
        let (mut commands, events) = engine.into_stores();
        commands.append(&original).unwrap();

        let mut engine = Engine::builder(commands, events)
            .with_processor(ledger.processor())
            .with_applier(ledger.applier())
            .build()
            .unwrap();
        ledger.reset();
        engine.start().unwrap();
        engine.run_until_idle().unwrap();

        assert_eq!(engine.counters().duplicates_skipped, 1);
        assert_eq!(engine.event_store().len(), 1);
        assert_eq!(engine.base_state().last_applied_event_sequence(), 1);
        assert_eq!(ledger.balance(7), 100);
    }

    #[test]
    fn test_restart_restores_unapplied_commands_in_flight() {
        let (commands, events) = stores();
        let ledger = ledger::Ledger::new();
        let mut engine = Engine::builder(commands, events)
            .with_processor(ledger.processor())
            .with_applier(ledger.applier())
            .build()
            .unwrap();
        engine.start().unwrap();
        engine.send(3, ledger::DEPOSIT, b"deposit:5").unwrap();
        engine.send(3, ledger::DEPOSIT, b"deposit:6").unwrap();
        // crash before dispatching anything
        let (commands, events) = engine.into_stores();

        ledger.reset();
        let recorder = RecordingApplier::new("recorder");
        let mut engine = Engine::builder(commands, events)
            .with_processor(ledger.processor())
            .with_applier(ledger.applier())
            .with_plugin(recorder.clone().into_plugin())
            .build()
            .unwrap();
        let status = engine.start().unwrap();
        assert_eq!(status.in_flight_restored, 2);
        assert_eq!(engine.in_flight().in_flight_commands_for(3), 2);

        // new sends continue after the logged sequences
        assert_eq!(engine.send(3, ledger::DEPOSIT, b"deposit:1").unwrap(), 3);
        engine.run_until_idle().unwrap();
        assert!(!engine.has_in_flight_command());
        assert_eq!(ledger.balance(3), 12);
        assert_eq!(recorder.len(), 3);
    }

    #[test]
    fn test_counters_track_outcomes() {
        let (commands, events) = stores();
        let ledger = ledger::Ledger::new();
        let mut engine = Engine::builder(commands, events)
            .with_processor(ledger.processor())
            .with_applier(ledger.applier())
            .build()
            .unwrap();
        engine.start().unwrap();
        engine.send(1, ledger::DEPOSIT, b"deposit:10").unwrap();
        engine.send(1, ledger::WITHDRAW, b"withdraw:50").unwrap();
        engine.send(1, ledger::NOTE, b"hello").unwrap();
        engine.run_until_idle().unwrap();

        let counters = engine.counters();
        assert_eq!(counters.commands_sent, 3);
        assert_eq!(counters.commands_dispatched, 3);
        assert_eq!(counters.commits, 1);
        assert_eq!(counters.rollbacks, 1);
        assert_eq!(counters.auto_commits, 1);
        assert_eq!(counters.events_applied, 3);
        assert_eq!(ledger.balance(1), 10);
    }
}
