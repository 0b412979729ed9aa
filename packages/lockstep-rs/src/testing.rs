//! Testing utilities for lockstep engines.
//!
//! Recording members, fault injection and a small ledger application,
//! plus a fluent builder for end-to-end scenarios.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! lockstep = { path = "../lockstep-rs", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use lockstep::testing::{ledger::{self, Ledger}, ScenarioTest};
//!
//! let ledger = Ledger::new();
//! ScenarioTest::new(ledger.engine())
//!     .given(7, ledger::DEPOSIT, "deposit:100")
//!     .expect_sequence(1)
//!     .expect_event_types(&[EventType::Commit])
//!     .then(7, ledger::WITHDRAW, "withdraw:500")
//!     .expect_event_types(&[EventType::Rollback])
//!     .assert_base_state(|base| base.last_applied_command_sequence(7) == 2);
//!
//! assert_eq!(ledger.balance(7), 100);
//! ```
//!
//! Members record into `Rc` handles. Clone the member before handing it to
//! the engine and keep the clone for assertions:
//!
//! ```ignore
//! let recorder = RecordingOutput::new("recorder");
//! let engine = builder.with_output(recorder.clone()).build()?;
//! // ...
//! assert_eq!(recorder.len(), 3);
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::anyhow;

use crate::applier::EventApplier;
use crate::composite::Capability;
use crate::core::{Command, Event, EventType, PayloadType, SourceId};
use crate::engine::Engine;
use crate::handler::ExceptionHandler;
use crate::output::{Ack, Output, OutputContext};
use crate::plugin::{plugin_fn, Installer, Plugin};
use crate::state::BaseState;
use crate::store::{InMemoryStore, MessageStore, StoreError};
use crate::wire::{CommandRecord, EventRecord};

/// Decode every event in a store, in log order.
///
/// # Panics
///
/// Panics if a message is not a valid event.
pub fn event_log(store: &dyn MessageStore) -> Vec<Event> {
    (0..store.len())
        .filter_map(|index| store.read(index))
        .map(|bytes| Event::decode(bytes).expect("event store holds a malformed event"))
        .collect()
}

/// Decode every command in a store, in log order.
///
/// # Panics
///
/// Panics if a message is not a valid command.
pub fn command_log(store: &dyn MessageStore) -> Vec<Command> {
    (0..store.len())
        .filter_map(|index| store.read(index))
        .map(|bytes| Command::decode(bytes).expect("command store holds a malformed command"))
        .collect()
}

// =============================================================================
// Recording Members
// =============================================================================

/// Applier that records every event it sees.
#[derive(Clone)]
pub struct RecordingApplier {
    name: String,
    seen: Rc<RefCell<Vec<Event>>>,
}

impl RecordingApplier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Rc::default(),
        }
    }

    /// Events seen so far, in application order.
    pub fn events(&self) -> Vec<Event> {
        self.seen.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.borrow().is_empty()
    }

    /// Wrap this applier in a plugin that installs it as an extension.
    pub fn into_plugin(self) -> impl Plugin {
        let name = format!("{}-plugin", self.name);
        let mut applier = Some(self);
        plugin_fn(name, move |installer: &mut Installer| {
            if let Some(applier) = applier.take() {
                installer.add_applier(applier);
            }
        })
    }
}

impl Capability for RecordingApplier {
    fn name(&self) -> &str {
        &self.name
    }
}

impl EventApplier for RecordingApplier {
    fn on_event(&mut self, event: &EventRecord<'_>) {
        self.seen.borrow_mut().push(event.to_event());
    }
}

/// One call to [`Output::publish`], as seen by a recording output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub event: Event,
    pub replay: bool,
    pub attempt: u32,
}

/// Output that records every publish and answers with a fixed [`Ack`].
#[derive(Clone)]
pub struct RecordingOutput {
    name: String,
    ack: Ack,
    published: Rc<RefCell<Vec<Published>>>,
}

impl RecordingOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ack: Ack::Committed,
            published: Rc::default(),
        }
    }

    pub fn with_ack(mut self, ack: Ack) -> Self {
        self.ack = ack;
        self
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.borrow().clone()
    }

    /// Event sequences published, in publish order.
    pub fn event_sequences(&self) -> Vec<u64> {
        self.published
            .borrow()
            .iter()
            .map(|p| p.event.event_sequence)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.published.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.borrow().is_empty()
    }
}

impl Capability for RecordingOutput {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Output for RecordingOutput {
    fn publish(
        &mut self,
        event: &EventRecord<'_>,
        ctx: &mut OutputContext<'_, '_>,
    ) -> anyhow::Result<Ack> {
        self.published.borrow_mut().push(Published {
            event: event.to_event(),
            replay: ctx.is_replay(),
            attempt: ctx.attempt(),
        });
        Ok(self.ack)
    }
}

/// Output that fails the first `failures` attempts of every event.
#[derive(Clone)]
pub struct FlakyOutput {
    name: String,
    failures: u32,
    attempts: Rc<RefCell<Vec<(u64, u32)>>>,
}

impl FlakyOutput {
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            attempts: Rc::default(),
        }
    }

    /// Every `(event_sequence, attempt)` pair tried so far.
    pub fn attempts(&self) -> Vec<(u64, u32)> {
        self.attempts.borrow().clone()
    }

    /// Number of attempts made for one event.
    pub fn attempts_for(&self, event_sequence: u64) -> usize {
        self.attempts
            .borrow()
            .iter()
            .filter(|(seq, _)| *seq == event_sequence)
            .count()
    }
}

impl Capability for FlakyOutput {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Output for FlakyOutput {
    fn publish(
        &mut self,
        event: &EventRecord<'_>,
        ctx: &mut OutputContext<'_, '_>,
    ) -> anyhow::Result<Ack> {
        let attempt = ctx.attempt();
        self.attempts
            .borrow_mut()
            .push((event.event_sequence(), attempt));
        if attempt <= self.failures {
            return Err(anyhow!("flaky output failed attempt {attempt}"));
        }
        Ok(Ack::Committed)
    }
}

// =============================================================================
// Exception Log
// =============================================================================

/// Exception handler that records every report.
#[derive(Clone, Default)]
pub struct ExceptionLog {
    processing: Rc<RefCell<Vec<(SourceId, u64, String)>>>,
    outputs: Rc<RefCell<Vec<(String, u64, u32)>>>,
    inputs: Rc<RefCell<Vec<(String, String)>>>,
}

impl ExceptionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(source_id, source_sequence, error)` per processing failure.
    pub fn processing_errors(&self) -> Vec<(SourceId, u64, String)> {
        self.processing.borrow().clone()
    }

    /// `(output, event_sequence, attempts)` per exhausted event.
    pub fn output_errors(&self) -> Vec<(String, u64, u32)> {
        self.outputs.borrow().clone()
    }

    /// `(input, error)` per failed poll.
    pub fn input_errors(&self) -> Vec<(String, String)> {
        self.inputs.borrow().clone()
    }
}

impl ExceptionHandler for ExceptionLog {
    fn on_processing_error(&mut self, command: &CommandRecord<'_>, error: &anyhow::Error) {
        self.processing.borrow_mut().push((
            command.source_id(),
            command.source_sequence(),
            format!("{error:#}"),
        ));
    }

    fn on_output_error(
        &mut self,
        output: &str,
        event: &EventRecord<'_>,
        attempts: u32,
        _error: &anyhow::Error,
    ) {
        self.outputs
            .borrow_mut()
            .push((output.to_string(), event.event_sequence(), attempts));
    }

    fn on_input_error(&mut self, input: &str, error: &anyhow::Error) {
        self.inputs
            .borrow_mut()
            .push((input.to_string(), format!("{error:#}")));
    }
}

// =============================================================================
// Fault Injection
// =============================================================================

/// Switch controlling a [`FailingStore`].
#[derive(Clone, Default)]
pub struct StoreFault(Rc<Cell<bool>>);

impl StoreFault {
    /// Make every following append fail.
    pub fn fail(&self) {
        self.0.set(true);
    }

    /// Let appends succeed again.
    pub fn heal(&self) {
        self.0.set(false);
    }

    pub fn is_failing(&self) -> bool {
        self.0.get()
    }
}

/// In-memory store whose appends can be made to fail on demand.
#[derive(Default)]
pub struct FailingStore {
    inner: InMemoryStore,
    fault: StoreFault,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that switches failures on and off.
    pub fn fault(&self) -> StoreFault {
        self.fault.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fault.is_failing() {
            return Err(StoreError::Backend(anyhow!("injected append failure")));
        }
        Ok(())
    }
}

impl MessageStore for FailingStore {
    fn append(&mut self, message: &[u8]) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.append(message)
    }

    fn append_batch(&mut self, messages: &[&[u8]]) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.append_batch(messages)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read(&self, index: u64) -> Option<&[u8]> {
        self.inner.read(index)
    }

    fn position(&self, poller: &str) -> u64 {
        self.inner.position(poller)
    }

    fn advance(&mut self, poller: &str) -> Result<(), StoreError> {
        self.inner.advance(poller)
    }

    fn move_to(&mut self, poller: &str, position: u64) -> Result<(), StoreError> {
        self.inner.move_to(poller, position)
    }
}

// =============================================================================
// Ledger Application
// =============================================================================

/// A tiny account ledger used as the reference application in tests.
///
/// Every source is an account. Commands are UTF-8 text:
///
/// | payload type | payload             | events                                   |
/// |--------------|---------------------|------------------------------------------|
/// | `DEPOSIT`    | `deposit:<n>`       | one `balance:<new>`                       |
/// | `WITHDRAW`   | `withdraw:<n>`      | one `balance:<new>`, or abort if short    |
/// | `BATCH`      | `batch:<n>,<n>,...` | one `balance:<running>` per step, or abort once the balance goes negative |
/// | `NOTE`       | anything            | none (auto-commit)                        |
///
/// A payload of `panic` makes the processor panic, `fail` makes it return
/// an error. The applier sets balances from `BALANCE` events only, so the
/// ledger is fully rebuilt by replaying the event log.
pub mod ledger {
    use std::collections::BTreeMap;

    use anyhow::{bail, Context};

    use super::*;
    use crate::processor::CommandProcessor;
    use crate::router::EventRouter;

    pub const DEPOSIT: PayloadType = 1;
    pub const WITHDRAW: PayloadType = 2;
    pub const BATCH: PayloadType = 3;
    pub const NOTE: PayloadType = 4;
    pub const BALANCE: PayloadType = 10;

    /// Shared account balances.
    #[derive(Clone, Default)]
    pub struct Ledger {
        balances: Rc<RefCell<BTreeMap<SourceId, i64>>>,
    }

    impl Ledger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn processor(&self) -> LedgerProcessor {
            LedgerProcessor {
                ledger: self.clone(),
            }
        }

        pub fn applier(&self) -> LedgerApplier {
            LedgerApplier {
                ledger: self.clone(),
            }
        }

        /// An unstarted engine over fresh in-memory stores.
        pub fn engine(&self) -> Engine {
            Engine::builder(
                Box::new(InMemoryStore::new()),
                Box::new(InMemoryStore::new()),
            )
            .with_processor(self.processor())
            .with_applier(self.applier())
            .build()
            .expect("ledger engine builds")
        }

        pub fn balance(&self, source_id: SourceId) -> i64 {
            self.balances
                .borrow()
                .get(&source_id)
                .copied()
                .unwrap_or(0)
        }

        pub fn balances(&self) -> BTreeMap<SourceId, i64> {
            self.balances.borrow().clone()
        }

        /// Forget every balance, as a fresh process would.
        pub fn reset(&self) {
            self.balances.borrow_mut().clear();
        }
    }

    fn amount(text: &str, prefix: &str) -> anyhow::Result<i64> {
        let raw = text
            .strip_prefix(prefix)
            .with_context(|| format!("expected '{prefix}<amount>', got '{text}'"))?;
        raw.trim()
            .parse()
            .with_context(|| format!("invalid amount '{raw}'"))
    }

    fn route_balance(router: &mut EventRouter<'_>, balance: i64) -> anyhow::Result<()> {
        router.route(BALANCE, format!("balance:{balance}").as_bytes())?;
        Ok(())
    }

    /// Decides ledger commands against the current balances.
    pub struct LedgerProcessor {
        ledger: Ledger,
    }

    impl Capability for LedgerProcessor {
        fn name(&self) -> &str {
            "ledger-processor"
        }
    }

    impl CommandProcessor for LedgerProcessor {
        fn on_command(
            &mut self,
            command: &CommandRecord<'_>,
            router: &mut EventRouter<'_>,
        ) -> anyhow::Result<()> {
            let text = command
                .payload_str()
                .context("ledger commands are UTF-8")?;
            match text {
                "panic" => panic!("ledger asked to panic"),
                "fail" => bail!("ledger asked to fail"),
                _ => {}
            }

            let mut balance = self.ledger.balance(command.source_id());
            match command.payload_type() {
                DEPOSIT => route_balance(router, balance + amount(text, "deposit:")?),
                WITHDRAW => {
                    let amount = amount(text, "withdraw:")?;
                    if amount > balance {
                        router.abort();
                        return Ok(());
                    }
                    route_balance(router, balance - amount)
                }
                BATCH => {
                    let steps = text
                        .strip_prefix("batch:")
                        .with_context(|| format!("expected 'batch:<amounts>', got '{text}'"))?;
                    for step in steps.split(',') {
                        balance += step
                            .trim()
                            .parse::<i64>()
                            .with_context(|| format!("invalid amount '{step}'"))?;
                        if balance < 0 {
                            router.abort();
                            return Ok(());
                        }
                        route_balance(router, balance)?;
                    }
                    Ok(())
                }
                NOTE => Ok(()),
                other => bail!("unknown ledger payload type {other}"),
            }
        }
    }

    /// Applies `BALANCE` events to the shared balances.
    pub struct LedgerApplier {
        ledger: Ledger,
    }

    impl Capability for LedgerApplier {
        fn name(&self) -> &str {
            "ledger-applier"
        }
    }

    impl EventApplier for LedgerApplier {
        fn on_event(&mut self, event: &EventRecord<'_>) {
            if event.payload_type() != BALANCE {
                return;
            }
            let balance = event
                .payload_str()
                .and_then(|text| text.strip_prefix("balance:"))
                .and_then(|raw| raw.parse::<i64>().ok());
            if let Some(balance) = balance {
                self.ledger
                    .balances
                    .borrow_mut()
                    .insert(event.source_id(), balance);
            }
        }
    }
}

// =============================================================================
// Scenario Test
// =============================================================================

/// Fluent builder for end-to-end engine scenarios.
///
/// Each `given`/`then` sends one command and runs the engine until idle.
/// The `expect_*` assertions look at what that step did.
///
/// # Example
///
/// ```ignore
/// ScenarioTest::new(ledger.engine())
///     .given(1, ledger::BATCH, "batch:5,5,5")
///     .expect_event_types(&[EventType::Intermediary, EventType::Intermediary, EventType::Commit])
///     .then(1, ledger::NOTE, "hello")
///     .expect_events(1)
///     .assert_engine(|engine| !engine.has_in_flight_command());
/// ```
pub struct ScenarioTest {
    engine: Engine,
    last_sequence: Option<u64>,
    step_start: u64,
}

impl ScenarioTest {
    /// Wrap an engine, starting it if needed.
    pub fn new(mut engine: Engine) -> Self {
        if !engine.status().started {
            engine.start().expect("engine starts");
        }
        let step_start = engine.event_store().len();
        Self {
            engine,
            last_sequence: None,
            step_start,
        }
    }

    /// Send the first command of the scenario and run until idle.
    pub fn given(self, source_id: SourceId, payload_type: PayloadType, payload: &str) -> Self {
        self.step(source_id, payload_type, payload.as_bytes())
    }

    /// Send a follow-up command and run until idle.
    pub fn then(self, source_id: SourceId, payload_type: PayloadType, payload: &str) -> Self {
        self.step(source_id, payload_type, payload.as_bytes())
    }

    /// Run until idle without sending anything.
    pub fn run(mut self) -> Self {
        self.step_start = self.engine.event_store().len();
        self.last_sequence = None;
        self.engine.run_until_idle().expect("engine runs");
        self
    }

    fn step(mut self, source_id: SourceId, payload_type: PayloadType, payload: &[u8]) -> Self {
        self.step_start = self.engine.event_store().len();
        let sequence = self
            .engine
            .send(source_id, payload_type, payload)
            .expect("command is sent");
        self.last_sequence = Some(sequence);
        self.engine.run_until_idle().expect("engine runs");
        self
    }

    /// Events appended by the last step.
    pub fn step_events(&self) -> Vec<Event> {
        event_log(self.engine.event_store())
            .into_iter()
            .skip(self.step_start as usize)
            .collect()
    }

    /// Assert the source sequence assigned to the last command.
    pub fn expect_sequence(self, expected: u64) -> Self {
        assert_eq!(
            self.last_sequence,
            Some(expected),
            "Source sequence mismatch"
        );
        self
    }

    /// Assert how many events the last step appended.
    pub fn expect_events(self, expected: usize) -> Self {
        let events = self.step_events();
        assert_eq!(
            events.len(),
            expected,
            "Event count mismatch\n  events: {events:?}"
        );
        self
    }

    /// Assert the types of the events appended by the last step.
    pub fn expect_event_types(self, expected: &[EventType]) -> Self {
        let actual: Vec<EventType> = self.step_events().iter().map(|e| e.event_type).collect();
        assert_eq!(
            actual, expected,
            "Event types mismatch\n  expected: {expected:?}\n  actual: {actual:?}"
        );
        self
    }

    /// Assert the last appended event matches a predicate.
    pub fn expect_last_event<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&Event) -> bool,
    {
        let events = event_log(self.engine.event_store());
        let last = events.last().expect("event log is not empty");
        assert!(predicate(last), "Event predicate failed for {last}");
        self
    }

    /// Assert the base state matches a predicate.
    pub fn assert_base_state<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&dyn BaseState) -> bool,
    {
        assert!(
            predicate(self.engine.base_state()),
            "Base state predicate failed"
        );
        self
    }

    /// Assert the engine matches a predicate.
    pub fn assert_engine<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&Engine) -> bool,
    {
        assert!(predicate(&self.engine), "Engine predicate failed");
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Consume the test and return the engine.
    pub fn into_engine(self) -> Engine {
        self.engine
    }
}
