//! End-to-end tests for sequencing, dedup and transaction routing.

use lockstep::testing::ledger::{self, Ledger};
use lockstep::testing::{command_log, event_log, ExceptionLog, FailingStore, ScenarioTest};
use std::cell::RefCell;
use std::rc::Rc;

use lockstep::{
    BaseState, CommandRecord, DuplicateHandler, Engine, EventType, InMemoryStore, LockstepError,
    ManualTimeSource, MessageStore,
};

fn ledger_engine(ledger: &Ledger) -> Engine {
    Engine::builder(
        Box::new(InMemoryStore::new()),
        Box::new(InMemoryStore::new()),
    )
    .with_processor(ledger.processor())
    .with_applier(ledger.applier())
    .build()
    .unwrap()
}

#[test]
fn test_deposit_routes_one_committed_event() {
    let ledger = Ledger::new();
    let time = ManualTimeSource::new(1_000);
    let engine = Engine::builder(
        Box::new(InMemoryStore::new()),
        Box::new(InMemoryStore::new()),
    )
    .with_processor(ledger.processor())
    .with_applier(ledger.applier())
    .with_time_source(time.clone())
    .build()
    .unwrap();

    let test = ScenarioTest::new(engine)
        .given(7, ledger::DEPOSIT, "deposit:100")
        .expect_sequence(1)
        .expect_events(1)
        .assert_base_state(|base| {
            base.last_applied_command_sequence(7) == 1 && base.last_applied_event_sequence() == 1
        });

    let events = test.step_events();
    let event = &events[0];
    assert_eq!(event.source_id, 7);
    assert_eq!(event.source_sequence, 1);
    assert_eq!(event.event_sequence, 1);
    assert_eq!(event.event_index, 0);
    assert_eq!(event.event_type, EventType::Commit);
    assert_eq!(event.event_time, 1_000);
    assert_eq!(event.payload_type, ledger::BALANCE);
    assert_eq!(event.payload_str(), Some("balance:100"));
    assert_eq!(ledger.balance(7), 100);
}

#[test]
fn test_redelivered_command_is_skipped() {
    let ledger = Ledger::new();
    let mut engine = ledger_engine(&ledger);
    engine.start().unwrap();
    engine.send(7, ledger::DEPOSIT, b"deposit:100").unwrap();
    engine.run_until_idle().unwrap();

    let (mut commands, events) = engine.into_stores();
    let original = commands.read(0).unwrap().to_vec();
    commands.append(&original).unwrap();
    commands.append(&original).unwrap();

    ledger.reset();
    let mut engine = Engine::builder(commands, events)
        .with_processor(ledger.processor())
        .with_applier(ledger.applier())
        .build()
        .unwrap();
    engine.start().unwrap();
    engine.run_until_idle().unwrap();

    assert_eq!(engine.counters().duplicates_skipped, 2);
    assert_eq!(engine.event_store().len(), 1);
    assert_eq!(ledger.balance(7), 100);

    // the sequencer resumes after the highest logged sequence
    assert_eq!(engine.send(7, ledger::DEPOSIT, b"deposit:1").unwrap(), 2);
}

/// Remembers `(source_id, source_sequence, last_applied)` per duplicate.
#[derive(Clone, Default)]
struct DuplicateLog(Rc<RefCell<Vec<(i32, u64, u64)>>>);

impl DuplicateHandler for DuplicateLog {
    fn on_duplicate(&mut self, command: &CommandRecord<'_>, last_applied: u64) {
        self.0
            .borrow_mut()
            .push((command.source_id(), command.source_sequence(), last_applied));
    }
}

#[test]
fn test_duplicate_handler_sees_skipped_commands() {
    let ledger = Ledger::new();
    let duplicates = DuplicateLog::default();
    let mut engine = Engine::builder(
        Box::new(InMemoryStore::new()),
        Box::new(InMemoryStore::new()),
    )
    .with_processor(ledger.processor())
    .with_applier(ledger.applier())
    .with_duplicate_handler(duplicates.clone())
    .build()
    .unwrap();
    engine.start().unwrap();

    engine.send(4, ledger::DEPOSIT, b"deposit:5").unwrap();
    engine.send(4, ledger::DEPOSIT, b"deposit:6").unwrap();
    engine.run_until_idle().unwrap();
    assert!(duplicates.0.borrow().is_empty());

    // redeliver the first command after both were applied
    let first = engine.command_store().read(0).unwrap().to_vec();
    engine.command_store_mut().append(&first).unwrap();
    engine.run_until_idle().unwrap();

    assert_eq!(*duplicates.0.borrow(), vec![(4, 1, 2)]);
    assert_eq!(engine.counters().duplicates_skipped, 1);
    assert_eq!(engine.event_store().len(), 2);
    assert_eq!(ledger.balance(4), 11);
}

#[test]
fn test_multi_event_transaction_commits_contiguously() {
    let ledger = Ledger::new();
    let test = ScenarioTest::new(ledger_engine(&ledger))
        .given(1, ledger::BATCH, "batch:10,20,30")
        .expect_event_types(&[EventType::Intermediary, EventType::Intermediary, EventType::Commit]);

    let events = test.step_events();
    let indexes: Vec<u32> = events.iter().map(|e| e.event_index).collect();
    let sequences: Vec<u64> = events.iter().map(|e| e.event_sequence).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(events.iter().all(|e| e.source_sequence == 1));
    assert_eq!(ledger.balance(1), 60);
}

#[test]
fn test_aborted_transaction_leaves_only_a_rollback() {
    let ledger = Ledger::new();
    let test = ScenarioTest::new(ledger_engine(&ledger))
        .given(1, ledger::DEPOSIT, "deposit:10")
        // three balance events are routed before the balance goes negative
        .then(1, ledger::BATCH, "batch:5,5,5,-100")
        .expect_event_types(&[EventType::Rollback])
        .expect_last_event(|e| e.payload.is_empty() && e.event_index == 0)
        .assert_base_state(|base| {
            base.last_applied_command_sequence(1) == 2 && base.last_applied_event_sequence() == 2
        });

    assert_eq!(ledger.balance(1), 10);
    assert_eq!(test.engine().counters().rollbacks, 1);
}

#[test]
fn test_command_without_events_auto_commits() {
    let ledger = Ledger::new();
    ScenarioTest::new(ledger_engine(&ledger))
        .given(4, ledger::NOTE, "remember the milk")
        .expect_event_types(&[EventType::AutoCommit])
        .expect_last_event(|e| e.source_id == 4 && e.source_sequence == 1)
        .assert_engine(|engine| engine.counters().auto_commits == 1);
}

#[test]
fn test_processor_failure_rolls_back_and_is_reported() {
    let ledger = Ledger::new();
    let log = ExceptionLog::new();
    let engine = Engine::builder(
        Box::new(InMemoryStore::new()),
        Box::new(InMemoryStore::new()),
    )
    .with_processor(ledger.processor())
    .with_applier(ledger.applier())
    .with_exception_handler(log.clone())
    .build()
    .unwrap();

    ScenarioTest::new(engine)
        .given(9, ledger::DEPOSIT, "deposit:oops")
        .expect_event_types(&[EventType::Rollback])
        .then(9, ledger::DEPOSIT, "deposit:5")
        .expect_event_types(&[EventType::Commit])
        .assert_base_state(|base| base.last_applied_command_sequence(9) == 2);

    let errors = log.processing_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!((errors[0].0, errors[0].1), (9, 1));
    assert!(errors[0].2.contains("invalid amount"));
    assert_eq!(ledger.balance(9), 5);
}

#[test]
fn test_source_sequences_are_gapless_per_source() {
    let ledger = Ledger::new();
    let mut engine = ledger_engine(&ledger);
    engine.start().unwrap();

    for round in 0..5 {
        for source_id in [3, 1, 2] {
            let sequence = engine
                .send(source_id, ledger::DEPOSIT, b"deposit:1")
                .unwrap();
            assert_eq!(sequence, round + 1);
        }
        if round % 2 == 0 {
            engine.run_cycle().unwrap();
        }
    }
    engine.run_until_idle().unwrap();

    let commands = command_log(engine.command_store());
    for source_id in [1, 2, 3] {
        let sequences: Vec<u64> = commands
            .iter()
            .filter(|c| c.source_id == source_id)
            .map(|c| c.source_sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    let events = event_log(engine.event_store());
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.event_sequence, index as u64 + 1);
    }
    assert_eq!(engine.counters().commands_sent, 15);
}

#[test]
fn test_failed_append_does_not_consume_a_sequence() {
    let ledger = Ledger::new();
    let commands = FailingStore::new();
    let fault = commands.fault();
    let mut engine = Engine::builder(Box::new(commands), Box::new(InMemoryStore::new()))
        .with_processor(ledger.processor())
        .with_applier(ledger.applier())
        .build()
        .unwrap();
    engine.start().unwrap();

    fault.fail();
    let err = engine.send(5, ledger::DEPOSIT, b"deposit:1").unwrap_err();
    assert!(matches!(err, LockstepError::Send { source_id: 5, .. }));
    assert!(!err.is_fatal());
    assert!(!engine.has_in_flight_command());

    fault.heal();
    assert_eq!(engine.send(5, ledger::DEPOSIT, b"deposit:1").unwrap(), 1);
    engine.run_until_idle().unwrap();
    assert_eq!(ledger.balance(5), 1);
}
