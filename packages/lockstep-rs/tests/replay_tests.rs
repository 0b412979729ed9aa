//! Replay tests: a fresh engine replaying the event log must end up in the
//! same state as the live engine that wrote it.

use lockstep::testing::ledger::{self, Ledger};
use lockstep::testing::{event_log, RecordingApplier};
use lockstep::{
    BaseState, DefaultBaseState, Engine, EngineConfig, EventApplier, EventRecord, EventType,
    InMemoryStore, MessageStore, MutableBaseState, PayloadType, ReplayMode, SourceId,
};

const SOURCES: std::ops::RangeInclusive<SourceId> = 1..=4;

fn random_workload(seed: u64, commands: usize) -> Vec<(SourceId, PayloadType, String)> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..commands)
        .map(|_| {
            let source_id = rng.i32(SOURCES);
            match rng.u8(0..4) {
                0 => (source_id, ledger::DEPOSIT, format!("deposit:{}", rng.i64(1..=100))),
                1 => (source_id, ledger::WITHDRAW, format!("withdraw:{}", rng.i64(1..=150))),
                2 => {
                    let steps: Vec<String> = (0..rng.usize(1..=4))
                        .map(|_| rng.i64(-60..=60).to_string())
                        .collect();
                    (source_id, ledger::BATCH, format!("batch:{}", steps.join(",")))
                }
                _ => (source_id, ledger::NOTE, "note".to_string()),
            }
        })
        .collect()
}

/// Send the workload, interleaving cycles at random, and run until idle.
fn run_live(seed: u64, commands: usize) -> (Ledger, Engine) {
    let ledger = Ledger::new();
    let mut engine = Engine::builder(
        Box::new(InMemoryStore::new()),
        Box::new(InMemoryStore::new()),
    )
    .with_processor(ledger.processor())
    .with_applier(ledger.applier())
    .build()
    .unwrap();
    engine.start().unwrap();

    let mut rng = fastrand::Rng::with_seed(seed ^ 0x5eed);
    for (source_id, payload_type, payload) in random_workload(seed, commands) {
        engine
            .send(source_id, payload_type, payload.as_bytes())
            .unwrap();
        if rng.u8(0..4) == 0 {
            engine.run_cycle().unwrap();
        }
    }
    engine.run_until_idle().unwrap();
    (ledger, engine)
}

fn watermarks(base: &dyn BaseState) -> (u64, Vec<u64>) {
    (
        base.last_applied_event_sequence(),
        SOURCES
            .map(|source_id| base.last_applied_command_sequence(source_id))
            .collect(),
    )
}

#[test]
fn test_restart_replays_to_identical_state() {
    for seed in [1, 7, 42, 1337] {
        let (live_ledger, engine) = run_live(seed, 150);
        let live_watermarks = watermarks(engine.base_state());
        let event_count = engine.event_store().len();
        assert!(!engine.has_in_flight_command(), "seed {seed}");

        let (commands, events) = engine.into_stores();
        let replay_ledger = Ledger::new();
        let mut engine = Engine::builder(commands, events)
            .with_processor(replay_ledger.processor())
            .with_applier(replay_ledger.applier())
            .build()
            .unwrap();
        let status = engine.start().unwrap();
        engine.run_until_idle().unwrap();

        assert_eq!(status.replayed_events, event_count, "seed {seed}");
        assert_eq!(status.in_flight_restored, 0, "seed {seed}");
        assert_eq!(replay_ledger.balances(), live_ledger.balances(), "seed {seed}");
        assert_eq!(watermarks(engine.base_state()), live_watermarks, "seed {seed}");
        // nothing is dispatched twice
        assert_eq!(engine.event_store().len(), event_count, "seed {seed}");
    }
}

#[test]
fn test_event_log_shape_holds_for_random_workloads() {
    for seed in [3, 11, 99] {
        let commands = 120;
        let (_, engine) = run_live(seed, commands);
        let events = event_log(engine.event_store());

        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, commands, "one terminal event per command, seed {seed}");

        let mut next_index = 0;
        let mut last_terminal = std::collections::HashMap::new();
        for (position, event) in events.iter().enumerate() {
            assert_eq!(event.event_sequence, position as u64 + 1);
            assert_eq!(event.event_index, next_index, "seed {seed}");
            if event.is_terminal() {
                next_index = 0;
                let previous = last_terminal.insert(event.source_id, event.source_sequence);
                assert_eq!(
                    previous.unwrap_or(0) + 1,
                    event.source_sequence,
                    "source {} skipped a sequence, seed {seed}",
                    event.source_id
                );
            } else {
                next_index += 1;
            }
        }
    }
}

#[test]
fn test_base_state_rebuilt_from_log_matches_live() {
    let (_, engine) = run_live(2024, 100);

    let mut rebuilt = DefaultBaseState::new();
    let store = engine.event_store();
    for index in 0..store.len() {
        let event = EventRecord::parse(store.read(index).unwrap()).unwrap();
        rebuilt.on_event_applied(&event);
    }
    assert_eq!(watermarks(&rebuilt), watermarks(engine.base_state()));
}

#[test]
fn test_restored_snapshot_replays_only_the_tail() {
    let (live_ledger, engine) = run_live(77, 80);
    let live_watermarks = watermarks(engine.base_state());
    let (commands, events) = engine.into_stores();

    // state as of the first half of the log, as a snapshot would hold it
    let half = events.len() / 2;
    let ledger = Ledger::new();
    let mut applier = ledger.applier();
    let mut base = DefaultBaseState::new();
    for index in 0..half {
        let event = EventRecord::parse(events.read(index).unwrap()).unwrap();
        base.on_event_applied(&event);
        applier.on_event(&event);
    }
    let restored = DefaultBaseState::restore(&base.snapshot().unwrap()).unwrap();
    assert_eq!(restored, base);

    let total = events.len();
    let mut engine = Engine::builder(commands, events)
        .with_processor(ledger.processor())
        .with_applier(ledger.applier())
        .with_base_state(restored)
        .build()
        .unwrap();
    let status = engine.start().unwrap();

    assert_eq!(status.replayed_events, total - half);
    assert_eq!(ledger.balances(), live_ledger.balances());
    assert_eq!(watermarks(engine.base_state()), live_watermarks);
}

#[test]
fn test_replay_non_aborted_hides_rollbacks_from_appliers() {
    let ledger = Ledger::new();
    let recorder = RecordingApplier::new("recorder");
    let mut engine = Engine::builder(
        Box::new(InMemoryStore::new()),
        Box::new(InMemoryStore::new()),
    )
    .with_config(EngineConfig::default().with_replay_mode(ReplayMode::ReplayNonAborted))
    .with_processor(ledger.processor())
    .with_applier(ledger.applier())
    .with_plugin(recorder.clone().into_plugin())
    .build()
    .unwrap();
    engine.start().unwrap();

    engine.send(1, ledger::DEPOSIT, b"deposit:10").unwrap();
    engine.send(1, ledger::WITHDRAW, b"withdraw:99").unwrap();
    engine.send(1, ledger::NOTE, b"note").unwrap();
    engine.run_until_idle().unwrap();

    let seen: Vec<EventType> = recorder.events().iter().map(|e| e.event_type).collect();
    assert_eq!(seen, vec![EventType::Commit, EventType::AutoCommit]);
    // the rollback still counts as applied
    assert_eq!(engine.base_state().last_applied_command_sequence(1), 3);
    assert_eq!(engine.base_state().last_applied_event_sequence(), 3);

    // and is filtered the same way on replay
    let (commands, events) = engine.into_stores();
    let replayed = RecordingApplier::new("replayed");
    let mut engine = Engine::builder(commands, events)
        .with_config(EngineConfig::default().with_replay_mode(ReplayMode::ReplayNonAborted))
        .with_plugin(replayed.clone().into_plugin())
        .build()
        .unwrap();
    engine.start().unwrap();
    assert_eq!(replayed.events(), recorder.events());
}

#[test]
fn test_replay_all_shows_every_event() {
    let ledger = Ledger::new();
    let recorder = RecordingApplier::new("recorder");
    let mut engine = Engine::builder(
        Box::new(InMemoryStore::new()),
        Box::new(InMemoryStore::new()),
    )
    .with_processor(ledger.processor())
    .with_plugin(recorder.clone().into_plugin())
    .build()
    .unwrap();
    engine.start().unwrap();

    engine.send(1, ledger::WITHDRAW, b"withdraw:1").unwrap();
    engine.run_until_idle().unwrap();

    let seen: Vec<EventType> = recorder.events().iter().map(|e| e.event_type).collect();
    assert_eq!(seen, vec![EventType::Rollback]);
}
