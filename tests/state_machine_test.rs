/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{fs, sync::mpsc, time::Duration};

use habitat_rs::{
    config::StateMachineConfiguration,
    events::Event,
    snapshot::SnapshotStore,
    state_machine::{CommunityState, MachineStatus, StateMachine, StateMachineError},
    transitions::{
        AddCommunity, InitCommunity, ReduceError, SubscriptionCategory, TransitionKind,
        UpdateBacknet,
    },
    types::{
        basic::{SequenceNumber, UserID},
        community::{Backnet, BacknetType, PortMap},
    },
    wal::encode_line,
};
use habitat_rs::logging::setup_logger;
use log::LevelFilter;

mod common;

use crate::common::fixtures::{
    add_member, community, community_machine, envelope, init, registry, COMMUNITY,
};

fn wal_lines(machine: &StateMachine<CommunityState>) -> usize {
    fs::read_to_string(machine.wal_path()).unwrap().lines().count()
}

fn snapshot_sequence_number(machine: &StateMachine<CommunityState>) -> Option<SequenceNumber> {
    SnapshotStore::open(machine.dir(), SubscriptionCategory::Community)
        .unwrap()
        .load::<CommunityState>()
        .unwrap()
        .map(|(_, metadata)| metadata.sequence_number)
}

fn files_starting_with(machine: &StateMachine<CommunityState>, prefix: &str) -> usize {
    fs::read_dir(machine.dir())
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with(prefix)
        })
        .count()
}

#[test]
fn duplicate_member_is_rejected_without_logging_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let machine = community_machine(dir.path(), 100);
    machine.restart().unwrap();

    // 1. Initialize the community and add u1.
    machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
    machine.apply(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();

    // 2. Adding u1 again is rejected.
    log::debug!("Adding u1 to c0 a second time.");
    let result = machine.apply(&envelope(add_member(COMMUNITY, "u1"), 3));
    assert!(matches!(
        result,
        Err(StateMachineError::Reduce(ReduceError::DuplicateMember { .. }))
    ));
    assert!(!result.unwrap_err().is_fatal());

    // 3. Only the 2 accepted transitions were logged, and the rejection changed nothing.
    assert_eq!(wal_lines(&machine), 2);
    assert_eq!(machine.sequence_number(), SequenceNumber::new(2));
    let state = machine.state();
    let c0 = state.community().unwrap();
    assert_eq!(c0.member_count(), 1);
    assert!(c0.has_member(&UserID::new("u1")));
    assert_eq!(machine.status(), MachineStatus::Ready);
}

#[test]
fn out_of_order_envelopes_are_rejected_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let machine = community_machine(dir.path(), 100);
    machine.restart().unwrap();
    machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
    machine.apply(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();

    // 0, the current sequence number, and current + 2 are all rejected.
    for sequence_number in [0, 2, 4] {
        let result = machine.apply(&envelope(add_member(COMMUNITY, "u2"), sequence_number));
        match result {
            Err(err @ StateMachineError::SequenceGap { expected, found }) => {
                assert_eq!(expected, SequenceNumber::new(3));
                assert_eq!(found, SequenceNumber::new(sequence_number));
                assert!(err.is_fatal());
            }
            other => panic!("expected a sequence gap, got {:?}", other),
        }
    }

    assert_eq!(wal_lines(&machine), 2);
    assert_eq!(machine.state().community().unwrap().member_count(), 1);

    // current + 1 is still accepted afterwards.
    machine.apply(&envelope(add_member(COMMUNITY, "u2"), 3)).unwrap();
    assert_eq!(machine.sequence_number(), SequenceNumber::new(3));
}

#[test]
fn restart_reproduces_state_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();

    // 1. Apply 8 transitions with a snapshot every 3.
    let (state, sequence_number) = {
        let machine = community_machine(dir.path(), 3);
        machine.restart().unwrap();
        machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
        for i in 2..=8u64 {
            machine
                .apply(&envelope(add_member(COMMUNITY, &format!("u{}", i)), i))
                .unwrap();
        }
        (machine.state(), machine.sequence_number())
    };
    assert_eq!(sequence_number, SequenceNumber::new(8));

    // 2. A new machine over the same directory reaches the same state, twice in a row.
    for _ in 0..2 {
        let machine = community_machine(dir.path(), 3);
        assert_eq!(machine.status(), MachineStatus::Uninitialized);
        assert_eq!(machine.restart().unwrap(), sequence_number);
        assert_eq!(machine.status(), MachineStatus::Ready);
        assert_eq!(machine.state(), state);
        assert_eq!(snapshot_sequence_number(&machine), Some(SequenceNumber::new(6)));
        // Only the entries after the last snapshot remain in the live log.
        assert_eq!(wal_lines(&machine), 2);
    }
}

#[test]
fn snapshot_every_interval_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let machine = community_machine(dir.path(), 2);
    machine.restart().unwrap();

    // 1. 2 transitions: exactly one snapshot, at 2.
    machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
    assert_eq!(snapshot_sequence_number(&machine), None);
    machine.apply(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();
    assert_eq!(snapshot_sequence_number(&machine), Some(SequenceNumber::new(2)));
    assert_eq!(files_starting_with(&machine, "snapshot-"), 0);
    assert_eq!(files_starting_with(&machine, "wal-2-"), 1);

    // 2. A 3rd transition leaves the snapshot alone.
    machine.apply(&envelope(add_member(COMMUNITY, "u2"), 3)).unwrap();
    assert_eq!(snapshot_sequence_number(&machine), Some(SequenceNumber::new(2)));
    assert_eq!(files_starting_with(&machine, "snapshot-"), 0);

    // 3. The 4th archives the snapshot at 2 and replaces it.
    machine.apply(&envelope(add_member(COMMUNITY, "u3"), 4)).unwrap();
    assert_eq!(snapshot_sequence_number(&machine), Some(SequenceNumber::new(4)));
    assert_eq!(files_starting_with(&machine, "snapshot-2-"), 1);
    assert_eq!(files_starting_with(&machine, "wal-4-"), 1);
    assert_eq!(wal_lines(&machine), 0);
}

#[test]
fn backnet_type_cannot_change_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let machine = community_machine(dir.path(), 100);
    machine.restart().unwrap();

    let mut c0 = community(COMMUNITY);
    c0.backnet.local.port_map = PortMap::from([("swarm", 4000), ("api", 4001), ("gateway", 4002)]);
    machine
        .apply(&envelope(
            InitCommunity { community: c0.clone() }.into(),
            1,
        ))
        .unwrap();

    let update = UpdateBacknet {
        community_id: c0.id.clone(),
        old_backnet: c0.backnet.clone(),
        new_backnet: Backnet::new(BacknetType::Dat),
    };
    let result = machine.apply(&envelope(update.into(), 2));
    assert!(matches!(
        result,
        Err(StateMachineError::Reduce(ReduceError::BacknetTypeMismatch { .. }))
    ));

    assert_eq!(machine.state().community(), Some(&c0));
    assert_eq!(machine.sequence_number(), SequenceNumber::new(1));
}

#[test]
fn transitions_of_other_categories_are_rejected_test() {
    let dir = tempfile::tempdir().unwrap();
    let machine = community_machine(dir.path(), 100);

    // 1. Nothing is applied before a restart.
    assert!(matches!(
        machine.apply(&envelope(init(COMMUNITY), 1)),
        Err(StateMachineError::NotReady {
            status: MachineStatus::Uninitialized
        })
    ));

    // 2. Host transitions never reach a community log.
    machine.restart().unwrap();
    let add = AddCommunity {
        community: community(COMMUNITY),
    };
    assert!(matches!(
        machine.apply(&envelope(add.into(), 1)),
        Err(StateMachineError::CategoryMismatch {
            expected: SubscriptionCategory::Community,
            found: SubscriptionCategory::Host,
        })
    ));
    assert_eq!(machine.sequence_number(), SequenceNumber::init());
}

#[test]
fn torn_tail_is_truncated_on_restart_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    {
        let machine = community_machine(dir.path(), 100);
        machine.restart().unwrap();
        machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
    }

    // 1. Leave half a line at the end of the log.
    let wal_path = dir.path().join("wal");
    let line = encode_line(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();
    let mut bytes = fs::read(&wal_path).unwrap();
    bytes.extend_from_slice(&line.as_bytes()[..10]);
    fs::write(&wal_path, bytes).unwrap();

    // 2. Restart drops it, and the next append follows the last intact line.
    let machine = community_machine(dir.path(), 100);
    assert_eq!(machine.restart().unwrap(), SequenceNumber::new(1));
    machine.apply(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();

    let machine = community_machine(dir.path(), 100);
    assert_eq!(machine.restart().unwrap(), SequenceNumber::new(2));
    assert_eq!(machine.state().community().unwrap().member_count(), 1);
}

#[test]
fn corrupted_log_halts_the_machine_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    {
        let machine = community_machine(dir.path(), 100);
        machine.restart().unwrap();
        machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
        machine.apply(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();
        machine.apply(&envelope(add_member(COMMUNITY, "u2"), 3)).unwrap();
    }

    // 1. Overwrite the middle line with garbage.
    let wal_path = dir.path().join("wal");
    let text = fs::read_to_string(&wal_path).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    lines[1] = "2 !!not-base64!!";
    fs::write(&wal_path, format!("{}\n", lines.join("\n"))).unwrap();

    // 2. Restart refuses to continue past it.
    let machine = community_machine(dir.path(), 100);
    let err = machine.restart().unwrap_err();
    assert!(matches!(err, StateMachineError::CorruptLog { line: 2, .. }));
    assert!(err.is_fatal());
    assert_eq!(machine.status(), MachineStatus::Uninitialized);
    assert!(matches!(
        machine.apply(&envelope(add_member(COMMUNITY, "u3"), 4)),
        Err(StateMachineError::NotReady { .. })
    ));
}

#[test]
fn apply_and_reject_publish_events_test() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, subscriber) = mpsc::channel();
    let machine: StateMachine<CommunityState> = StateMachine::open(
        COMMUNITY,
        dir.path(),
        registry(),
        StateMachineConfiguration { snapshot_interval: 100 },
        Some(publisher),
    )
    .unwrap();

    machine.restart().unwrap();
    machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
    let _ = machine.apply(&envelope(init(COMMUNITY), 2));

    let events: Vec<Event> = subscriber.try_iter().collect();
    assert!(matches!(&events[0], Event::Restart(restart) if restart.replayed == 0));
    assert!(matches!(
        &events[1],
        Event::ApplyTransition(apply)
            if apply.kind == TransitionKind::InitCommunity && apply.sequence_number == SequenceNumber::new(1)
    ));
    assert!(matches!(
        &events[2],
        Event::RejectTransition(reject) if reject.sequence_number == SequenceNumber::new(2)
    ));
    assert!(subscriber.recv_timeout(Duration::from_millis(10)).is_err());
}

#[test]
fn zero_snapshot_interval_is_refused_test() {
    let dir = tempfile::tempdir().unwrap();

    let result: Result<StateMachine<CommunityState>, _> = StateMachine::open(
        COMMUNITY,
        dir.path(),
        registry(),
        StateMachineConfiguration { snapshot_interval: 0 },
        None,
    );
    match result {
        Err(err @ StateMachineError::Config(_)) => assert!(!err.is_fatal()),
        Err(err) => panic!("expected a configuration error, got {:?}", err),
        Ok(_) => panic!("a machine that can never snapshot was opened"),
    }

    // The same directory still opens with a usable interval.
    let machine = community_machine(dir.path(), 1);
    machine.restart().unwrap();
    machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
    assert_eq!(snapshot_sequence_number(&machine), Some(SequenceNumber::new(1)));
}

#[test]
fn sequence_discontinuity_halts_restart_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();

    // 1. 3 transitions with a snapshot every 2 leave only #3 in the live log.
    {
        let machine = community_machine(dir.path(), 2);
        machine.restart().unwrap();
        machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
        machine.apply(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();
        machine.apply(&envelope(add_member(COMMUNITY, "u2"), 3)).unwrap();
        assert_eq!(wal_lines(&machine), 1);
    }

    // 2. Without the snapshot, the log no longer follows on from the empty state.
    log::debug!("Removing the snapshot at 2.");
    fs::remove_file(dir.path().join("snapshot")).unwrap();

    let machine = community_machine(dir.path(), 2);
    let err = machine.restart().unwrap_err();
    match &err {
        StateMachineError::SequenceDiscontinuity { expected, found } => {
            assert_eq!(*expected, SequenceNumber::new(1));
            assert_eq!(*found, SequenceNumber::new(3));
        }
        other => panic!("expected a sequence discontinuity, got {:?}", other),
    }
    assert!(err.is_fatal());
    assert_eq!(machine.status(), MachineStatus::Uninitialized);
}

#[test]
fn stale_entry_after_replayed_entries_halts_restart_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();

    // 1. Snapshot at 2, live log holding #3.
    {
        let machine = community_machine(dir.path(), 2);
        machine.restart().unwrap();
        machine.apply(&envelope(init(COMMUNITY), 1)).unwrap();
        machine.apply(&envelope(add_member(COMMUNITY, "u1"), 2)).unwrap();
        machine.apply(&envelope(add_member(COMMUNITY, "u2"), 3)).unwrap();
    }

    // 2. Append an entry at or below the snapshot after #3.
    let wal_path = dir.path().join("wal");
    let mut text = fs::read_to_string(&wal_path).unwrap();
    text.push_str(&encode_line(&envelope(add_member(COMMUNITY, "u3"), 1)).unwrap());
    fs::write(&wal_path, text).unwrap();

    // 3. Only a leading run of such entries is skipped, so restart stops at it.
    let machine = community_machine(dir.path(), 2);
    let err = machine.restart().unwrap_err();
    match &err {
        StateMachineError::SequenceDiscontinuity { expected, found } => {
            assert_eq!(*expected, SequenceNumber::new(4));
            assert_eq!(*found, SequenceNumber::new(1));
        }
        other => panic!("expected a sequence discontinuity, got {:?}", other),
    }
    assert_eq!(machine.status(), MachineStatus::Uninitialized);
}
