/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

#![cfg(unix)]

use std::{
    path::Path,
    sync::mpsc::{self, Receiver},
    thread,
    time::{Duration, Instant},
};

use habitat_rs::{
    config::SupervisorConfiguration,
    events::Event,
    subscriber::{ReceiveError, TransitionSubscriber},
    supervisor::{
        backnet::IPFS_CONFIG_FILE, ipfs_config::IpfsConfig, ports::PortBlock, ProcessSupervisor,
        SupervisorError,
    },
    transitions::{AddCommunity, UpdateBacknet},
    types::{
        basic::CommunityID,
        community::{Backnet, BacknetType, PortMap},
    },
};
use habitat_rs::logging::setup_logger;
use log::LevelFilter;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

mod common;

use crate::common::{
    fake_ipfs,
    fixtures::{add_member, community, envelope, COMMUNITY},
};

fn supervisor_config(root: &Path, ipfs_binary: &Path, start_port: u16) -> SupervisorConfiguration {
    SupervisorConfiguration {
        backnet_data_dir: root.join("ipfs"),
        backnet_config_dir: root.join("config"),
        start_port,
        ports_per_backnet: 3,
        ipfs_binary: ipfs_binary.to_path_buf(),
        startup_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(2),
        failure_channel_capacity: 8,
    }
}

/// Receive events until one matches `predicate`, failing the test after 10 seconds.
fn wait_for(events: &Receiver<Event>, predicate: impl Fn(&Event) -> bool) -> Event {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if predicate(&event) => return event,
            Ok(_) => (),
            Err(_) => panic!("timed out waiting for an event"),
        }
    }
}

#[test]
fn start_reconfigure_and_stop_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let ipfs = fake_ipfs::install(dir.path());
    let (publisher, events) = mpsc::channel();
    let supervisor =
        ProcessSupervisor::start(supervisor_config(dir.path(), &ipfs, 4100), Some(publisher));
    let c0 = community(COMMUNITY);

    // 1. Start the backnet of c0.
    log::debug!("Starting the backnet of c0.");
    let first = supervisor.start_backnet(&c0).unwrap();
    assert_eq!(supervisor.process_for(&c0.id), Some(first));
    let ports = PortBlock {
        swarm: 4100,
        api: 4101,
        gateway: 4102,
    };
    assert_eq!(supervisor.ports_for(&c0.id), Some(ports));
    let info = supervisor.process(first).unwrap();
    assert_eq!(info.community, c0.id);
    assert_eq!(info.backnet_type, BacknetType::Ipfs);

    wait_for(&events, |event| matches!(event, Event::ReconfigureBacknet(e) if e.ports == ports));
    wait_for(&events, |event| matches!(event, Event::StartProcess(e) if e.process == first));

    // 1.1. The generated configuration listens on the allocated ports, and was used to initialize the node.
    let config_path = dir.path().join("config").join(COMMUNITY).join(IPFS_CONFIG_FILE);
    let config = IpfsConfig::from_file(&config_path).unwrap();
    assert!(config.identity.peer_id.starts_with("Qm"));
    assert!(config.addresses.swarm.contains(&"/ip4/0.0.0.0/tcp/4100".to_string()));
    assert_eq!(config.addresses.api, vec!["/ip4/0.0.0.0/tcp/4101".to_string()]);
    assert!(dir.path().join("ipfs").join(COMMUNITY).join("config").is_file());

    // 1.2. A running backnet is not started twice.
    assert!(matches!(
        supervisor.start_backnet(&c0),
        Err(SupervisorError::AlreadyRunning { process, .. }) if process == first
    ));

    // 2. Move the backnet to other ports.
    log::debug!("Reconfiguring the backnet of c0.");
    let mut new_backnet = c0.backnet.clone();
    new_backnet.local.port_map = PortMap::from([("swarm", 4200), ("api", 4201), ("gateway", 4202)]);
    new_backnet.bootstrap = vec!["/ip4/10.0.0.1/tcp/4001/p2p/QmBootstrap".to_string()];
    let update = UpdateBacknet {
        community_id: c0.id.clone(),
        old_backnet: c0.backnet.clone(),
        new_backnet,
    };
    let second = supervisor.reconfigure_backnet(&update).unwrap();
    assert_ne!(first, second);
    assert!(supervisor.process(first).is_none());
    assert_eq!(supervisor.ports_for(&c0.id).unwrap().api, 4201);
    wait_for(&events, |event| matches!(event, Event::StopProcess(e) if e.process == first));

    // 2.1. The node kept its identity.
    let reconfigured = IpfsConfig::from_file(&config_path).unwrap();
    assert_eq!(reconfigured.identity.peer_id, config.identity.peer_id);
    assert!(reconfigured.identity.priv_key.is_empty());
    assert_eq!(reconfigured.bootstrap.len(), 1);

    // 3. Changing the backnet's type is refused, and leaves the running backnet alone.
    let migrate = UpdateBacknet {
        community_id: c0.id.clone(),
        old_backnet: update.new_backnet.clone(),
        new_backnet: Backnet::new(BacknetType::Dat),
    };
    assert!(matches!(
        supervisor.reconfigure_backnet(&migrate),
        Err(SupervisorError::UnsupportedBacknetMigration { .. })
    ));
    assert_eq!(supervisor.process_for(&c0.id), Some(second));

    // 4. Stop it.
    supervisor.stop_backnet(&c0.id).unwrap();
    assert_eq!(supervisor.process_for(&c0.id), None);
    assert!(supervisor.processes().is_empty());
    assert!(matches!(
        supervisor.stop_backnet(&c0.id),
        Err(SupervisorError::NotRunning { .. })
    ));
    assert!(matches!(
        supervisor.stop_backnet(&CommunityID::new("c9")),
        Err(SupervisorError::UnknownCommunity { .. })
    ));
}

#[test]
fn failures_are_isolated_per_community_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let ipfs = fake_ipfs::install(dir.path());
    let (publisher, events) = mpsc::channel();
    let supervisor =
        ProcessSupervisor::start(supervisor_config(dir.path(), &ipfs, 4300), Some(publisher));
    let c0 = community("c0");
    let c1 = community("c1");

    // 1. Start 2 backnets through the subscriber interface.
    for c in [&c0, &c1] {
        let add = AddCommunity {
            community: c.clone(),
        };
        supervisor.receive(&envelope(add.into(), 1)).unwrap();
    }
    assert_eq!(supervisor.processes().len(), 2);

    // 2. Kill the backnet of c0 from outside.
    log::debug!("Killing the backnet of c0.");
    let process = supervisor.process_for(&c0.id).unwrap();
    let pid = supervisor.process(process).unwrap().pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    // 3. The failure is reported, c0's process is retired, and c1's keeps running.
    wait_for(&events, |event| {
        matches!(event, Event::ProcessFailure(e) if e.process == Some(process) && e.community == c0.id)
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.process_for(&c0.id).is_some() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(50));
    }
    assert!(supervisor.process_for(&c1.id).is_some());

    // 4. Transitions the supervisor does not react to are refused.
    assert!(matches!(
        supervisor.receive(&envelope(add_member("c1", "u1"), 2)),
        Err(ReceiveError::Supervisor(SupervisorError::UnsupportedTransitionKind { .. }))
    ));
}

#[test]
fn startup_failure_is_reported_not_returned_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let ipfs = fake_ipfs::install_failing(dir.path());
    let (publisher, events) = mpsc::channel();
    let supervisor =
        ProcessSupervisor::start(supervisor_config(dir.path(), &ipfs, 4400), Some(publisher));

    let add = AddCommunity {
        community: community(COMMUNITY),
    };
    supervisor.receive(&envelope(add.into(), 1)).unwrap();

    wait_for(&events, |event| {
        matches!(event, Event::ProcessFailure(e) if e.community.as_str() == COMMUNITY)
    });
    assert_eq!(supervisor.process_for(&CommunityID::new(COMMUNITY)), None);
    // Its ports stay allocated for a later attempt.
    assert!(supervisor.ports_for(&CommunityID::new(COMMUNITY)).is_some());
}

#[test]
fn nothing_starts_after_shutdown_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let ipfs = fake_ipfs::install(dir.path());
    let (publisher, events) = mpsc::channel();
    let supervisor =
        ProcessSupervisor::start(supervisor_config(dir.path(), &ipfs, 4500), Some(publisher));
    let c0 = community(COMMUNITY);

    supervisor.shutdown();

    // 1. Starting a backnet is refused before anything is configured or spawned.
    assert!(matches!(
        supervisor.start_backnet(&c0),
        Err(SupervisorError::ShutDown)
    ));
    assert!(!dir.path().join("ipfs").join(COMMUNITY).exists());
    assert_eq!(supervisor.ports_for(&c0.id), None);
    assert!(supervisor.processes().is_empty());

    // 2. No process was ever started.
    drop(supervisor);
    assert!(!events
        .try_iter()
        .any(|event| matches!(event, Event::StartProcess(_) | Event::ReconfigureBacknet(_))));
}

#[test]
fn overlapping_ports_are_refused_test() {
    setup_logger(LevelFilter::Debug);
    let dir = tempfile::tempdir().unwrap();
    let ipfs = fake_ipfs::install(dir.path());
    let supervisor = ProcessSupervisor::start(supervisor_config(dir.path(), &ipfs, 4600), None);
    let c0 = community("c0");
    let c1 = community("c1");

    // 1. c0 gets 4600-4602 and c1 gets 4603-4605.
    supervisor.start_backnet(&c0).unwrap();
    let c1_process = supervisor.start_backnet(&c1).unwrap();
    assert_eq!(supervisor.ports_for(&c1.id).unwrap().swarm, 4603);

    // 2. c1 cannot move onto a port of c0, and keeps running as it was.
    log::debug!("Moving the backnet of c1 onto the API port of c0.");
    let mut taken = c1.backnet.clone();
    taken.local.port_map = PortMap::from([("swarm", 4700), ("api", 4601), ("gateway", 4702)]);
    let update = UpdateBacknet {
        community_id: c1.id.clone(),
        old_backnet: c1.backnet.clone(),
        new_backnet: taken,
    };
    match supervisor.reconfigure_backnet(&update) {
        Err(SupervisorError::PortConflict { holder, held, .. }) => {
            assert_eq!(holder, c0.id);
            assert_eq!(held.api, 4601);
        }
        other => panic!("expected a port conflict, got {:?}", other),
    }
    assert_eq!(supervisor.process_for(&c1.id), Some(c1_process));
    assert_eq!(supervisor.ports_for(&c1.id).unwrap().swarm, 4603);

    // 3. Free ports are accepted, and are never handed out to a later backnet.
    let mut free = c1.backnet.clone();
    free.local.port_map = PortMap::from([("swarm", 4610), ("api", 4611), ("gateway", 4612)]);
    let update = UpdateBacknet {
        community_id: c1.id.clone(),
        old_backnet: c1.backnet.clone(),
        new_backnet: free,
    };
    supervisor.reconfigure_backnet(&update).unwrap();
    assert_eq!(supervisor.ports_for(&c1.id).unwrap().api, 4611);

    let c2 = community("c2");
    supervisor.start_backnet(&c2).unwrap();
    assert_eq!(supervisor.ports_for(&c2.id).unwrap().swarm, 4613);
}
