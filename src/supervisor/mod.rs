/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Starts, stops, and reconfigures the backnet processes that back each community.
//!
//! The [`ProcessSupervisor`] exclusively owns the process table and the port allocator. Other components
//! only ever hold a [`ProcessID`] and look processes up through the supervisor.
//!
//! ## Reacting to transitions
//!
//! As a [`TransitionSubscriber`], the supervisor handles:
//! - `ADD_COMMUNITY`: start a backnet for the new community.
//! - `UPDATE_BACKNET`: stop the community's backnet, rewrite its configuration, and start it again. Changing
//!   the type of a backnet is rejected, and so are ports that overlap another community's block.
//!
//! Every other kind is rejected with [`SupervisorError::UnsupportedTransitionKind`].
//!
//! ## Failures
//!
//! Each process's supervising thread forwards terminal failures into one bounded channel. A single
//! aggregator thread logs each failure, retires the failed process from the table, and publishes a
//! [`ProcessFailureEvent`]. Failed processes are not restarted. A backnet that fails to start is reported
//! the same way, so that one community's backnet failing never stops the others from being served.
//!
//! Once [shut down](ProcessSupervisor::shutdown), the supervisor refuses to configure or launch anything.

pub mod backnet;

pub mod ipfs_config;

pub mod ports;

pub mod process;

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::SystemTime,
};

use crate::{
    config::SupervisorConfiguration,
    events::*,
    subscriber::{ReceiveError, TransitionSubscriber},
    transitions::{envelope::TransitionEnvelope, Transition, TransitionKind, UpdateBacknet},
    types::{
        basic::{CommunityID, ProcessID},
        community::{Backnet, BacknetType, Community},
    },
};

use self::{
    backnet::{BacknetDriver, BacknetError, IpfsDriver},
    ports::{PortAllocator, PortBlock, PortsExhausted},
    process::{Process, ProcessError, ProcessFailure, ProcessStartupError},
};

/// The transition kinds the supervisor reacts to.
pub const SUPERVISED_KINDS: [TransitionKind; 2] =
    [TransitionKind::AddCommunity, TransitionKind::UpdateBacknet];

pub struct ProcessSupervisor {
    config: SupervisorConfiguration,
    table: Arc<Mutex<ProcessTable>>,
    ports: Mutex<PortAllocator>,
    // Serializes start, stop and reconfigure, which block on the backnet without holding the table.
    lifecycle: Mutex<()>,
    failures: Mutex<Option<SyncSender<ProcessFailure>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    event_publisher: Mutex<Option<Sender<Event>>>,
}

#[derive(Default)]
struct ProcessTable {
    processes: HashMap<ProcessID, Process>,
    communities: HashMap<CommunityID, CommunityBacknet>,
    next_id: u64,
}

impl ProcessTable {
    fn allocate_id(&mut self) -> ProcessID {
        self.next_id += 1;
        ProcessID::new(self.next_id)
    }

    /// The live process of `community`, if any.
    fn process_for(&self, community: &CommunityID) -> Option<ProcessID> {
        self.communities
            .get(community)
            .and_then(|entry| entry.process)
            .filter(|id| self.processes.contains_key(id))
    }
}

/// What the supervisor knows about one community's backnet.
struct CommunityBacknet {
    driver: Box<dyn BacknetDriver>,
    backnet: Backnet,
    ports: PortBlock,
    process: Option<ProcessID>,
}

/// A snapshot of one registered process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ProcessID,
    pub community: CommunityID,
    pub backnet_type: BacknetType,
    pub pid: u32,
}

impl ProcessSupervisor {
    /// Create a supervisor and start its failure aggregator.
    pub fn start(
        config: SupervisorConfiguration,
        event_publisher: Option<Sender<Event>>,
    ) -> ProcessSupervisor {
        let table = Arc::new(Mutex::new(ProcessTable::default()));
        let (failures, failure_receiver) = mpsc::sync_channel(config.failure_channel_capacity.max(1));
        let aggregator = start_failure_aggregator(failure_receiver, table.clone(), event_publisher.clone());

        ProcessSupervisor {
            ports: Mutex::new(PortAllocator::new(config.start_port, config.ports_per_backnet)),
            config,
            table,
            lifecycle: Mutex::new(()),
            failures: Mutex::new(Some(failures)),
            aggregator: Mutex::new(Some(aggregator)),
            event_publisher: Mutex::new(event_publisher),
        }
    }

    /// Start a backnet for `community`: allocate its ports, write its configuration, launch it, and wait
    /// until it is ready.
    pub fn start_backnet(&self, community: &Community) -> Result<ProcessID, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        self.failure_sender()?;
        if let Some(process) = self.process_for(&community.id) {
            return Err(SupervisorError::AlreadyRunning {
                community: community.id.clone(),
                process,
            });
        }

        let existing = self.table.lock().unwrap().communities.remove(&community.id);
        let mut entry = match existing {
            Some(entry) => entry,
            None => CommunityBacknet {
                driver: self.driver_for(&community.id, community.backnet.backnet_type)?,
                backnet: community.backnet.clone(),
                ports: self.ports.lock().unwrap().allocate()?,
                process: None,
            },
        };

        let result = self.launch(&community.id, &mut entry);
        self.table
            .lock()
            .unwrap()
            .communities
            .insert(community.id.clone(), entry);
        result
    }

    /// Cooperatively stop the backnet of `community`. Its ports and configuration are kept for a later
    /// restart.
    pub fn stop_backnet(&self, community: &CommunityID) -> Result<(), SupervisorError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let process = {
            let mut table = self.table.lock().unwrap();
            let entry = table
                .communities
                .get_mut(community)
                .ok_or_else(|| SupervisorError::UnknownCommunity {
                    community: community.clone(),
                })?;
            let id = entry.process.take();
            id.and_then(|id| table.processes.remove(&id))
        };

        match process {
            Some(process) => {
                self.stop(process);
                Ok(())
            }
            None => Err(SupervisorError::NotRunning {
                community: community.clone(),
            }),
        }
    }

    /// Stop the backnet named by `update`, reconfigure it, and start it again.
    pub fn reconfigure_backnet(&self, update: &UpdateBacknet) -> Result<ProcessID, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let community = &update.community_id;
        let mut entry = self
            .table
            .lock()
            .unwrap()
            .communities
            .remove(community)
            .ok_or_else(|| SupervisorError::UnknownCommunity {
                community: community.clone(),
            })?;

        let result = self.relaunch(community, &mut entry, &update.new_backnet);
        self.table
            .lock()
            .unwrap()
            .communities
            .insert(community.clone(), entry);
        result
    }

    fn relaunch(
        &self,
        community: &CommunityID,
        entry: &mut CommunityBacknet,
        new_backnet: &Backnet,
    ) -> Result<ProcessID, SupervisorError> {
        if entry.backnet.backnet_type != new_backnet.backnet_type {
            return Err(SupervisorError::UnsupportedBacknetMigration {
                from: entry.backnet.backnet_type,
                to: new_backnet.backnet_type,
            });
        }

        let requested = PortBlock::from_port_map(&new_backnet.local.port_map);
        if let Some(ports) = requested {
            self.check_ports_free(community, ports)?;
        }

        let running = entry
            .process
            .take()
            .and_then(|id| self.table.lock().unwrap().processes.remove(&id));
        if let Some(process) = running {
            self.stop(process);
        }

        entry.backnet = new_backnet.clone();
        if let Some(ports) = requested {
            self.ports.lock().unwrap().reserve(ports);
            entry.ports = ports;
        }
        self.launch(community, entry)
    }

    /// Fail if `ports` shares a port with the block of a community other than `community`.
    fn check_ports_free(&self, community: &CommunityID, ports: PortBlock) -> Result<(), SupervisorError> {
        let table = self.table.lock().unwrap();
        let taken = table
            .communities
            .iter()
            .find(|(other, entry)| *other != community && entry.ports.overlaps(&ports));
        match taken {
            Some((other, entry)) => Err(SupervisorError::PortConflict {
                community: community.clone(),
                requested: ports,
                holder: other.clone(),
                held: entry.ports,
            }),
            None => Ok(()),
        }
    }

    fn launch(
        &self,
        community: &CommunityID,
        entry: &mut CommunityBacknet,
    ) -> Result<ProcessID, SupervisorError> {
        // Checked before anything is spawned: a daemon launched now would have no one to stop it.
        let failures = self.failure_sender()?;
        let id = self.table.lock().unwrap().allocate_id();

        entry
            .driver
            .configure(&entry.backnet, entry.ports)
            .map_err(|source| SupervisorError::Configure {
                community: community.clone(),
                source,
            })?;
        self.publish(Event::ReconfigureBacknet(ReconfigureBacknetEvent {
            timestamp: SystemTime::now(),
            community: community.clone(),
            ports: entry.ports,
        }));

        let child = entry
            .driver
            .launch()
            .map_err(|source| SupervisorError::Startup {
                community: community.clone(),
                process: id,
                source,
            })?;

        let process = Process::supervise(
            id,
            community.clone(),
            entry.driver.backnet_type(),
            child,
            self.config.shutdown_grace,
            failures,
        );

        log::info!(
            "started {} backnet for {} as {} (pid {}, ports {})",
            entry.driver.backnet_type(),
            community,
            id,
            process.pid(),
            entry.ports
        );
        self.publish(Event::StartProcess(StartProcessEvent {
            timestamp: SystemTime::now(),
            process: id,
            community: community.clone(),
            pid: process.pid(),
            ports: entry.ports,
        }));

        self.table.lock().unwrap().processes.insert(id, process);
        entry.process = Some(id);
        Ok(id)
    }

    fn stop(&self, process: Process) {
        let id = process.id();
        let community = process.community_id().clone();
        process.stop();
        log::info!("stopped backnet {} of {}", id, community);
        self.publish(Event::StopProcess(StopProcessEvent {
            timestamp: SystemTime::now(),
            process: id,
            community,
        }));
    }

    fn driver_for(
        &self,
        community: &CommunityID,
        backnet_type: BacknetType,
    ) -> Result<Box<dyn BacknetDriver>, SupervisorError> {
        match backnet_type {
            BacknetType::Ipfs => Ok(Box::new(IpfsDriver::new(
                community.clone(),
                self.config.ipfs_binary.clone(),
                &self.config.backnet_data_dir,
                &self.config.backnet_config_dir,
                self.config.startup_timeout,
            ))),
            backnet_type => Err(SupervisorError::UnsupportedBacknetType { backnet_type }),
        }
    }

    /// Like [`start_backnet`](Self::start_backnet), except that a backnet that fails to start is reported
    /// through the failure aggregator and `Ok(None)` is returned.
    pub fn start_backnet_or_report(&self, community: &Community) -> Result<Option<ProcessID>, SupervisorError> {
        self.reported(self.start_backnet(community))
    }

    // A backnet that could not start is a process failure, not an error of the caller.
    fn reported(
        &self,
        result: Result<ProcessID, SupervisorError>,
    ) -> Result<Option<ProcessID>, SupervisorError> {
        match result {
            Ok(process) => Ok(Some(process)),
            Err(SupervisorError::Startup {
                community,
                process,
                source,
            }) => {
                self.report(ProcessFailure {
                    process: Some(process),
                    community,
                    error: ProcessError::Startup(source),
                });
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn failure_sender(&self) -> Result<SyncSender<ProcessFailure>, SupervisorError> {
        self.failures
            .lock()
            .unwrap()
            .clone()
            .ok_or(SupervisorError::ShutDown)
    }

    /// Forward a failure to the aggregator. Falls back to logging it if the aggregator is gone or behind.
    fn report(&self, failure: ProcessFailure) {
        let failures = self.failures.lock().unwrap().clone();
        let failure = match failures {
            Some(failures) => match failures.try_send(failure) {
                Ok(()) => return,
                Err(TrySendError::Full(failure)) | Err(TrySendError::Disconnected(failure)) => failure,
            },
            None => failure,
        };
        log::error!(
            "backnet of {} failed and could not be reported: {}",
            failure.community,
            failure.error
        );
    }

    fn publish(&self, event: Event) {
        Event::publish(&self.event_publisher.lock().unwrap(), event)
    }

    pub fn process_for(&self, community: &CommunityID) -> Option<ProcessID> {
        self.table.lock().unwrap().process_for(community)
    }

    /// The ports allocated to the backnet of `community`, running or not.
    pub fn ports_for(&self, community: &CommunityID) -> Option<PortBlock> {
        self.table
            .lock()
            .unwrap()
            .communities
            .get(community)
            .map(|entry| entry.ports)
    }

    pub fn process(&self, id: ProcessID) -> Option<ProcessInfo> {
        self.table
            .lock()
            .unwrap()
            .processes
            .get(&id)
            .map(process_info)
    }

    /// Every registered process, ordered by id.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessInfo> = self
            .table
            .lock()
            .unwrap()
            .processes
            .values()
            .map(process_info)
            .collect();
        processes.sort_by_key(|info| info.id);
        processes
    }

    /// Stop every process and the failure aggregator. Called on drop; later calls do nothing.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let processes: Vec<Process> = {
            let mut table = self.table.lock().unwrap();
            table
                .communities
                .values_mut()
                .for_each(|entry| entry.process = None);
            table.processes.drain().map(|(_, process)| process).collect()
        };
        for process in processes {
            self.stop(process);
        }

        // The aggregator exits once every sender is gone: the supervising threads' went with their processes.
        self.failures.lock().unwrap().take();
        if let Some(aggregator) = self.aggregator.lock().unwrap().take() {
            let _ = aggregator.join();
        }
    }
}

fn process_info(process: &Process) -> ProcessInfo {
    ProcessInfo {
        id: process.id(),
        community: process.community_id().clone(),
        backnet_type: process.backnet_type(),
        pid: process.pid(),
    }
}

fn start_failure_aggregator(
    failures: Receiver<ProcessFailure>,
    table: Arc<Mutex<ProcessTable>>,
    event_publisher: Option<Sender<Event>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for failure in failures {
            match failure.process {
                Some(process) => log::error!(
                    "backnet {} of {} failed: {}",
                    process,
                    failure.community,
                    failure.error
                ),
                None => log::error!(
                    "backnet of {} failed: {}",
                    failure.community,
                    failure.error
                ),
            }

            if let Some(id) = failure.process {
                let mut table = table.lock().unwrap();
                table.processes.remove(&id);
                if let Some(entry) = table.communities.get_mut(&failure.community) {
                    if entry.process == Some(id) {
                        entry.process = None;
                    }
                }
            }

            Event::publish(
                &event_publisher,
                Event::ProcessFailure(ProcessFailureEvent {
                    timestamp: SystemTime::now(),
                    process: failure.process,
                    community: failure.community,
                    error: failure.error.to_string(),
                }),
            );
        }
    })
}

impl TransitionSubscriber for ProcessSupervisor {
    fn receive(&self, envelope: &TransitionEnvelope) -> Result<(), ReceiveError> {
        let result = match &envelope.transition {
            Transition::AddCommunity(t) => self.start_backnet_or_report(&t.community),
            Transition::UpdateBacknet(t) => self.reported(self.reconfigure_backnet(t)),
            other => Err(SupervisorError::UnsupportedTransitionKind { kind: other.kind() }),
        };
        result.map(|_| ()).map_err(ReceiveError::Supervisor)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown()
    }
}

#[derive(Debug)]
pub enum SupervisorError {
    UnsupportedTransitionKind { kind: TransitionKind },

    /// `UPDATE_BACKNET` tried to change the type of a running backnet.
    UnsupportedBacknetMigration { from: BacknetType, to: BacknetType },

    /// There is no driver for this type of backnet.
    UnsupportedBacknetType { backnet_type: BacknetType },

    UnknownCommunity { community: CommunityID },

    AlreadyRunning {
        community: CommunityID,
        process: ProcessID,
    },

    NotRunning { community: CommunityID },

    Ports(PortsExhausted),

    /// `UPDATE_BACKNET` asked for ports already allocated to another community's backnet.
    PortConflict {
        community: CommunityID,
        requested: PortBlock,
        holder: CommunityID,
        held: PortBlock,
    },

    Configure {
        community: CommunityID,
        source: BacknetError,
    },

    Startup {
        community: CommunityID,
        process: ProcessID,
        source: ProcessStartupError,
    },

    /// The supervisor was shut down.
    ShutDown,
}

impl Display for SupervisorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::UnsupportedTransitionKind { kind } => {
                write!(f, "the process supervisor does not handle {} transitions", kind)
            }
            SupervisorError::UnsupportedBacknetMigration { from, to } => write!(
                f,
                "migrating a backnet from {} to {} is not supported",
                from, to
            ),
            SupervisorError::UnsupportedBacknetType { backnet_type } => {
                write!(f, "{} backnets are not supported", backnet_type)
            }
            SupervisorError::UnknownCommunity { community } => {
                write!(f, "no backnet is registered for community {}", community)
            }
            SupervisorError::AlreadyRunning { community, process } => write!(
                f,
                "the backnet of community {} is already running as {}",
                community, process
            ),
            SupervisorError::NotRunning { community } => {
                write!(f, "the backnet of community {} is not running", community)
            }
            SupervisorError::Ports(err) => Display::fmt(err, f),
            SupervisorError::PortConflict {
                community,
                requested,
                holder,
                held,
            } => write!(
                f,
                "ports {} requested for community {} overlap ports {} of community {}",
                requested, community, held, holder
            ),
            SupervisorError::Configure { community, source } => write!(
                f,
                "failed to configure the backnet of community {}: {}",
                community, source
            ),
            SupervisorError::Startup {
                community, source, ..
            } => write!(
                f,
                "the backnet of community {} failed to start: {}",
                community, source
            ),
            SupervisorError::ShutDown => f.write_str("the process supervisor was shut down"),
        }
    }
}

impl std::error::Error for SupervisorError {}

impl From<PortsExhausted> for SupervisorError {
    fn from(value: PortsExhausted) -> Self {
        SupervisorError::Ports(value)
    }
}
