/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a host node.
//!
//! A host node runs one [state machine](crate::state_machine) for the host, one for every community it
//! hosts, and a [process supervisor](crate::supervisor) for the communities' backnets. It sequences
//! transitions itself (single-node sequencing), implementing the
//! [`ReplicatedStateMachine`](crate::rsm::ReplicatedStateMachine) seam.
//!
//! ## Starting a host node
//!
//! ```ignore
//! let node =
//!     HostSpec::builder()
//!     .configuration(configuration)
//!     .on_apply_transition(apply_handler)
//!     .on_process_failure(failure_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.registry(...)`: the [transition registry](crate::transitions::registry) to route with. Defaults to
//!   [`TransitionRegistry::standard`].
//! - `.subscribers(...)`: extra [subscribers](crate::subscriber::TransitionSubscriber) to notify of every
//!   committed transition.
//! - `.on_apply_transition(...)`, `.on_reject_transition(...)`, `.on_take_snapshot(...)`,
//!   `.on_archive_snapshot(...)`, `.on_rotate_log(...)`, `.on_restart(...)`, `.on_start_process(...)`,
//!   `.on_stop_process(...)`, `.on_process_failure(...)`, `.on_reconfigure_backnet(...)`: handlers for the
//!   [events](crate::events) the node emits.
//!
//! ## Boot sequence
//!
//! [`HostSpec::start`]:
//! 1. Restarts the host state machine. Failing to do so fails the start.
//! 2. Restarts the state machine of every community found on disk or in the host's state. A community whose
//!    machine fails to restart is logged and left unserved; the rest of the host starts regardless.
//! 3. Starts the process supervisor (unless `launch_backnets` is off), then a backnet for every hosted
//!    community. Backnet failures are logged, never fatal.
//!
//! ## Committing transitions
//!
//! A committed transition is first applied to the state machine of its log, then dispatched to the
//! supervisor (for `ADD_COMMUNITY` and `UPDATE_BACKNET`) and to the extra subscribers. Reactors only see
//! transitions that their log accepted.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

use typed_builder::TypedBuilder;

use crate::{
    config::{Configuration, StateMachineConfiguration, SupervisorConfiguration},
    event_bus::*,
    events::*,
    rsm::{ProposeError, ReplicatedStateMachine, StartError},
    state_machine::{
        communities_dir, community_dir, host_dir, CommunityState, StateMachine, StateMachineError,
    },
    subscriber::{Dispatcher, TransitionSubscriber},
    supervisor::{ProcessSupervisor, SUPERVISED_KINDS},
    transitions::{
        envelope::TransitionEnvelope, registry::TransitionRegistry, AddCommunity, AddMember,
        InitCommunity, SubscriptionCategory, Transition, TransitionKind,
    },
    types::{
        basic::{CommunityID, SequenceNumber},
        community::{Community, Host, User},
    },
};

/// Stores everything required to start a [`HostNode`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [HostSpec]. On the builder call the following methods to construct a valid [HostSpec].

    Required:
    - `.configuration(...)`

    Optional:
    - `.registry(...)`
    - `.subscribers(...)`
    - `.on_apply_transition(...)`
    - `.on_reject_transition(...)`
    - `.on_take_snapshot(...)`
    - `.on_archive_snapshot(...)`
    - `.on_rotate_log(...)`
    - `.on_restart(...)`
    - `.on_start_process(...)`
    - `.on_stop_process(...)`
    - `.on_process_failure(...)`
    - `.on_reconfigure_backnet(...)`
"))]
pub struct HostSpec {
    // Required parameters
    #[builder(setter(doc = "Set the [configuration](Configuration) of the host. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default = Arc::new(TransitionRegistry::standard()),
    setter(doc = "Set the registry used to route and decode transitions. Optional."))]
    registry: Arc<TransitionRegistry>,
    #[builder(default,
    setter(doc = "Set extra subscribers, each with a name, to notify of every committed transition. Optional."))]
    subscribers: Vec<(String, Arc<dyn TransitionSubscriber>)>,
    #[builder(default, setter(transform = |handler: impl Fn(&ApplyTransitionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ApplyTransitionEvent>),
    doc = "Register a handler closure to be invoked after a transition is committed to a log. Optional."))]
    on_apply_transition: Option<HandlerPtr<ApplyTransitionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectTransitionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectTransitionEvent>),
    doc = "Register a handler closure to be invoked after a reducer rejects a transition. Optional."))]
    on_reject_transition: Option<HandlerPtr<RejectTransitionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TakeSnapshotEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TakeSnapshotEvent>),
    doc = "Register a handler closure to be invoked after a state machine takes a snapshot. Optional."))]
    on_take_snapshot: Option<HandlerPtr<TakeSnapshotEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ArchiveSnapshotEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ArchiveSnapshotEvent>),
    doc = "Register a handler closure to be invoked after a superseded snapshot is archived. Optional."))]
    on_archive_snapshot: Option<HandlerPtr<ArchiveSnapshotEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RotateLogEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RotateLogEvent>),
    doc = "Register a handler closure to be invoked after a log is rotated. Optional."))]
    on_rotate_log: Option<HandlerPtr<RotateLogEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RestartEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RestartEvent>),
    doc = "Register a handler closure to be invoked after a state machine restarts. Optional."))]
    on_restart: Option<HandlerPtr<RestartEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartProcessEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartProcessEvent>),
    doc = "Register a handler closure to be invoked after a backnet process reports that it is ready. Optional."))]
    on_start_process: Option<HandlerPtr<StartProcessEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StopProcessEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StopProcessEvent>),
    doc = "Register a handler closure to be invoked after a backnet process is stopped. Optional."))]
    on_stop_process: Option<HandlerPtr<StopProcessEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProcessFailureEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProcessFailureEvent>),
    doc = "Register a handler closure to be invoked after a backnet process fails. Optional."))]
    on_process_failure: Option<HandlerPtr<ProcessFailureEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReconfigureBacknetEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReconfigureBacknetEvent>),
    doc = "Register a handler closure to be invoked after a backnet's configuration is rewritten. Optional."))]
    on_reconfigure_backnet: Option<HandlerPtr<ReconfigureBacknetEvent>>,
}

impl HostSpec {
    /// Starts all threads and state machines of a host node, runs its boot sequence, and returns the handle
    /// to them in a [`HostNode`].
    pub fn start(self) -> Result<HostNode, StartError> {
        self.configuration.validate()?;
        let state_dir = self.configuration.state_dir.clone();
        let launch_backnets = self.configuration.launch_backnets;
        let log_events = self.configuration.log_events;
        fs::create_dir_all(&state_dir)?;
        let (state_machine_config, supervisor_config): (
            StateMachineConfiguration,
            SupervisorConfiguration,
        ) = self.configuration.into();

        let event_handlers = EventHandlers::new(
            log_events,
            UserHandlers {
                on_apply_transition: self.on_apply_transition,
                on_reject_transition: self.on_reject_transition,
                on_take_snapshot: self.on_take_snapshot,
                on_archive_snapshot: self.on_archive_snapshot,
                on_rotate_log: self.on_rotate_log,
                on_restart: self.on_restart,
                on_start_process: self.on_start_process,
                on_stop_process: self.on_stop_process,
                on_process_failure: self.on_process_failure,
                on_reconfigure_backnet: self.on_reconfigure_backnet,
            },
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (event_bus_shutdown, event_bus) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
                (Some(shutdown), Some(event_bus))
            }
            None => (None, None),
        };

        let host = StateMachine::<Host>::open(
            HOST_MACHINE,
            host_dir(&state_dir),
            self.registry.clone(),
            state_machine_config.clone(),
            event_publisher.clone(),
        )
        .map_err(|source| StartError::StateMachine {
            machine: HOST_MACHINE.to_string(),
            source,
        })?;

        let supervisor = if launch_backnets {
            Some(Arc::new(ProcessSupervisor::start(
                supervisor_config,
                event_publisher.clone(),
            )))
        } else {
            None
        };

        let mut reactors = Dispatcher::new();
        if let Some(supervisor) = &supervisor {
            reactors.subscribe_to("supervisor", &SUPERVISED_KINDS, supervisor.clone());
        }
        for (name, subscriber) in self.subscribers {
            reactors.subscribe(name, subscriber);
        }

        let node = HostNode {
            state_dir,
            registry: self.registry,
            state_machine_config,
            host: Arc::new(host),
            communities: RwLock::new(BTreeMap::new()),
            supervisor,
            reactors,
            sequencer: Mutex::new(()),
            event_publisher: Mutex::new(event_publisher),
            event_bus,
            event_bus_shutdown: Mutex::new(event_bus_shutdown),
        };
        node.start()?;
        Ok(node)
    }
}

const HOST_MACHINE: &str = "host";

/// A handle to the state machines, supervisor and background threads of a running host. When this value is
/// dropped, every backnet is stopped and all background threads are shut down.
pub struct HostNode {
    state_dir: PathBuf,
    registry: Arc<TransitionRegistry>,
    state_machine_config: StateMachineConfiguration,
    host: Arc<StateMachine<Host>>,
    communities: RwLock<BTreeMap<CommunityID, Arc<StateMachine<CommunityState>>>>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    reactors: Dispatcher,
    // Held while a sequence number is assigned and committed.
    sequencer: Mutex<()>,
    event_publisher: Mutex<Option<Sender<Event>>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Mutex<Option<Sender<()>>>,
}

/// The state machine a transition is routed to.
enum Route {
    Host(Arc<StateMachine<Host>>),
    Community(Arc<StateMachine<CommunityState>>),
}

impl Route {
    fn sequence_number(&self) -> SequenceNumber {
        match self {
            Route::Host(machine) => machine.sequence_number(),
            Route::Community(machine) => machine.sequence_number(),
        }
    }

    fn apply(&self, envelope: &TransitionEnvelope) -> Result<TransitionEnvelope, StateMachineError> {
        match self {
            Route::Host(machine) => machine.apply(envelope),
            Route::Community(machine) => machine.apply(envelope),
        }
    }
}

impl HostNode {
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn registry(&self) -> &Arc<TransitionRegistry> {
        &self.registry
    }

    /// The host's current state.
    pub fn host(&self) -> Arc<Host> {
        self.host.state()
    }

    pub fn host_machine(&self) -> &Arc<StateMachine<Host>> {
        &self.host
    }

    /// The current state of `community`, if it has been initialized.
    pub fn community(&self, community: &CommunityID) -> Option<Community> {
        self.community_machine(community)
            .and_then(|machine| machine.state().community().cloned())
    }

    pub fn community_machine(
        &self,
        community: &CommunityID,
    ) -> Option<Arc<StateMachine<CommunityState>>> {
        self.communities.read().unwrap().get(community).cloned()
    }

    /// Ids of every community with a log on this host.
    pub fn community_ids(&self) -> Vec<CommunityID> {
        self.communities.read().unwrap().keys().cloned().collect()
    }

    /// The process supervisor, unless backnets are disabled.
    pub fn supervisor(&self) -> Option<&ProcessSupervisor> {
        self.supervisor.as_deref()
    }

    /// Register `community` with the host, then initialize its own log.
    pub fn create_community(
        &self,
        community: Community,
    ) -> Result<(TransitionEnvelope, TransitionEnvelope), ProposeError> {
        let added = self.propose(
            AddCommunity {
                community: community.clone(),
            }
            .into(),
        )?;
        let initialized = self.propose(InitCommunity { community }.into())?;
        Ok((added, initialized))
    }

    pub fn add_member(
        &self,
        community: CommunityID,
        user: User,
    ) -> Result<TransitionEnvelope, ProposeError> {
        self.propose(
            AddMember {
                community_id: community,
                user,
            }
            .into(),
        )
    }

    fn route(&self, transition: &Transition) -> Result<Route, ProposeError> {
        let kind = transition.kind();
        match self.registry.category(kind) {
            Some(SubscriptionCategory::Host) => Ok(Route::Host(self.host.clone())),
            Some(SubscriptionCategory::Community) => {
                let community = transition.community_id();
                if let Some(machine) = self.community_machine(community) {
                    return Ok(Route::Community(machine));
                }
                if kind != TransitionKind::InitCommunity {
                    return Err(ProposeError::UnknownCommunity {
                        community: community.clone(),
                    });
                }
                if !is_valid_dir_name(community.as_str()) {
                    return Err(ProposeError::InvalidCommunityId {
                        community: community.clone(),
                    });
                }

                let machine = self.open_community(community)?;
                machine.restart()?;
                Ok(Route::Community(machine))
            }
            Some(SubscriptionCategory::HostUser) | None => {
                Err(ProposeError::UnregisteredKind { kind })
            }
        }
    }

    /// Get the machine of `community`, opening (but not restarting) it if it is not open yet.
    fn open_community(
        &self,
        community: &CommunityID,
    ) -> Result<Arc<StateMachine<CommunityState>>, StateMachineError> {
        let mut communities = self.communities.write().unwrap();
        if let Some(machine) = communities.get(community) {
            return Ok(machine.clone());
        }

        let machine = Arc::new(StateMachine::open(
            community.as_str(),
            community_dir(&self.state_dir, community),
            self.registry.clone(),
            self.state_machine_config.clone(),
            self.event_publisher.lock().unwrap().clone(),
        )?);
        communities.insert(community.clone(), machine.clone());
        Ok(machine)
    }

    /// Ids of the communities with a directory under the state directory.
    fn communities_on_disk(&self) -> io::Result<Vec<CommunityID>> {
        let entries = match fs::read_dir(communities_dir(&self.state_dir)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut communities = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                communities.push(CommunityID::new(entry.file_name().to_string_lossy()));
            }
        }
        Ok(communities)
    }

    fn start_backnets(&self, supervisor: &ProcessSupervisor) {
        let host = self.host.state();
        for (id, registered) in &host.communities {
            if supervisor.process_for(id).is_some() {
                continue;
            }
            // The community's own log has the latest backnet parameters.
            let community = self.community(id).unwrap_or_else(|| registered.clone());
            if let Err(err) = supervisor.start_backnet_or_report(&community) {
                log::error!("failed to start the backnet of {}: {}", id, err);
            }
        }
    }

    fn dispatch(&self, committed: &TransitionEnvelope) {
        let report = self.reactors.dispatch(committed);
        if !report.is_ok() {
            log::debug!(
                "{} #{} for {} was committed, but {} of its reactors failed",
                committed.kind(),
                committed.sequence_number,
                committed.community_id(),
                report.failures.len()
            );
        }
    }
}

impl ReplicatedStateMachine for HostNode {
    fn start(&self) -> Result<(), StartError> {
        {
            let _sequencer = self.sequencer.lock().unwrap();

            // 1. The host.
            self.host
                .restart()
                .map_err(|source| StartError::StateMachine {
                    machine: HOST_MACHINE.to_string(),
                    source,
                })?;

            // 2. Every community the host knows of, or that has a log.
            let mut communities: BTreeSet<CommunityID> =
                self.host.state().communities.keys().cloned().collect();
            communities.extend(self.communities_on_disk()?);
            for community in communities {
                if !is_valid_dir_name(community.as_str()) {
                    log::error!("community id {:?} cannot name a log directory, skipping it", community.as_str());
                    continue;
                }
                let machine = self
                    .open_community(&community)
                    .map_err(|source| StartError::StateMachine {
                        machine: community.to_string(),
                        source,
                    })?;
                if let Err(err) = machine.restart() {
                    log::error!("community {} will not be served: {}", community, err);
                }
            }
        }

        // 3. Their backnets.
        if let Some(supervisor) = &self.supervisor {
            self.start_backnets(supervisor);
        }
        Ok(())
    }

    fn propose(&self, transition: Transition) -> Result<TransitionEnvelope, ProposeError> {
        let committed = {
            let _sequencer = self.sequencer.lock().unwrap();
            let route = self.route(&transition)?;
            let envelope = TransitionEnvelope::new(transition, route.sequence_number().next());
            route.apply(&envelope)?
        };
        self.dispatch(&committed);
        Ok(committed)
    }

    fn apply(&self, envelope: &TransitionEnvelope) -> Result<TransitionEnvelope, ProposeError> {
        let committed = {
            let _sequencer = self.sequencer.lock().unwrap();
            self.route(&envelope.transition)?.apply(envelope)?
        };
        self.dispatch(&committed);
        Ok(committed)
    }
}

impl Drop for HostNode {
    fn drop(&mut self) {
        // Backnets first: the supervisor publishes events while it stops them.
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown();
        }

        if let Some(shutdown) = self.event_bus_shutdown.get_mut().unwrap().take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}

/// Whether `name` can be used as a single path component.
fn is_valid_dir_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
