/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that a host node emits, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Handlers for these events can
//! be registered on a [`HostSpec`](crate::node::HostSpec), and default handlers that log each event are
//! defined in [`logging`](crate::logging).

use std::{path::PathBuf, sync::mpsc::Sender, time::SystemTime};

use crate::{
    supervisor::ports::PortBlock,
    transitions::{SubscriptionCategory, TransitionKind},
    types::basic::{CommunityID, ProcessID, SequenceNumber},
};

pub enum Event {
    // Events emitted by state machines.
    ApplyTransition(ApplyTransitionEvent),
    RejectTransition(RejectTransitionEvent),
    TakeSnapshot(TakeSnapshotEvent),
    ArchiveSnapshot(ArchiveSnapshotEvent),
    RotateLog(RotateLogEvent),
    Restart(RestartEvent),
    // Events emitted by the process supervisor.
    StartProcess(StartProcessEvent),
    StopProcess(StopProcessEvent),
    ProcessFailure(ProcessFailureEvent),
    ReconfigureBacknet(ReconfigureBacknetEvent),
}

impl Event {
    /// Send `event` to the event bus, if there is one. Events are dropped once the bus has shut down.
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(event);
        }
    }
}

/// A transition was durably logged and reduced into the state of `entity`.
pub struct ApplyTransitionEvent {
    pub timestamp: SystemTime,
    pub category: SubscriptionCategory,
    pub entity: String,
    pub kind: TransitionKind,
    pub sequence_number: SequenceNumber,
}

/// A reducer rejected a transition. Nothing was logged and the state is unchanged.
pub struct RejectTransitionEvent {
    pub timestamp: SystemTime,
    pub category: SubscriptionCategory,
    pub entity: String,
    pub kind: TransitionKind,
    pub sequence_number: SequenceNumber,
    pub reason: String,
}

pub struct TakeSnapshotEvent {
    pub timestamp: SystemTime,
    pub category: SubscriptionCategory,
    pub entity: String,
    pub sequence_number: SequenceNumber,
}

pub struct ArchiveSnapshotEvent {
    pub timestamp: SystemTime,
    pub category: SubscriptionCategory,
    pub entity: String,
    pub archive: PathBuf,
}

/// The live log was moved to `archive` after a snapshot made its entries redundant.
pub struct RotateLogEvent {
    pub timestamp: SystemTime,
    pub category: SubscriptionCategory,
    pub entity: String,
    pub archive: PathBuf,
}

/// A state machine finished reconstructing its state from disk.
pub struct RestartEvent {
    pub timestamp: SystemTime,
    pub category: SubscriptionCategory,
    pub entity: String,
    pub baseline: SequenceNumber,
    pub sequence_number: SequenceNumber,
    pub replayed: usize,
}

pub struct StartProcessEvent {
    pub timestamp: SystemTime,
    pub process: ProcessID,
    pub community: CommunityID,
    pub pid: u32,
    pub ports: PortBlock,
}

pub struct StopProcessEvent {
    pub timestamp: SystemTime,
    pub process: ProcessID,
    pub community: CommunityID,
}

/// A backnet process failed to start, or exited without being asked to.
pub struct ProcessFailureEvent {
    pub timestamp: SystemTime,
    pub process: Option<ProcessID>,
    pub community: CommunityID,
    pub error: String,
}

/// The on-disk configuration of a community's backnet was rewritten.
pub struct ReconfigureBacknetEvent {
    pub timestamp: SystemTime,
    pub community: CommunityID,
    pub ports: PortBlock,
}
