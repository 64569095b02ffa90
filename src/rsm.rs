/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replicated-state-machine seam.
//!
//! A host sequences transitions with [`propose`](ReplicatedStateMachine::propose) and commits
//! already-sequenced ones with [`apply`](ReplicatedStateMachine::apply). [`HostNode`](crate::node::HostNode)
//! implements this trait with single-node sequencing: `propose` assigns the next sequence number of the
//! transition's log and applies it immediately. A consensus protocol would instead replicate the proposal
//! and call `apply` once it is decided.

use std::{
    fmt::{self, Display, Formatter},
    io,
};

use crate::{
    config::ConfigError,
    state_machine::StateMachineError,
    transitions::{envelope::TransitionEnvelope, Transition, TransitionKind},
    types::basic::CommunityID,
};

pub trait ReplicatedStateMachine: Send + Sync {
    /// Bring every state machine to its last committed state and start reacting to transitions.
    fn start(&self) -> Result<(), StartError>;

    /// Sequence `transition` and commit it. Returns the committed envelope.
    fn propose(&self, transition: Transition) -> Result<TransitionEnvelope, ProposeError>;

    /// Commit an already-sequenced envelope. Returns the envelope as committed to its log.
    fn apply(&self, envelope: &TransitionEnvelope) -> Result<TransitionEnvelope, ProposeError>;
}

#[derive(Debug)]
pub enum StartError {
    Config(ConfigError),
    Io(io::Error),
    /// A state machine the host cannot run without failed to restart.
    StateMachine {
        machine: String,
        source: StateMachineError,
    },
}

impl Display for StartError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Config(err) => write!(f, "invalid configuration: {}", err),
            StartError::Io(err) => write!(f, "failed to prepare the state directory: {}", err),
            StartError::StateMachine { machine, source } => {
                write!(f, "state machine {} failed to start: {}", machine, source)
            }
        }
    }
}

impl std::error::Error for StartError {}

impl From<ConfigError> for StartError {
    fn from(value: ConfigError) -> Self {
        StartError::Config(value)
    }
}

impl From<io::Error> for StartError {
    fn from(value: io::Error) -> Self {
        StartError::Io(value)
    }
}

#[derive(Debug)]
pub enum ProposeError {
    StateMachine(StateMachineError),
    /// A community-scoped transition names a community that has no log yet.
    UnknownCommunity { community: CommunityID },
    /// The id cannot name the directory the community's log would live in.
    InvalidCommunityId { community: CommunityID },
    UnregisteredKind { kind: TransitionKind },
}

impl ProposeError {
    /// Whether the log the transition was routed to must stop being served. See
    /// [`StateMachineError::is_fatal`].
    pub fn is_fatal(&self) -> bool {
        match self {
            ProposeError::StateMachine(err) => err.is_fatal(),
            _ => false,
        }
    }
}

impl Display for ProposeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProposeError::StateMachine(err) => Display::fmt(err, f),
            ProposeError::UnknownCommunity { community } => {
                write!(f, "community {} has no log", community)
            }
            ProposeError::InvalidCommunityId { community } => {
                write!(f, "{:?} is not a valid community id", community.as_str())
            }
            ProposeError::UnregisteredKind { kind } => {
                write!(f, "no category is registered for {} transitions", kind)
            }
        }
    }
}

impl std::error::Error for ProposeError {}

impl From<StateMachineError> for ProposeError {
    fn from(value: StateMachineError) -> Self {
        ProposeError::StateMachine(value)
    }
}
