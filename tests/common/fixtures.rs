/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{path::Path, sync::Arc};

use habitat_rs::{
    config::{Configuration, StateMachineConfiguration},
    state_machine::{CommunityState, StateMachine},
    transitions::{
        envelope::TransitionEnvelope, registry::TransitionRegistry, AddMember, InitCommunity,
        Transition,
    },
    types::{
        basic::{CommunityID, SequenceNumber, UserID},
        community::{BacknetType, Community, User},
    },
};

pub(crate) const COMMUNITY: &str = "c0";

pub(crate) fn community(id: &str) -> Community {
    Community::new(CommunityID::new(id), "My Community", BacknetType::Ipfs)
}

pub(crate) fn user(id: &str) -> User {
    User::new(UserID::new(id), format!("{}-handle", id))
}

pub(crate) fn registry() -> Arc<TransitionRegistry> {
    Arc::new(TransitionRegistry::standard())
}

pub(crate) fn init(id: &str) -> Transition {
    InitCommunity {
        community: community(id),
    }
    .into()
}

pub(crate) fn add_member(community: &str, user_id: &str) -> Transition {
    AddMember {
        community_id: CommunityID::new(community),
        user: user(user_id),
    }
    .into()
}

pub(crate) fn envelope(transition: Transition, sequence_number: u64) -> TransitionEnvelope {
    TransitionEnvelope::new(transition, SequenceNumber::new(sequence_number))
}

/// Open (but do not restart) a community state machine stored in `dir`.
pub(crate) fn community_machine(dir: &Path, snapshot_interval: u64) -> StateMachine<CommunityState> {
    StateMachine::open(
        COMMUNITY,
        dir,
        registry(),
        StateMachineConfiguration { snapshot_interval },
        None,
    )
    .unwrap()
}

/// A host configuration rooted at `root`, with backnets disabled.
pub(crate) fn configuration(root: &Path) -> Configuration {
    Configuration::builder()
        .state_dir(root.join("state"))
        .backnet_data_dir(root.join("ipfs"))
        .backnet_config_dir(root.join("config"))
        .launch_backnets(false)
        .build()
}
