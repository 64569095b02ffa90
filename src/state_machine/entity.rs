/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The entities that a [`StateMachine`](super::StateMachine) can hold.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    transitions::{ReduceError, SubscriptionCategory, Transition},
    types::community::{Community, Host},
};

/// A value that transitions are reduced over, and that a state machine logs and snapshots.
///
/// `Default` is the state of a machine that has not applied any transition.
pub trait Entity: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The category of transitions this entity accepts. Routing a transition of any other category to a
    /// state machine holding this entity fails with a category mismatch.
    const CATEGORY: SubscriptionCategory;

    /// Reduce `transition` over `self`, returning the new entity. Must not modify `self`.
    fn reduce(&self, transition: &Transition) -> Result<Self, ReduceError>;
}

/// The state of one community: absent until its `INIT_COMMUNITY` is applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityState(Option<Community>);

impl CommunityState {
    pub fn community(&self) -> Option<&Community> {
        self.0.as_ref()
    }

    pub fn into_community(self) -> Option<Community> {
        self.0
    }
}

impl From<Community> for CommunityState {
    fn from(value: Community) -> Self {
        CommunityState(Some(value))
    }
}

impl Entity for CommunityState {
    const CATEGORY: SubscriptionCategory = SubscriptionCategory::Community;

    fn reduce(&self, transition: &Transition) -> Result<Self, ReduceError> {
        let old = self.0.as_ref();
        let new = match transition {
            Transition::InitCommunity(t) => t.reduce(old)?,
            Transition::AddMember(t) => t.reduce(old)?,
            Transition::ModifyCommunityMembers(t) => t.reduce(old)?,
            Transition::UpdateBacknet(t) => t.reduce(old)?,
            Transition::AddCommunity(_) => {
                return Err(ReduceError::OutOfScope {
                    kind: transition.kind(),
                    category: Self::CATEGORY,
                })
            }
        };
        Ok(CommunityState(Some(new)))
    }
}

impl Entity for Host {
    const CATEGORY: SubscriptionCategory = SubscriptionCategory::Host;

    fn reduce(&self, transition: &Transition) -> Result<Self, ReduceError> {
        match transition {
            Transition::AddCommunity(t) => t.reduce(self),
            _ => Err(ReduceError::OutOfScope {
                kind: transition.kind(),
                category: Self::CATEGORY,
            }),
        }
    }
}
