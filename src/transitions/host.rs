/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transitions scoped to the host log.

use serde::{Deserialize, Serialize};

use crate::types::community::{Community, Host};

use super::ReduceError;

/// Register a new community with the host. Host transitions are initiated by a user on the host node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddCommunity {
    pub community: Community,
}

impl AddCommunity {
    pub fn reduce(&self, old: &Host) -> Result<Host, ReduceError> {
        if old.communities.contains_key(&self.community.id) {
            return Err(ReduceError::DuplicateCommunity {
                community: self.community.id.clone(),
            });
        }

        let mut new = old.clone();
        new.communities
            .insert(self.community.id.clone(), self.community.clone());
        Ok(new)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.community.id.is_empty() {
            return Err("community.id must not be empty".to_string());
        }
        Ok(())
    }
}
