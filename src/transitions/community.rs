/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transitions scoped to a single community's log.
//!
//! Each of these is reduced over `Option<&Community>`: `None` means the community's log has not seen its
//! `INIT_COMMUNITY` yet.

use serde::{Deserialize, Serialize};

use crate::types::{
    basic::CommunityID,
    community::{Backnet, Community, User},
};

use super::ReduceError;

/// The first transition in a community's log. Sets the community's initial state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitCommunity {
    pub community: Community,
}

impl InitCommunity {
    pub fn reduce(&self, old: Option<&Community>) -> Result<Community, ReduceError> {
        // A present old community means something upstream sequenced this transition twice.
        if let Some(old) = old {
            return Err(ReduceError::AlreadyInitialized {
                community: old.id.clone(),
            });
        }

        Ok(self.community.clone())
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.community.id.is_empty() {
            return Err("community.id must not be empty".to_string());
        }
        Ok(())
    }
}

/// Add a user to a community's member set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMember {
    pub community_id: CommunityID,
    pub user: User,
}

impl AddMember {
    pub fn reduce(&self, old: Option<&Community>) -> Result<Community, ReduceError> {
        let old = existing(old, &self.community_id)?;
        add_member(old, &self.user)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        validate_membership(&self.community_id, &self.user)
    }
}

/// How [`ModifyCommunityMembers`] modifies the member set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyType {
    #[serde(rename = "ADD_MEMBER")]
    AddMember,
    #[serde(rename = "REMOVE_MEMBER")]
    RemoveMember,
    #[serde(rename = "BAN_MEMBER")]
    BanMember,
}

/// Add, remove, or ban a member.
///
/// Banning is deliberately unimplemented: reducing a `BAN_MEMBER` always fails with
/// [`ReduceError::NotImplemented`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyCommunityMembers {
    pub community_id: CommunityID,
    pub user: User,
    #[serde(rename = "type")]
    pub modification: ModifyType,
}

impl ModifyCommunityMembers {
    pub fn reduce(&self, old: Option<&Community>) -> Result<Community, ReduceError> {
        let old = existing(old, &self.community_id)?;
        match self.modification {
            ModifyType::AddMember => add_member(old, &self.user),
            ModifyType::RemoveMember => {
                if !old.has_member(&self.user.id) {
                    return Err(ReduceError::MemberNotFound {
                        community: old.id.clone(),
                        user: self.user.id.clone(),
                    });
                }
                let mut new = old.clone();
                new.members.remove(&self.user.id);
                Ok(new)
            }
            ModifyType::BanMember => Err(ReduceError::NotImplemented {
                action: "banning members from communities",
            }),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        validate_membership(&self.community_id, &self.user)
    }
}

/// Replace the parameters of a community's backnet.
///
/// The backnet type can never change through this transition: both `old_backnet` and the community's
/// current backnet must have the same type as `new_backnet`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBacknet {
    pub community_id: CommunityID,
    pub old_backnet: Backnet,
    pub new_backnet: Backnet,
}

impl UpdateBacknet {
    pub fn reduce(&self, old: Option<&Community>) -> Result<Community, ReduceError> {
        let old = existing(old, &self.community_id)?;

        for existing in [&old.backnet, &self.old_backnet] {
            if existing.backnet_type != self.new_backnet.backnet_type {
                return Err(ReduceError::BacknetTypeMismatch {
                    existing: existing.backnet_type,
                    requested: self.new_backnet.backnet_type,
                });
            }
        }

        let mut new = old.clone();
        new.backnet = self.new_backnet.clone();
        Ok(new)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.community_id.is_empty() {
            return Err("community_id must not be empty".to_string());
        }
        Ok(())
    }
}

/// Get the existing community, checking that it is the one `community_id` names.
fn existing<'a>(
    old: Option<&'a Community>,
    community_id: &CommunityID,
) -> Result<&'a Community, ReduceError> {
    let old = old.ok_or_else(|| ReduceError::CommunityNotInitialized {
        community: community_id.clone(),
    })?;
    if &old.id != community_id {
        return Err(ReduceError::CommunityMismatch {
            expected: old.id.clone(),
            found: community_id.clone(),
        });
    }
    Ok(old)
}

fn add_member(old: &Community, user: &User) -> Result<Community, ReduceError> {
    if old.has_member(&user.id) {
        return Err(ReduceError::DuplicateMember {
            community: old.id.clone(),
            user: user.id.clone(),
        });
    }
    let mut new = old.clone();
    new.members.insert(user.id.clone(), user.clone());
    Ok(new)
}

fn validate_membership(community_id: &CommunityID, user: &User) -> Result<(), String> {
    if community_id.is_empty() {
        return Err("community_id must not be empty".to_string());
    }
    if user.id.is_empty() {
        return Err("user.id must not be empty".to_string());
    }
    Ok(())
}
