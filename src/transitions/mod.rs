/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed, reducer-carrying descriptions of state changes.
//!
//! A [`Transition`] transitions an entity from one arrangement to another. Every variant carries a
//! reducer: a pure function from the old entity to either a new entity or a [`ReduceError`]. Reducers
//! never mutate their input; they copy, then modify the copy. Readers holding the old entity are
//! therefore never invalidated mid-reduction.
//!
//! ## Variants and scopes
//!
//! | Kind tag | Variant | Category | Reduced over |
//! |---|---|---|---|
//! | `INIT_COMMUNITY` | [`InitCommunity`] | `COMMUNITY` | `Option<Community>` |
//! | `ADD_MEMBER` | [`AddMember`] | `COMMUNITY` | `Option<Community>` |
//! | `MODIFY_COMMUNITY_MEMBERS` | [`ModifyCommunityMembers`] | `COMMUNITY` | `Option<Community>` |
//! | `UPDATE_BACKNET` | [`UpdateBacknet`] | `COMMUNITY` | `Option<Community>` |
//! | `ADD_COMMUNITY` | [`AddCommunity`] | `HOST` | `Host` |
//!
//! The category ("subscription category") decides which log a transition belongs in. The mapping from
//! kind to category, and from kind tag to decoder, lives in the [`registry`], which is built once and
//! handed to the components that need it.
//!
//! ## Wire form
//!
//! On the wire and in the log, a transition travels inside a [`TransitionEnvelope`](envelope::TransitionEnvelope)
//! that stores its kind tag separately from its typed body. See [`envelope`].

pub mod community;

pub mod envelope;

pub mod host;

pub mod registry;

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::types::{
    basic::{CommunityID, UserID},
    community::BacknetType,
};

pub use community::{AddMember, InitCommunity, ModifyCommunityMembers, ModifyType, UpdateBacknet};
pub use host::AddCommunity;

/// The closed set of state changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    InitCommunity(InitCommunity),
    AddCommunity(AddCommunity),
    AddMember(AddMember),
    ModifyCommunityMembers(ModifyCommunityMembers),
    UpdateBacknet(UpdateBacknet),
}

impl Transition {
    pub fn kind(&self) -> TransitionKind {
        match self {
            Transition::InitCommunity(_) => TransitionKind::InitCommunity,
            Transition::AddCommunity(_) => TransitionKind::AddCommunity,
            Transition::AddMember(_) => TransitionKind::AddMember,
            Transition::ModifyCommunityMembers(_) => TransitionKind::ModifyCommunityMembers,
            Transition::UpdateBacknet(_) => TransitionKind::UpdateBacknet,
        }
    }

    /// The entity-scoping key of this transition, used to route it to the right log. For host-scoped
    /// transitions this is the community that the transition is about.
    pub fn community_id(&self) -> &CommunityID {
        match self {
            Transition::InitCommunity(t) => &t.community.id,
            Transition::AddCommunity(t) => &t.community.id,
            Transition::AddMember(t) => &t.community_id,
            Transition::ModifyCommunityMembers(t) => &t.community_id,
            Transition::UpdateBacknet(t) => &t.community_id,
        }
    }

    /// Serialize the typed body of this transition, without its kind tag.
    pub fn body(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Transition::InitCommunity(t) => serde_json::to_value(t),
            Transition::AddCommunity(t) => serde_json::to_value(t),
            Transition::AddMember(t) => serde_json::to_value(t),
            Transition::ModifyCommunityMembers(t) => serde_json::to_value(t),
            Transition::UpdateBacknet(t) => serde_json::to_value(t),
        }
    }
}

impl From<InitCommunity> for Transition {
    fn from(value: InitCommunity) -> Self {
        Transition::InitCommunity(value)
    }
}

impl From<AddCommunity> for Transition {
    fn from(value: AddCommunity) -> Self {
        Transition::AddCommunity(value)
    }
}

impl From<AddMember> for Transition {
    fn from(value: AddMember) -> Self {
        Transition::AddMember(value)
    }
}

impl From<ModifyCommunityMembers> for Transition {
    fn from(value: ModifyCommunityMembers) -> Self {
        Transition::ModifyCommunityMembers(value)
    }
}

impl From<UpdateBacknet> for Transition {
    fn from(value: UpdateBacknet) -> Self {
        Transition::UpdateBacknet(value)
    }
}

/// Enumerates the kinds of [`Transition`]. The string form is the kind tag used on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransitionKind {
    InitCommunity,
    AddCommunity,
    AddMember,
    ModifyCommunityMembers,
    UpdateBacknet,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 5] = [
        TransitionKind::InitCommunity,
        TransitionKind::AddCommunity,
        TransitionKind::AddMember,
        TransitionKind::ModifyCommunityMembers,
        TransitionKind::UpdateBacknet,
    ];

    pub const fn tag(&self) -> &'static str {
        match self {
            TransitionKind::InitCommunity => "INIT_COMMUNITY",
            TransitionKind::AddCommunity => "ADD_COMMUNITY",
            TransitionKind::AddMember => "ADD_MEMBER",
            TransitionKind::ModifyCommunityMembers => "MODIFY_COMMUNITY_MEMBERS",
            TransitionKind::UpdateBacknet => "UPDATE_BACKNET",
        }
    }
}

impl Display for TransitionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The kinds of entities that a state machine, and therefore a log, can be scoped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionCategory {
    #[serde(rename = "COMMUNITY")]
    Community,
    #[serde(rename = "HOST")]
    Host,
    #[serde(rename = "HOST_USER")]
    HostUser,
}

impl Display for SubscriptionCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionCategory::Community => f.write_str("COMMUNITY"),
            SubscriptionCategory::Host => f.write_str("HOST"),
            SubscriptionCategory::HostUser => f.write_str("HOST_USER"),
        }
    }
}

/// Enumerates the business rules a reducer can reject a transition for.
///
/// These are ordinary, expected rejections. A state machine returns them to the caller without side
/// effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    /// `INIT_COMMUNITY` was applied to a log that already holds a community.
    AlreadyInitialized { community: CommunityID },

    /// A community-scoped transition other than `INIT_COMMUNITY` was applied before the community exists.
    CommunityNotInitialized { community: CommunityID },

    /// The scoping key of the transition names a different community than the one it is reduced over.
    CommunityMismatch {
        expected: CommunityID,
        found: CommunityID,
    },

    /// `ADD_COMMUNITY` for a community the host already has.
    DuplicateCommunity { community: CommunityID },

    DuplicateMember {
        community: CommunityID,
        user: UserID,
    },

    MemberNotFound {
        community: CommunityID,
        user: UserID,
    },

    /// The transition names an outcome that is deliberately unimplemented, e.g. banning a member.
    NotImplemented { action: &'static str },

    /// `UPDATE_BACKNET` tried to change the type of a backnet. Only its parameters may change.
    BacknetTypeMismatch {
        existing: BacknetType,
        requested: BacknetType,
    },

    /// The transition was routed to an entity it is not defined over.
    OutOfScope {
        kind: TransitionKind,
        category: SubscriptionCategory,
    },
}

impl Display for ReduceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReduceError::AlreadyInitialized { community } => {
                write!(f, "community {} is already initialized", community)
            }
            ReduceError::CommunityNotInitialized { community } => {
                write!(f, "community {} has not been initialized", community)
            }
            ReduceError::CommunityMismatch { expected, found } => write!(
                f,
                "transition is scoped to community {}, but was reduced over community {}",
                found, expected
            ),
            ReduceError::DuplicateCommunity { community } => {
                write!(f, "community with id {} is already in host", community)
            }
            ReduceError::DuplicateMember { community, user } => {
                write!(f, "community {} already has member {}", community, user)
            }
            ReduceError::MemberNotFound { community, user } => {
                write!(f, "community {} has no member {}", community, user)
            }
            ReduceError::NotImplemented { action } => write!(f, "{} is unimplemented", action),
            ReduceError::BacknetTypeMismatch {
                existing,
                requested,
            } => write!(
                f,
                "switching backnet implementations is not supported ({} -> {})",
                existing, requested
            ),
            ReduceError::OutOfScope { kind, category } => {
                write!(f, "{} transitions cannot be reduced over {} state", kind, category)
            }
        }
    }
}

impl std::error::Error for ReduceError {}
