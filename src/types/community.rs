/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The domain entities that transitions are reduced over.
//!
//! All of these are plain data. Every field that is not essential to identify an entity is
//! `#[serde(default)]`, so that a minimal JSON body such as `{"id": "c0", "name": "My Community"}` decodes
//! into a valid [`Community`].

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use serde::{Deserialize, Serialize};

use super::basic::{AppID, CommunityID, UserID};

/// A collection of users, associated with a backnet and a collection of apps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub id: CommunityID,
    pub name: String,
    /// Keyed by user id, so a user can be a member at most once.
    #[serde(default)]
    pub members: BTreeMap<UserID, User>,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub backnet: Backnet,
    #[serde(default)]
    pub apps: Vec<AppID>,
    #[serde(default)]
    pub consensus_algorithm: Option<ConsensusAlgorithmConfig>,
}

impl Community {
    /// Create a community with no members, peers or apps, backed by a fresh backnet of `backnet_type`.
    pub fn new(id: CommunityID, name: impl Into<String>, backnet_type: BacknetType) -> Community {
        Community {
            id,
            name: name.into(),
            members: BTreeMap::new(),
            peers: Vec::new(),
            backnet: Backnet::new(backnet_type),
            apps: Vec::new(),
            consensus_algorithm: None,
        }
    }

    pub fn has_member(&self, user: &UserID) -> bool {
        self.members.contains_key(user)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// A person's account, which can belong to many communities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserID,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub communities: Vec<CommunityID>,
}

impl User {
    pub fn new(id: UserID, handle: impl Into<String>) -> User {
        User {
            id,
            handle: handle.into(),
            communities: Vec::new(),
        }
    }
}

/// A node in a community's peer-to-peer network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub key: String,
    pub address: String,
}

/// The kinds of "backing network" a community can store its files in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BacknetType {
    Local,
    #[default]
    Ipfs,
    Dat,
}

impl Display for BacknetType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BacknetType::Local => f.write_str("local"),
            BacknetType::Ipfs => f.write_str("ipfs"),
            BacknetType::Dat => f.write_str("dat"),
        }
    }
}

/// A community's "backing network", which stores its files (usually in a p2p filesystem).
///
/// The `backnet_type` of a community is fixed once set. Only the parameters (bootstrap peers and local
/// configuration) may change afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Backnet {
    #[serde(rename = "type")]
    pub backnet_type: BacknetType,
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(default, rename = "local_backnet_config")]
    pub local: LocalBacknetConfig,
}

impl Backnet {
    pub fn new(backnet_type: BacknetType) -> Backnet {
        Backnet {
            backnet_type,
            bootstrap: Vec::new(),
            local: LocalBacknetConfig::default(),
        }
    }
}

/// Configuration of a backnet that is not shared with peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LocalBacknetConfig {
    #[serde(default)]
    pub port_map: PortMap,
}

/// Named local ports used by a backnet, e.g. `swarm`, `api`, `gateway` for IPFS.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PortMap(BTreeMap<String, u16>);

impl PortMap {
    pub const SWARM: &'static str = "swarm";
    pub const API: &'static str = "api";
    pub const GATEWAY: &'static str = "gateway";

    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<u16> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, port: u16) {
        self.0.insert(name.into(), port);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u16)> {
        self.0.iter()
    }
}

impl<const N: usize> From<[(&str, u16); N]> for PortMap {
    fn from(ports: [(&str, u16); N]) -> Self {
        Self(ports.into_iter().map(|(name, port)| (name.to_string(), port)).collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusAlgorithmType {
    Raft,
}

/// Which consensus algorithm a community would replicate its log with. Only recorded; single-node
/// sequencing is used regardless.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusAlgorithmConfig {
    #[serde(rename = "type")]
    pub algorithm: ConsensusAlgorithmType,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// The top-level state of a physical node: the communities it helps host and the accounts allowed to
/// configure it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Host {
    #[serde(default)]
    pub communities: BTreeMap<CommunityID, Community>,
    #[serde(default)]
    pub users: BTreeMap<String, HostUser>,
}

impl Host {
    pub fn new() -> Host {
        Host::default()
    }

    pub fn community(&self, id: &CommunityID) -> Option<&Community> {
        self.communities.get(id)
    }
}

/// An account that is allowed to configure the physical node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUser {
    pub username: String,
}
