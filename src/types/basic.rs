/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" identifier types shared by every subsystem.
//!
//! These types follow the newtype pattern. They are sent around, logged, and used as map keys, but
//! have no behavior of their own beyond what is defined in this module.

use std::{
    fmt::{self, Display, Formatter},
    ops::{Add, AddAssign},
};

use serde::{Deserialize, Serialize};

/// Identifies a [Community](super::community::Community). Unique on the host.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct CommunityID(String);

impl CommunityID {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for CommunityID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommunityID {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifies a [User](super::community::User). Uniqueness is maintained by a global namespace outside of
/// this crate.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct UserID(String);

impl UserID {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for UserID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserID {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifies an application running on a community's servers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppID(String);

impl AppID {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Position of a transition in the log of the entity it applies to.
///
/// Sequence numbers start at 1. The value 0 denotes "nothing applied yet", which is the sequence number
/// of a freshly created state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// The sequence number immediately following this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = SequenceNumber;
    fn add(self, rhs: u64) -> Self::Output {
        SequenceNumber::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for SequenceNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Opaque handle to a process registered with the [supervisor](crate::supervisor). Components other than
/// the supervisor only ever hold this id and look the process up through the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessID(u64);

impl ProcessID {
    pub(crate) const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ProcessID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}
