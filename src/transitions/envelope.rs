/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The sequenced wire form of a transition.
//!
//! An envelope serializes to a JSON object of the form:
//!
//! ```json
//! {
//!     "type": "ADD_MEMBER",
//!     "transition": { "community_id": "c0", "user": { "id": "u1" } },
//!     "sequence_number": 2,
//!     "committed_at": "2023-11-30T07:27:44Z"
//! }
//! ```
//!
//! `committed_at` is only present on envelopes that went through the [write-ahead log](crate::wal). The kind
//! tag (`"type"`) is always written from the transition itself, so an envelope can never carry a tag that
//! disagrees with its body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::basic::{CommunityID, SequenceNumber};

use super::{
    registry::{DecodeError, TransitionRegistry},
    Transition, TransitionKind,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionEnvelope {
    pub transition: Transition,
    pub sequence_number: SequenceNumber,
    pub committed_at: Option<DateTime<Utc>>,
}

impl TransitionEnvelope {
    pub fn new(transition: impl Into<Transition>, sequence_number: SequenceNumber) -> TransitionEnvelope {
        TransitionEnvelope {
            transition: transition.into(),
            sequence_number,
            committed_at: None,
        }
    }

    pub fn kind(&self) -> TransitionKind {
        self.transition.kind()
    }

    pub fn community_id(&self) -> &CommunityID {
        self.transition.community_id()
    }

    /// Serialize this envelope into a JSON value.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let raw = RawEnvelope {
            kind: Some(self.kind().tag().to_string()),
            transition: Some(self.transition.body()?),
            sequence_number: self.sequence_number,
            committed_at: self.committed_at,
        };
        serde_json::to_value(raw)
    }

    /// Serialize this envelope into compact JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value()?)
    }

    /// Reconstruct an envelope from an untyped JSON value, selecting the body's schema by its kind tag.
    pub fn from_value(registry: &TransitionRegistry, value: Value) -> Result<TransitionEnvelope, DecodeError> {
        let raw: RawEnvelope = serde_json::from_value(value)?;
        let tag = raw.kind.ok_or(DecodeError::MissingTag)?;
        let body = match raw.transition {
            Some(Value::Null) | None => {
                let kind = registry
                    .registration(&tag)
                    .map(|registration| registration.kind)
                    .ok_or_else(|| DecodeError::UnknownTag { tag: tag.clone() })?;
                return Err(DecodeError::MissingBody { kind });
            }
            Some(body) => body,
        };

        Ok(TransitionEnvelope {
            transition: registry.decode(&tag, body)?,
            sequence_number: raw.sequence_number,
            committed_at: raw.committed_at,
        })
    }

    pub fn from_bytes(registry: &TransitionRegistry, bytes: &[u8]) -> Result<TransitionEnvelope, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        TransitionEnvelope::from_value(registry, value)
    }
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    transition: Option<Value>,
    sequence_number: SequenceNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    committed_at: Option<DateTime<Utc>>,
}
