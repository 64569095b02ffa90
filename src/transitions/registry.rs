/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Maps kind tags to decoders and subscription categories.
//!
//! The wire format stores a transition's kind tag separately from its typed body, so reconstructing a
//! [`Transition`] from an untyped payload requires knowing which schema to decode the body with. A
//! [`TransitionRegistry`] holds one [`Registration`] per kind: the decoder for the body and the
//! [category](SubscriptionCategory) of log the kind belongs in.
//!
//! The registry is immutable once built. It is constructed once at start-up (usually with
//! [`TransitionRegistry::standard`]) and shared, behind an `Arc`, with every component that needs to decode
//! transitions or check their category.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{
    AddCommunity, AddMember, InitCommunity, ModifyCommunityMembers, SubscriptionCategory, Transition,
    TransitionKind, UpdateBacknet,
};

/// Decodes the untyped body of one kind of transition.
pub type Decoder = fn(Value) -> Result<Transition, DecodeError>;

/// What the registry knows about one kind of transition.
#[derive(Clone, Copy)]
pub struct Registration {
    pub kind: TransitionKind,
    pub category: SubscriptionCategory,
    pub decoder: Decoder,
}

pub struct TransitionRegistry {
    by_tag: HashMap<&'static str, Registration>,
}

impl TransitionRegistry {
    /// Create a registry that knows no kinds. Decoding anything with it fails with
    /// [`DecodeError::UnknownTag`].
    pub fn empty() -> TransitionRegistry {
        TransitionRegistry {
            by_tag: HashMap::new(),
        }
    }

    /// Create a registry that knows every variant of [`Transition`].
    pub fn standard() -> TransitionRegistry {
        let mut registry = TransitionRegistry::empty();
        registry.register(
            TransitionKind::InitCommunity,
            SubscriptionCategory::Community,
            |body| {
                let t: InitCommunity = decode_body(TransitionKind::InitCommunity, body)?;
                check(TransitionKind::InitCommunity, t.validate())?;
                Ok(t.into())
            },
        );
        registry.register(
            TransitionKind::AddCommunity,
            SubscriptionCategory::Host,
            |body| {
                let t: AddCommunity = decode_body(TransitionKind::AddCommunity, body)?;
                check(TransitionKind::AddCommunity, t.validate())?;
                Ok(t.into())
            },
        );
        registry.register(
            TransitionKind::AddMember,
            SubscriptionCategory::Community,
            |body| {
                let t: AddMember = decode_body(TransitionKind::AddMember, body)?;
                check(TransitionKind::AddMember, t.validate())?;
                Ok(t.into())
            },
        );
        registry.register(
            TransitionKind::ModifyCommunityMembers,
            SubscriptionCategory::Community,
            |body| {
                let t: ModifyCommunityMembers =
                    decode_body(TransitionKind::ModifyCommunityMembers, body)?;
                check(TransitionKind::ModifyCommunityMembers, t.validate())?;
                Ok(t.into())
            },
        );
        registry.register(
            TransitionKind::UpdateBacknet,
            SubscriptionCategory::Community,
            |body| {
                let t: UpdateBacknet = decode_body(TransitionKind::UpdateBacknet, body)?;
                check(TransitionKind::UpdateBacknet, t.validate())?;
                Ok(t.into())
            },
        );
        registry
    }

    /// Register (or replace) the decoder and category for `kind`.
    pub fn register(
        &mut self,
        kind: TransitionKind,
        category: SubscriptionCategory,
        decoder: Decoder,
    ) {
        self.by_tag.insert(
            kind.tag(),
            Registration {
                kind,
                category,
                decoder,
            },
        );
    }

    pub fn registration(&self, tag: &str) -> Option<&Registration> {
        self.by_tag.get(tag)
    }

    /// Get the subscription category of `kind`, or `None` if the kind was never registered.
    pub fn category(&self, kind: TransitionKind) -> Option<SubscriptionCategory> {
        self.by_tag
            .get(kind.tag())
            .map(|registration| registration.category)
    }

    /// Reconstruct a transition from its kind tag and untyped body.
    pub fn decode(&self, tag: &str, body: Value) -> Result<Transition, DecodeError> {
        let registration = self
            .by_tag
            .get(tag)
            .ok_or_else(|| DecodeError::UnknownTag {
                tag: tag.to_string(),
            })?;
        (registration.decoder)(body)
    }
}

fn decode_body<T: DeserializeOwned>(kind: TransitionKind, body: Value) -> Result<T, DecodeError> {
    serde_json::from_value(body).map_err(|source| DecodeError::SchemaMismatch { kind, source })
}

fn check(kind: TransitionKind, validation: Result<(), String>) -> Result<(), DecodeError> {
    validation.map_err(|reason| DecodeError::Invalid { kind, reason })
}

/// Enumerates the ways reconstructing a transition from its wire form can fail.
#[derive(Debug)]
pub enum DecodeError {
    /// The payload carries no kind tag.
    MissingTag,

    UnknownTag { tag: String },

    /// The payload carries a kind tag, but no transition body.
    MissingBody { kind: TransitionKind },

    /// The body does not match the schema registered for its kind tag.
    SchemaMismatch {
        kind: TransitionKind,
        source: serde_json::Error,
    },

    /// The body matches the schema, but fails the variant's structural checks (e.g. an empty id).
    Invalid {
        kind: TransitionKind,
        reason: String,
    },

    /// The payload is not JSON, or not a JSON object.
    Json(serde_json::Error),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MissingTag => f.write_str("transition has no type tag"),
            DecodeError::UnknownTag { tag } => write!(f, "unknown transition type tag {:?}", tag),
            DecodeError::MissingBody { kind } => write!(f, "{} transition has no body", kind),
            DecodeError::SchemaMismatch { kind, source } => {
                write!(f, "{} transition body does not match its schema: {}", kind, source)
            }
            DecodeError::Invalid { kind, reason } => {
                write!(f, "invalid {} transition: {}", kind, reason)
            }
            DecodeError::Json(err) => write!(f, "malformed envelope: {}", err),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::SchemaMismatch { source, .. } => Some(source),
            DecodeError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(value: serde_json::Error) -> Self {
        DecodeError::Json(value)
    }
}
