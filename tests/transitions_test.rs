/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use habitat_rs::{
    transitions::{
        envelope::TransitionEnvelope,
        registry::{DecodeError, TransitionRegistry},
        AddCommunity, ModifyCommunityMembers, ModifyType, ReduceError, SubscriptionCategory,
        Transition, TransitionKind, UpdateBacknet,
    },
    types::{
        basic::{CommunityID, SequenceNumber, UserID},
        community::{Backnet, BacknetType, Host, PortMap, User},
    },
};
use habitat_rs::logging::setup_logger;
use log::LevelFilter;
use serde_json::json;

mod common;

use crate::common::fixtures::{community, user};

#[test]
fn every_kind_has_a_category_test() {
    let registry = TransitionRegistry::standard();
    for kind in TransitionKind::ALL {
        let registration = registry.registration(kind.tag()).unwrap();
        assert_eq!(registration.kind, kind);
    }

    assert_eq!(
        registry.category(TransitionKind::AddCommunity),
        Some(SubscriptionCategory::Host)
    );
    assert_eq!(
        registry.category(TransitionKind::AddMember),
        Some(SubscriptionCategory::Community)
    );
    assert_eq!(TransitionRegistry::empty().category(TransitionKind::AddMember), None);
}

#[test]
fn decode_minimal_bodies_test() {
    setup_logger(LevelFilter::Debug);
    let registry = TransitionRegistry::standard();

    // 1. A community body only needs an id and a name.
    let envelope = TransitionEnvelope::from_value(
        &registry,
        json!({
            "type": "INIT_COMMUNITY",
            "transition": { "community": { "id": "c0", "name": "My Community" } },
            "sequence_number": 1
        }),
    )
    .unwrap();
    assert_eq!(envelope.kind(), TransitionKind::InitCommunity);
    assert_eq!(envelope.community_id(), &CommunityID::new("c0"));
    assert_eq!(envelope.sequence_number, SequenceNumber::new(1));
    assert!(envelope.committed_at.is_none());
    match &envelope.transition {
        Transition::InitCommunity(init) => {
            assert_eq!(init.community.member_count(), 0);
            assert_eq!(init.community.backnet.backnet_type, BacknetType::Ipfs);
        }
        other => panic!("decoded into {:?}", other),
    }

    // 2. Modifications carry their type in the "type" field of the body.
    let envelope = TransitionEnvelope::from_value(
        &registry,
        json!({
            "type": "MODIFY_COMMUNITY_MEMBERS",
            "transition": { "community_id": "c0", "user": { "id": "u1" }, "type": "REMOVE_MEMBER" },
            "sequence_number": 4
        }),
    )
    .unwrap();
    assert_eq!(
        envelope.transition,
        Transition::ModifyCommunityMembers(ModifyCommunityMembers {
            community_id: CommunityID::new("c0"),
            user: User::new(UserID::new("u1"), ""),
            modification: ModifyType::RemoveMember,
        })
    );

    // 3. The envelope written back carries the same tag and body.
    let value = envelope.to_value().unwrap();
    assert_eq!(value["type"], "MODIFY_COMMUNITY_MEMBERS");
    assert_eq!(value["transition"]["type"], "REMOVE_MEMBER");
    assert!(value.get("committed_at").is_none());
}

#[test]
fn decode_errors_test() {
    let registry = TransitionRegistry::standard();

    let missing_tag = TransitionEnvelope::from_value(
        &registry,
        json!({ "transition": {}, "sequence_number": 1 }),
    );
    assert!(matches!(missing_tag, Err(DecodeError::MissingTag)));

    let unknown_tag = TransitionEnvelope::from_value(
        &registry,
        json!({ "type": "RENAME_COMMUNITY", "transition": {}, "sequence_number": 1 }),
    );
    assert!(matches!(unknown_tag, Err(DecodeError::UnknownTag { tag }) if tag == "RENAME_COMMUNITY"));

    let missing_body = TransitionEnvelope::from_value(
        &registry,
        json!({ "type": "ADD_MEMBER", "sequence_number": 1 }),
    );
    assert!(matches!(
        missing_body,
        Err(DecodeError::MissingBody { kind: TransitionKind::AddMember })
    ));

    let wrong_schema = TransitionEnvelope::from_value(
        &registry,
        json!({ "type": "ADD_MEMBER", "transition": { "community": "c0" }, "sequence_number": 1 }),
    );
    assert!(matches!(
        wrong_schema,
        Err(DecodeError::SchemaMismatch { kind: TransitionKind::AddMember, .. })
    ));

    let empty_user = TransitionEnvelope::from_value(
        &registry,
        json!({
            "type": "ADD_MEMBER",
            "transition": { "community_id": "c0", "user": { "id": "" } },
            "sequence_number": 1
        }),
    );
    assert!(matches!(empty_user, Err(DecodeError::Invalid { .. })));

    assert!(matches!(
        TransitionEnvelope::from_bytes(&registry, b"{ not json"),
        Err(DecodeError::Json(_))
    ));
}

#[test]
fn community_reducers_test() {
    let c0 = community("c0");

    // 1. Membership.
    let modify = |modification, user_id: &str| ModifyCommunityMembers {
        community_id: c0.id.clone(),
        user: user(user_id),
        modification,
    };
    let with_u1 = modify(ModifyType::AddMember, "u1").reduce(Some(&c0)).unwrap();
    assert!(with_u1.has_member(&UserID::new("u1")));
    // The old state is never touched.
    assert_eq!(c0.member_count(), 0);

    assert!(matches!(
        modify(ModifyType::AddMember, "u1").reduce(Some(&with_u1)),
        Err(ReduceError::DuplicateMember { .. })
    ));
    assert!(matches!(
        modify(ModifyType::RemoveMember, "u2").reduce(Some(&with_u1)),
        Err(ReduceError::MemberNotFound { .. })
    ));
    assert!(matches!(
        modify(ModifyType::BanMember, "u1").reduce(Some(&with_u1)),
        Err(ReduceError::NotImplemented { .. })
    ));
    let without_u1 = modify(ModifyType::RemoveMember, "u1").reduce(Some(&with_u1)).unwrap();
    assert_eq!(without_u1.member_count(), 0);

    // 2. Scoping.
    assert!(matches!(
        modify(ModifyType::AddMember, "u1").reduce(None),
        Err(ReduceError::CommunityNotInitialized { .. })
    ));
    assert!(matches!(
        modify(ModifyType::AddMember, "u1").reduce(Some(&community("c1"))),
        Err(ReduceError::CommunityMismatch { .. })
    ));

    // 3. Backnets keep their type.
    let mut new_backnet = Backnet::new(BacknetType::Ipfs);
    new_backnet.bootstrap = vec!["/ip4/10.0.0.1/tcp/4001/p2p/QmPeer".to_string()];
    new_backnet.local.port_map = PortMap::from([("swarm", 5000), ("api", 5001), ("gateway", 5002)]);
    let update = UpdateBacknet {
        community_id: c0.id.clone(),
        old_backnet: c0.backnet.clone(),
        new_backnet: new_backnet.clone(),
    };
    let updated = update.reduce(Some(&c0)).unwrap();
    assert_eq!(updated.backnet, new_backnet);
    assert_eq!(updated.name, c0.name);

    let migrate = UpdateBacknet {
        community_id: c0.id.clone(),
        old_backnet: c0.backnet.clone(),
        new_backnet: Backnet::new(BacknetType::Dat),
    };
    assert_eq!(
        migrate.reduce(Some(&c0)),
        Err(ReduceError::BacknetTypeMismatch {
            existing: BacknetType::Ipfs,
            requested: BacknetType::Dat,
        })
    );
}

#[test]
fn host_reducer_test() {
    let add = AddCommunity {
        community: community("c0"),
    };
    let host = add.reduce(&Host::new()).unwrap();
    assert!(host.community(&CommunityID::new("c0")).is_some());

    assert!(matches!(
        add.reduce(&host),
        Err(ReduceError::DuplicateCommunity { community }) if community.as_str() == "c0"
    ));
}
