/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The seam between a stream of committed transitions and the components that react to them.
//!
//! State machines and the [process supervisor](crate::supervisor::ProcessSupervisor) both implement
//! [`TransitionSubscriber`]. A [`Dispatcher`] fans every committed transition out to the subscribers
//! registered with it. Subscribers are independent: one failing does not stop delivery to the others, and
//! there is no ordering guarantee between the reactions of different subscribers to the same transition.

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use crate::{
    state_machine::StateMachineError,
    supervisor::SupervisorError,
    transitions::{envelope::TransitionEnvelope, TransitionKind},
};

/// Reacts to committed transitions.
pub trait TransitionSubscriber: Send + Sync {
    fn receive(&self, envelope: &TransitionEnvelope) -> Result<(), ReceiveError>;
}

struct Subscription {
    name: String,
    /// `None` subscribes to every kind.
    kinds: Option<Vec<TransitionKind>>,
    subscriber: Arc<dyn TransitionSubscriber>,
}

impl Subscription {
    fn wants(&self, kind: TransitionKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

/// Delivers transitions to subscribers, in the order they subscribed.
#[derive(Default)]
pub struct Dispatcher {
    subscriptions: Vec<Subscription>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Subscribe `subscriber` to every transition.
    pub fn subscribe(&mut self, name: impl Into<String>, subscriber: Arc<dyn TransitionSubscriber>) {
        self.subscriptions.push(Subscription {
            name: name.into(),
            kinds: None,
            subscriber,
        })
    }

    /// Subscribe `subscriber` to the transitions of the given `kinds` only.
    pub fn subscribe_to(
        &mut self,
        name: impl Into<String>,
        kinds: &[TransitionKind],
        subscriber: Arc<dyn TransitionSubscriber>,
    ) {
        self.subscriptions.push(Subscription {
            name: name.into(),
            kinds: Some(kinds.to_vec()),
            subscriber,
        })
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Deliver `envelope` to every subscriber that wants its kind.
    pub fn dispatch(&self, envelope: &TransitionEnvelope) -> DispatchReport {
        let mut report = DispatchReport::default();
        for subscription in self
            .subscriptions
            .iter()
            .filter(|subscription| subscription.wants(envelope.kind()))
        {
            match subscription.subscriber.receive(envelope) {
                Ok(()) => report.delivered.push(subscription.name.clone()),
                Err(err) => {
                    log::warn!(
                        "subscriber {} failed to receive {} #{} for {}: {}",
                        subscription.name,
                        envelope.kind(),
                        envelope.sequence_number,
                        envelope.community_id(),
                        err
                    );
                    report.failures.push((subscription.name.clone(), err));
                }
            }
        }
        report
    }
}

/// The outcome of one [`Dispatcher::dispatch`].
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Names of the subscribers that received the transition.
    pub delivered: Vec<String>,
    pub failures: Vec<(String, ReceiveError)>,
}

impl DispatchReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub enum ReceiveError {
    StateMachine(StateMachineError),
    Supervisor(SupervisorError),
}

impl Display for ReceiveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveError::StateMachine(err) => Display::fmt(err, f),
            ReceiveError::Supervisor(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for ReceiveError {}

impl From<StateMachineError> for ReceiveError {
    fn from(value: StateMachineError) -> Self {
        ReceiveError::StateMachine(value)
    }
}

impl From<SupervisorError> for ReceiveError {
    fn from(value: SupervisorError) -> Self {
        ReceiveError::Supervisor(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        transitions::{AddMember, InitCommunity},
        types::{
            basic::{CommunityID, SequenceNumber, UserID},
            community::{BacknetType, Community, User},
        },
    };

    #[derive(Default)]
    struct Counter(Mutex<Vec<TransitionKind>>);

    impl TransitionSubscriber for Counter {
        fn receive(&self, envelope: &TransitionEnvelope) -> Result<(), ReceiveError> {
            self.0.lock().unwrap().push(envelope.kind());
            Ok(())
        }
    }

    #[test]
    fn kind_filters_are_respected() {
        let all = Arc::new(Counter::default());
        let members = Arc::new(Counter::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe("all", all.clone());
        dispatcher.subscribe_to("members", &[TransitionKind::AddMember], members.clone());

        let community = Community::new(CommunityID::new("c0"), "My Community", BacknetType::Ipfs);
        let init = TransitionEnvelope::new(InitCommunity { community }, SequenceNumber::new(1));
        let add = TransitionEnvelope::new(
            AddMember {
                community_id: CommunityID::new("c0"),
                user: User::new(UserID::new("u1"), "u1"),
            },
            SequenceNumber::new(2),
        );

        assert_eq!(dispatcher.dispatch(&init).delivered, vec!["all".to_string()]);
        assert!(dispatcher.dispatch(&add).is_ok());
        assert_eq!(all.0.lock().unwrap().len(), 2);
        assert_eq!(*members.0.lock().unwrap(), vec![TransitionKind::AddMember]);
    }
}
