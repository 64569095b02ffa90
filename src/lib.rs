/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable community state and backnet orchestration for a Habitat host.
//!
//! A host keeps the state of itself and of each community it hosts in a
//! [state machine](state_machine::StateMachine): a reducer over a
//! [write-ahead log](wal::WriteAheadLog) of [transitions](transitions), compacted by periodic
//! [snapshots](snapshot). Committed transitions are dispatched to [subscribers](subscriber), among them a
//! [process supervisor](supervisor) that runs every community's backnet.
//!
//! [`node::HostSpec`] builds and starts a [`node::HostNode`], which ties all of this together.

pub mod config;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod node;

pub mod rsm;

pub mod snapshot;

pub mod state_machine;

pub mod subscriber;

pub mod supervisor;

pub mod transitions;

pub mod types;

pub mod wal;
