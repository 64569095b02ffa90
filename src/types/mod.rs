/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared across the subsystems of a Habitat host.
//!
//! - [`basic`]: identifier newtypes and [`SequenceNumber`](basic::SequenceNumber).
//! - [`community`]: the entities that transitions are reduced over ([`Community`](community::Community),
//!   [`Host`](community::Host)) and the data they contain.

pub mod basic;

pub mod community;
