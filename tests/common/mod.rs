/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

#[cfg(unix)]
pub(crate) mod fake_ipfs;

pub(crate) mod fixtures;
