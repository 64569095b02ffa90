/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Local port allocation for backnets.

use std::fmt::{self, Display, Formatter};

use crate::types::community::PortMap;

/// The ports one IPFS-style backnet listens on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortBlock {
    pub swarm: u16,
    pub api: u16,
    pub gateway: u16,
}

impl PortBlock {
    /// Read a block out of a port map that names all of `swarm`, `api` and `gateway`.
    pub fn from_port_map(port_map: &PortMap) -> Option<PortBlock> {
        Some(PortBlock {
            swarm: port_map.get(PortMap::SWARM)?,
            api: port_map.get(PortMap::API)?,
            gateway: port_map.get(PortMap::GATEWAY)?,
        })
    }

    pub fn ports(&self) -> [u16; 3] {
        [self.swarm, self.api, self.gateway]
    }

    /// Whether any port of `self` is also a port of `other`.
    pub fn overlaps(&self, other: &PortBlock) -> bool {
        self.ports().iter().any(|port| other.ports().contains(port))
    }

    pub fn to_port_map(&self) -> PortMap {
        PortMap::from([
            (PortMap::SWARM, self.swarm),
            (PortMap::API, self.api),
            (PortMap::GATEWAY, self.gateway),
        ])
    }
}

impl Display for PortBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.swarm, self.api, self.gateway)
    }
}

/// Hands out blocks of consecutive ports, never handing out the same port twice.
///
/// Ports are not recycled when a backnet stops. Guard with a mutex to share between threads.
pub struct PortAllocator {
    next: u32,
    block_size: u16,
}

impl PortAllocator {
    /// `block_size` must be at least 3; the first three ports of a block are used as swarm, API and gateway
    /// ports respectively.
    pub fn new(start_port: u16, block_size: u16) -> PortAllocator {
        PortAllocator {
            next: start_port as u32,
            block_size: block_size.max(3),
        }
    }

    pub fn allocate(&mut self) -> Result<PortBlock, PortsExhausted> {
        let first = self.next;
        let end = first + self.block_size as u32;
        if end > u16::MAX as u32 + 1 {
            return Err(PortsExhausted);
        }
        self.next = end;

        let first = first as u16;
        Ok(PortBlock {
            swarm: first,
            api: first + 1,
            gateway: first + 2,
        })
    }

    /// Mark the ports of a block chosen outside the allocator as taken, so later blocks start past them.
    pub fn reserve(&mut self, block: PortBlock) {
        if let Some(highest) = block.ports().iter().max() {
            self.next = self.next.max(*highest as u32 + 1);
        }
    }

    /// The first port that has not been handed out yet.
    pub fn next_port(&self) -> u32 {
        self.next
    }
}

/// Every port above the start port has been handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortsExhausted;

impl Display for PortsExhausted {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("no ports left to allocate")
    }
}

impl std::error::Error for PortsExhausted {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_never_overlap() {
        let mut allocator = PortAllocator::new(4000, 5);
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_eq!(first, PortBlock { swarm: 4000, api: 4001, gateway: 4002 });
        assert_eq!(second.swarm, 4005);
        assert_eq!(allocator.next_port(), 4010);
    }

    #[test]
    fn reserved_blocks_are_skipped() {
        let mut allocator = PortAllocator::new(4000, 3);
        allocator.reserve(PortBlock { swarm: 4100, api: 4101, gateway: 4102 });
        assert_eq!(allocator.allocate().unwrap().swarm, 4103);

        // Blocks below the next port change nothing.
        allocator.reserve(PortBlock { swarm: 4000, api: 4001, gateway: 4002 });
        assert_eq!(allocator.next_port(), 4106);
    }

    #[test]
    fn overlapping_blocks() {
        let block = PortBlock { swarm: 4000, api: 4001, gateway: 4002 };
        assert!(block.overlaps(&PortBlock { swarm: 4002, api: 4010, gateway: 4011 }));
        assert!(!block.overlaps(&PortBlock { swarm: 4003, api: 4004, gateway: 4005 }));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut allocator = PortAllocator::new(u16::MAX - 3, 3);
        assert!(allocator.allocate().is_ok());
        assert_eq!(allocator.allocate(), Err(PortsExhausted));
    }
}
