//! Cluster records
//!
//! Each cluster is a fixed-size record following the header:
//! `[traits: 1][prev: 8][next: 8][data: cluster_size]`.
//!
//! Interior clusters link to their neighbours. Terminal clusters reuse the
//! otherwise-empty link to point back at their owner: a start cluster's
//! `prev` and an end cluster's `next` hold the owning descriptor index, or
//! [`NULL_CLUSTER`] for the descriptor table chain.

use crate::endian::Endianness;
use crate::error::{ClusterError, Result};

/// "No cluster" sentinel (the bit pattern of -1)
pub const NULL_CLUSTER: u64 = u64::MAX;

/// Size of the traits + prev + next prefix of every cluster record
pub const CLUSTER_HEADER_SIZE: usize = 1 + 8 + 8;

pub const TRAITS_OFFSET: usize = 0;
pub const PREV_OFFSET: usize = 1;
pub const NEXT_OFFSET: usize = 9;
pub const DATA_OFFSET: usize = CLUSTER_HEADER_SIZE;

bitflags::bitflags! {
    /// Role and position of a cluster within its chain
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClusterTraits: u8 {
        /// Payload of a user stream
        const DATA = 0x01;
        /// Payload of the descriptor table
        const DESCRIPTOR = 0x02;
        /// First cluster of a chain; `prev` holds the owner
        const START = 0x04;
        /// Last cluster of a chain; `next` holds the owner
        const END = 0x08;
    }
}

/// Which chain family a cluster belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    Data,
    Descriptor,
}

impl ClusterRole {
    pub fn traits(self) -> ClusterTraits {
        match self {
            ClusterRole::Data => ClusterTraits::DATA,
            ClusterRole::Descriptor => ClusterTraits::DESCRIPTOR,
        }
    }
}

impl ClusterTraits {
    /// Decode a traits byte, rejecting unknown bits and ambiguous roles
    pub fn decode(cluster: u64, value: u8) -> Result<Self> {
        let traits = ClusterTraits::from_bits(value).ok_or_else(|| {
            ClusterError::corrupt_cluster(cluster, format!("illegal traits {:#04x}", value))
        })?;
        if traits.contains(ClusterTraits::DATA) == traits.contains(ClusterTraits::DESCRIPTOR) {
            return Err(ClusterError::corrupt_cluster(
                cluster,
                format!("traits {:#04x} name no single role", value),
            ));
        }
        Ok(traits)
    }

    pub fn role(self) -> ClusterRole {
        if self.contains(ClusterTraits::DESCRIPTOR) {
            ClusterRole::Descriptor
        } else {
            ClusterRole::Data
        }
    }
}

/// The 17-byte prefix of a cluster record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHeader {
    pub traits: ClusterTraits,
    pub prev: u64,
    pub next: u64,
}

impl ClusterHeader {
    pub fn is_start(&self) -> bool {
        self.traits.contains(ClusterTraits::START)
    }

    pub fn is_end(&self) -> bool {
        self.traits.contains(ClusterTraits::END)
    }

    pub fn to_bytes(&self, endianness: Endianness) -> [u8; CLUSTER_HEADER_SIZE] {
        let mut bytes = [0u8; CLUSTER_HEADER_SIZE];
        bytes[TRAITS_OFFSET] = self.traits.bits();
        endianness.write_u64(&mut bytes[PREV_OFFSET..NEXT_OFFSET], self.prev);
        endianness.write_u64(&mut bytes[NEXT_OFFSET..DATA_OFFSET], self.next);
        bytes
    }

    pub fn from_bytes(cluster: u64, bytes: &[u8], endianness: Endianness) -> Result<Self> {
        if bytes.len() < CLUSTER_HEADER_SIZE {
            return Err(ClusterError::corrupt_cluster(cluster, "short cluster header"));
        }
        Ok(ClusterHeader {
            traits: ClusterTraits::decode(cluster, bytes[TRAITS_OFFSET])?,
            prev: endianness.read_u64(&bytes[PREV_OFFSET..NEXT_OFFSET]),
            next: endianness.read_u64(&bytes[NEXT_OFFSET..DATA_OFFSET]),
        })
    }
}

/// Full on-disk size of one cluster record
pub fn record_size(cluster_size: u32) -> u64 {
    CLUSTER_HEADER_SIZE as u64 + cluster_size as u64
}
