//! Container policy flags (header offset 1, 4 bytes)

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Behaviour switches persisted in the container header.
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[serde(transparent)]
    pub struct ContainerPolicy: u32 {
        /// Verify prev/next reciprocity and terminal backlinks while walking chains.
        const INTEGRITY_CHECKS = 0b0001;
        /// Keep decoded stream descriptors in a bounded LRU cache.
        const CACHE_DESCRIPTORS = 0b0010;
        /// Every descriptor carries a fixed-length key.
        const TRACK_KEY = 0b0100;
    }
}

impl ContainerPolicy {
    /// Policy used when none is configured
    pub const DEFAULT: ContainerPolicy = ContainerPolicy::INTEGRITY_CHECKS
        .union(ContainerPolicy::CACHE_DESCRIPTORS);
}

impl Default for ContainerPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}
