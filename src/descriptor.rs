//! Stream descriptors and the descriptor table
//!
//! Descriptor record layout (fixed size):
//! `[traits: 1][start cluster: 8][end cluster: 8][size: 8][key: N]`
//!
//! The table is itself a stream of records stored in the cluster map. Its
//! chain always starts at cluster 0 and is owned by [`NULL_CLUSTER`]; the
//! header tracks its end cluster and, through the stream count, its length.

use crate::cluster::{ClusterRole, NULL_CLUSTER};
use crate::cluster_map::ClusterMap;
use crate::endian::Endianness;
use crate::error::{ClusterError, Result};
use crate::fragment::FragmentProvider;
use crate::header::StreamContainerHeader;
use crate::io::BackingStore;
use crate::policy::ContainerPolicy;
use lru::LruCache;
use std::num::NonZeroUsize;

pub const DESCRIPTOR_TRAITS_OFFSET: usize = 0;
pub const DESCRIPTOR_START_OFFSET: usize = 1;
pub const DESCRIPTOR_END_OFFSET: usize = 9;
pub const DESCRIPTOR_SIZE_OFFSET: usize = 17;
pub const DESCRIPTOR_KEY_OFFSET: usize = 25;

bitflags::bitflags! {
    /// Per-stream flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamTraits: u8 {
        /// Logically absent, as opposed to present but empty
        const NULL = 0x01;
        /// Removed slot awaiting reuse
        const TOMB = 0x02;
    }
}

/// Metadata for one logical stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub traits: StreamTraits,
    pub start_cluster: u64,
    pub end_cluster: u64,
    pub size: u64,
    /// Fixed-length key; empty unless the container tracks keys
    pub key: Vec<u8>,
}

impl StreamDescriptor {
    /// A present, zero-length stream
    pub fn empty(key_size: usize) -> Self {
        StreamDescriptor {
            traits: StreamTraits::empty(),
            start_cluster: NULL_CLUSTER,
            end_cluster: NULL_CLUSTER,
            size: 0,
            key: vec![0u8; key_size],
        }
    }

    pub fn record_size(key_size: usize) -> usize {
        DESCRIPTOR_KEY_OFFSET + key_size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn to_bytes(&self, endianness: Endianness) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::record_size(self.key.len())];
        bytes[DESCRIPTOR_TRAITS_OFFSET] = self.traits.bits();
        endianness.write_u64(&mut bytes[DESCRIPTOR_START_OFFSET..], self.start_cluster);
        endianness.write_u64(&mut bytes[DESCRIPTOR_END_OFFSET..], self.end_cluster);
        endianness.write_u64(&mut bytes[DESCRIPTOR_SIZE_OFFSET..], self.size);
        bytes[DESCRIPTOR_KEY_OFFSET..].copy_from_slice(&self.key);
        bytes
    }

    /// Decode and validate a record against the current cluster count
    pub fn from_bytes(
        index: u64,
        bytes: &[u8],
        endianness: Endianness,
        key_size: usize,
        cluster_size: u32,
        total_clusters: u64,
    ) -> Result<Self> {
        let corrupt = |reason: String| ClusterError::corrupt_descriptor(index, reason);

        if bytes.len() < Self::record_size(key_size) {
            return Err(corrupt(format!("short record of {} bytes", bytes.len())));
        }

        let traits = StreamTraits::from_bits(bytes[DESCRIPTOR_TRAITS_OFFSET])
            .ok_or_else(|| corrupt(format!("illegal traits {:#04x}", bytes[0])))?;
        let descriptor = StreamDescriptor {
            traits,
            start_cluster: endianness.read_u64(&bytes[DESCRIPTOR_START_OFFSET..]),
            end_cluster: endianness.read_u64(&bytes[DESCRIPTOR_END_OFFSET..]),
            size: endianness.read_u64(&bytes[DESCRIPTOR_SIZE_OFFSET..]),
            key: bytes[DESCRIPTOR_KEY_OFFSET..DESCRIPTOR_KEY_OFFSET + key_size].to_vec(),
        };

        let unset = descriptor.start_cluster == NULL_CLUSTER && descriptor.end_cluster == NULL_CLUSTER;
        if descriptor.size == 0 && !unset {
            return Err(corrupt("empty stream has clusters".into()));
        }
        if descriptor.size != 0
            && (descriptor.start_cluster >= total_clusters || descriptor.end_cluster >= total_clusters)
        {
            return Err(corrupt(format!(
                "terminals {}/{} outside {} clusters",
                descriptor.start_cluster, descriptor.end_cluster, total_clusters
            )));
        }
        let spanned = descriptor.size.div_ceil(cluster_size.max(1) as u64);
        if spanned > total_clusters {
            return Err(corrupt(format!(
                "size {} needs {} clusters, only {} exist",
                descriptor.size, spanned, total_clusters
            )));
        }

        Ok(descriptor)
    }
}

/// Positional table of stream descriptors stored as its own chain
pub struct DescriptorTable {
    provider: FragmentProvider,
    endianness: Endianness,
    key_size: usize,
    record_size: u64,
    cache: Option<LruCache<u64, StreamDescriptor>>,
}

impl DescriptorTable {
    pub fn new(header: &StreamContainerHeader, cache_capacity: usize) -> Self {
        let record_size = header.descriptor_record_size() as u64;
        let count = header.stream_count();
        let start = if count == 0 { NULL_CLUSTER } else { 0 };

        let cache = if header.policy().contains(ContainerPolicy::CACHE_DESCRIPTORS) {
            NonZeroUsize::new(cache_capacity).map(LruCache::new)
        } else {
            None
        };

        DescriptorTable {
            provider: FragmentProvider::new(
                NULL_CLUSTER,
                ClusterRole::Descriptor,
                start,
                header.descriptor_table_end(),
                count * record_size,
                header.cluster_size(),
            ),
            endianness: header.endianness(),
            key_size: header.key_size(),
            record_size,
            cache,
        }
    }

    pub fn count(&self) -> u64 {
        self.provider.len() / self.record_size
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn provider(&self) -> &FragmentProvider {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut FragmentProvider {
        &mut self.provider
    }

    pub fn cached_len(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.len())
    }

    /// Drop everything after the cluster map has been cleared
    pub fn reset(&mut self) {
        self.provider.reset();
        self.invalidate_all();
    }

    fn invalidate(&mut self, index: u64) {
        if let Some(cache) = self.cache.as_mut() {
            cache.pop(&index);
        }
    }

    fn invalidate_all(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    fn check_index(&self, index: u64) -> Result<()> {
        let count = self.count();
        if index >= count {
            return Err(ClusterError::IndexOutOfRange { index, count });
        }
        Ok(())
    }

    fn record_offset(&self, index: u64) -> u64 {
        index * self.record_size
    }

    fn read_record<S: BackingStore>(&mut self, map: &mut ClusterMap<S>, index: u64) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.record_size as usize];
        let offset = self.record_offset(index);
        let read = self.provider.read(map, offset, &mut bytes)?;
        if read != bytes.len() {
            return Err(ClusterError::corrupt_descriptor(
                index,
                format!("record truncated to {} bytes", read),
            ));
        }
        Ok(bytes)
    }

    pub fn read<S: BackingStore>(&mut self, map: &mut ClusterMap<S>, index: u64) -> Result<StreamDescriptor> {
        self.check_index(index)?;
        if let Some(descriptor) = self.cache.as_mut().and_then(|cache| cache.get(&index)) {
            return Ok(descriptor.clone());
        }

        let descriptor = self.read_uncached(map, index)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.put(index, descriptor.clone());
        }
        Ok(descriptor)
    }

    /// Decode a record straight from the store, bypassing the cache
    pub fn read_uncached<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        index: u64,
    ) -> Result<StreamDescriptor> {
        self.check_index(index)?;
        let bytes = self.read_record(map, index)?;
        StreamDescriptor::from_bytes(
            index,
            &bytes,
            self.endianness,
            self.key_size,
            map.cluster_size(),
            map.total_clusters(),
        )
    }

    pub fn write<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        index: u64,
        descriptor: &StreamDescriptor,
    ) -> Result<()> {
        self.check_index(index)?;
        self.check_key(&descriptor.key)?;
        let offset = self.record_offset(index);
        self.provider.write(map, offset, &descriptor.to_bytes(self.endianness))?;
        self.invalidate(index);
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(ClusterError::InvalidKeySize {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn patch_u64<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        index: u64,
        field: usize,
        value: u64,
    ) -> Result<()> {
        self.check_index(index)?;
        let offset = self.record_offset(index) + field as u64;
        self.provider.write(map, offset, &self.endianness.u64_bytes(value))?;
        self.invalidate(index);
        Ok(())
    }

    /// Patch start and/or end cluster in place
    pub fn patch_terminals<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        index: u64,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<()> {
        if let Some(start) = start {
            self.patch_u64(map, index, DESCRIPTOR_START_OFFSET, start)?;
        }
        if let Some(end) = end {
            self.patch_u64(map, index, DESCRIPTOR_END_OFFSET, end)?;
        }
        Ok(())
    }

    /// Write start, end and size together
    pub fn patch_extent<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        index: u64,
        start: u64,
        end: u64,
        size: u64,
    ) -> Result<()> {
        self.check_index(index)?;
        let mut bytes = [0u8; 24];
        self.endianness.write_u64(&mut bytes[0..8], start);
        self.endianness.write_u64(&mut bytes[8..16], end);
        self.endianness.write_u64(&mut bytes[16..24], size);
        let offset = self.record_offset(index) + DESCRIPTOR_START_OFFSET as u64;
        self.provider.write(map, offset, &bytes)?;
        self.invalidate(index);
        Ok(())
    }

    pub fn patch_key<S: BackingStore>(&mut self, map: &mut ClusterMap<S>, index: u64, key: &[u8]) -> Result<()> {
        self.check_index(index)?;
        if self.key_size == 0 {
            return Err(ClusterError::KeyTrackingDisabled);
        }
        self.check_key(key)?;
        let offset = self.record_offset(index) + DESCRIPTOR_KEY_OFFSET as u64;
        self.provider.write(map, offset, key)?;
        self.invalidate(index);
        Ok(())
    }

    /// Extent fields of a raw record: (start, end, size)
    fn extent_of(&self, record: &[u8]) -> (u64, u64, u64) {
        (
            self.endianness.read_u64(&record[DESCRIPTOR_START_OFFSET..]),
            self.endianness.read_u64(&record[DESCRIPTOR_END_OFFSET..]),
            self.endianness.read_u64(&record[DESCRIPTOR_SIZE_OFFSET..]),
        )
    }

    /// Re-own the chains of `count` records held in `block` after they moved
    /// from `first_old` to `first_new`
    fn repoint_block<S: BackingStore>(
        &self,
        map: &mut ClusterMap<S>,
        block: &[u8],
        first_old: u64,
        first_new: u64,
    ) -> Result<()> {
        for (i, record) in block.chunks_exact(self.record_size as usize).enumerate() {
            let (start, end, size) = self.extent_of(record);
            if size != 0 {
                map.set_chain_owner(start, end, first_old + i as u64, first_new + i as u64)?;
            }
        }
        Ok(())
    }

    /// Insert `descriptor` at `index`, shifting later records up by one.
    /// Costs O(count - index): every shifted chain gets its backlinks patched.
    pub fn insert<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        index: u64,
        descriptor: &StreamDescriptor,
    ) -> Result<()> {
        let count = self.count();
        if index > count {
            return Err(ClusterError::IndexOutOfRange { index, count });
        }
        self.check_key(&descriptor.key)?;

        if count == 0 && self.provider.start() == NULL_CLUSTER && map.total_clusters() != 0 {
            return Err(ClusterError::CorruptHeader(format!(
                "{} clusters exist without any stream",
                map.total_clusters()
            )));
        }

        self.provider.set_len(map, (count + 1) * self.record_size)?;

        if index < count {
            let mut block = vec![0u8; ((count - index) * self.record_size) as usize];
            self.provider.read(map, self.record_offset(index), &mut block)?;
            self.provider.write(map, self.record_offset(index + 1), &block)?;
            self.repoint_block(map, &block, index, index + 1)?;
        }

        let offset = self.record_offset(index);
        self.provider.write(map, offset, &descriptor.to_bytes(self.endianness))?;
        self.invalidate_all();
        Ok(())
    }

    /// Remove the record at `index`, shifting later records down by one.
    /// The removed stream's chain must already be released.
    pub fn remove<S: BackingStore>(&mut self, map: &mut ClusterMap<S>, index: u64) -> Result<()> {
        self.check_index(index)?;
        let count = self.count();

        if index + 1 < count {
            let mut block = vec![0u8; ((count - index - 1) * self.record_size) as usize];
            self.provider.read(map, self.record_offset(index + 1), &mut block)?;
            self.provider.write(map, self.record_offset(index), &block)?;
            self.repoint_block(map, &block, index + 1, index)?;
        }

        self.provider.set_len(map, (count - 1) * self.record_size)?;
        self.invalidate_all();
        Ok(())
    }

    /// Exchange two records and hand each chain to its new index
    pub fn swap<S: BackingStore>(&mut self, map: &mut ClusterMap<S>, a: u64, b: u64) -> Result<()> {
        self.check_index(a)?;
        self.check_index(b)?;
        if a == b {
            return Ok(());
        }

        let record_a = self.read_record(map, a)?;
        let record_b = self.read_record(map, b)?;
        self.provider.write(map, self.record_offset(a), &record_b)?;
        self.provider.write(map, self.record_offset(b), &record_a)?;

        let (start_a, end_a, size_a) = self.extent_of(&record_a);
        let (start_b, end_b, size_b) = self.extent_of(&record_b);
        if size_a != 0 {
            map.set_chain_owner(start_a, end_a, a, b)?;
        }
        if size_b != 0 {
            map.set_chain_owner(start_b, end_b, b, a)?;
        }

        self.invalidate(a);
        self.invalidate(b);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HeaderSettings, HEADER_SIZE};
    use crate::io::MemoryStore;

    fn setup(policy: ContainerPolicy, key_size: u16) -> (ClusterMap<MemoryStore>, DescriptorTable) {
        let mut store = MemoryStore::new();
        let header = StreamContainerHeader::create(
            &mut store,
            HeaderSettings {
                cluster_size: 16,
                policy,
                descriptor_key_size: key_size,
                reserved_streams: 0,
            },
            Endianness::Little,
        )
        .unwrap();
        let map = ClusterMap::new(store, Endianness::Little, 16, 0, true).unwrap();
        (map, DescriptorTable::new(&header, 8))
    }

    #[test]
    fn test_descriptor_encoding() {
        let descriptor = StreamDescriptor {
            traits: StreamTraits::empty(),
            start_cluster: 3,
            end_cluster: 5,
            size: 40,
            key: vec![1, 2],
        };
        let bytes = descriptor.to_bytes(Endianness::Big);
        assert_eq!(bytes.len(), 27);
        let decoded = StreamDescriptor::from_bytes(0, &bytes, Endianness::Big, 2, 8, 6).unwrap();
        assert_eq!(decoded, descriptor);

        // Terminals beyond the cluster count are corrupt
        assert!(StreamDescriptor::from_bytes(0, &bytes, Endianness::Big, 2, 8, 4)
            .unwrap_err()
            .is_corruption());

        // 40 bytes need ten 4-byte clusters
        assert!(matches!(
            StreamDescriptor::from_bytes(0, &bytes, Endianness::Big, 2, 4, 6),
            Err(ClusterError::CorruptDescriptor { index: 0, .. })
        ));
    }

    #[test]
    fn test_empty_descriptor_invariant() {
        let mut descriptor = StreamDescriptor::empty(0);
        descriptor.start_cluster = 0;
        let bytes = descriptor.to_bytes(Endianness::Little);
        assert!(matches!(
            StreamDescriptor::from_bytes(4, &bytes, Endianness::Little, 0, 8, 10),
            Err(ClusterError::CorruptDescriptor { index: 4, .. })
        ));
    }

    #[test]
    fn test_table_bootstraps_cluster_zero() {
        let (mut map, mut table) = setup(ContainerPolicy::DEFAULT, 0);
        table.insert(&mut map, 0, &StreamDescriptor::empty(0)).unwrap();
        assert_eq!(table.count(), 1);
        assert_eq!(table.provider().start(), 0);
        // 25-byte record over 16-byte clusters
        assert_eq!(map.total_clusters(), 2);
        assert_eq!(table.read(&mut map, 0).unwrap(), StreamDescriptor::empty(0));
        assert_eq!(map.store().len(), HEADER_SIZE as u64 + 2 * 33);
    }

    #[test]
    fn test_insert_and_remove_shift_records() {
        let (mut map, mut table) = setup(ContainerPolicy::DEFAULT, 0);
        for _ in 0..3 {
            let count = table.count();
            table.insert(&mut map, count, &StreamDescriptor::empty(0)).unwrap();
        }

        let mut marked = StreamDescriptor::empty(0);
        marked.traits = StreamTraits::NULL;
        table.insert(&mut map, 1, &marked).unwrap();
        assert_eq!(table.count(), 4);
        assert_eq!(table.read(&mut map, 1).unwrap().traits, StreamTraits::NULL);
        assert_eq!(table.read(&mut map, 2).unwrap().traits, StreamTraits::empty());

        table.remove(&mut map, 1).unwrap();
        assert_eq!(table.count(), 3);
        for index in 0..3 {
            assert_eq!(table.read(&mut map, index).unwrap().traits, StreamTraits::empty());
        }
    }

    #[test]
    fn test_cache_invalidated_on_patch() {
        let (mut map, mut table) = setup(ContainerPolicy::DEFAULT, 0);
        table.insert(&mut map, 0, &StreamDescriptor::empty(0)).unwrap();
        table.read(&mut map, 0).unwrap();
        assert_eq!(table.cached_len(), 1);

        map.new_chain(0, ClusterRole::Data, 1).unwrap();
        let end = map.total_clusters() - 1;
        table.patch_extent(&mut map, 0, end, end, 3).unwrap();
        assert_eq!(table.cached_len(), 0);
        assert_eq!(table.read(&mut map, 0).unwrap().size, 3);
    }

    #[test]
    fn test_cache_disabled_by_policy() {
        let (mut map, mut table) = setup(ContainerPolicy::INTEGRITY_CHECKS, 0);
        table.insert(&mut map, 0, &StreamDescriptor::empty(0)).unwrap();
        table.read(&mut map, 0).unwrap();
        assert_eq!(table.cached_len(), 0);
    }

    #[test]
    fn test_keys() {
        let policy = ContainerPolicy::DEFAULT | ContainerPolicy::TRACK_KEY;
        let (mut map, mut table) = setup(policy, 4);
        table.insert(&mut map, 0, &StreamDescriptor::empty(4)).unwrap();
        table.patch_key(&mut map, 0, b"abcd").unwrap();
        assert_eq!(table.read(&mut map, 0).unwrap().key, b"abcd".to_vec());
        assert!(matches!(
            table.patch_key(&mut map, 0, b"ab"),
            Err(ClusterError::InvalidKeySize { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_out_of_range() {
        let (mut map, mut table) = setup(ContainerPolicy::DEFAULT, 0);
        assert!(matches!(
            table.read(&mut map, 0),
            Err(ClusterError::IndexOutOfRange { index: 0, count: 0 })
        ));
        assert!(table.insert(&mut map, 1, &StreamDescriptor::empty(0)).is_err());
    }
}
