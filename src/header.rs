//! Container header (offset 0, fixed 256 bytes)
//!
//! ```text
//! Offset  Field                     Size
//! 0       version                   1
//! 1       policy                    4
//! 5       stream count              8
//! 13      descriptor table end      8
//! 21      descriptor key size       2
//! 23      reserved streams          8
//! 31      cluster size              4
//! 35      total clusters            8
//! 43      merkle root               32
//! 75      master key                32
//! 107     padding                   149
//! ```
//!
//! The in-memory copy is a cache over the backing store. Every setter writes
//! the changed field through to the store straight away and does nothing when
//! the value is unchanged.

use crate::cluster::NULL_CLUSTER;
use crate::descriptor::StreamDescriptor;
use crate::endian::Endianness;
use crate::error::{ClusterError, Result};
use crate::io::BackingStore;
use crate::policy::ContainerPolicy;

pub const HEADER_SIZE: usize = 256;
pub const VERSION: u8 = 1;

pub const VERSION_OFFSET: usize = 0;
pub const POLICY_OFFSET: usize = 1;
pub const STREAM_COUNT_OFFSET: usize = 5;
pub const DESCRIPTOR_TABLE_END_OFFSET: usize = 13;
pub const DESCRIPTOR_KEY_SIZE_OFFSET: usize = 21;
pub const RESERVED_STREAMS_OFFSET: usize = 23;
pub const CLUSTER_SIZE_OFFSET: usize = 31;
pub const TOTAL_CLUSTERS_OFFSET: usize = 35;
pub const MERKLE_ROOT_OFFSET: usize = 43;
pub const MASTER_KEY_OFFSET: usize = 75;
pub const PADDING_OFFSET: usize = 107;

/// Settings fixed when a container is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSettings {
    pub cluster_size: u32,
    pub policy: ContainerPolicy,
    pub descriptor_key_size: u16,
    pub reserved_streams: u64,
}

impl HeaderSettings {
    /// Read the creation settings straight from their fixed offsets, without
    /// validating the rest of the header
    pub fn peek<S: BackingStore + ?Sized>(store: &mut S, endianness: Endianness) -> Result<Self> {
        if store.len() < HEADER_SIZE as u64 {
            return Err(ClusterError::Truncated {
                expected: HEADER_SIZE as u64,
                actual: store.len(),
            });
        }

        let mut bytes = [0u8; HEADER_SIZE];
        store.read_at(0, &mut bytes)?;

        let policy_bits = endianness.read_u32(&bytes[POLICY_OFFSET..]);
        let policy = ContainerPolicy::from_bits(policy_bits).ok_or_else(|| {
            ClusterError::CorruptHeader(format!("unknown policy bits {:#x}", policy_bits))
        })?;

        Ok(HeaderSettings {
            cluster_size: endianness.read_u32(&bytes[CLUSTER_SIZE_OFFSET..]),
            policy,
            descriptor_key_size: endianness.read_u16(&bytes[DESCRIPTOR_KEY_SIZE_OFFSET..]),
            reserved_streams: endianness.read_u64(&bytes[RESERVED_STREAMS_OFFSET..]),
        })
    }
}

/// Sequential field writer used by [`StreamContainerHeader::create`]
struct FieldWriter {
    bytes: [u8; HEADER_SIZE],
    cursor: usize,
    endianness: Endianness,
}

impl FieldWriter {
    fn new(endianness: Endianness) -> Self {
        FieldWriter {
            bytes: [0u8; HEADER_SIZE],
            cursor: 0,
            endianness,
        }
    }

    fn expect(&self, offset: usize) {
        assert_eq!(self.cursor, offset, "header field written at wrong offset");
    }

    fn put_u8(&mut self, value: u8) {
        self.bytes[self.cursor] = value;
        self.cursor += 1;
    }

    fn put_u16(&mut self, value: u16) {
        self.endianness
            .write_u16(&mut self.bytes[self.cursor..self.cursor + 2], value);
        self.cursor += 2;
    }

    fn put_u32(&mut self, value: u32) {
        self.endianness
            .write_u32(&mut self.bytes[self.cursor..self.cursor + 4], value);
        self.cursor += 4;
    }

    fn put_u64(&mut self, value: u64) {
        self.endianness
            .write_u64(&mut self.bytes[self.cursor..self.cursor + 8], value);
        self.cursor += 8;
    }

    fn put_bytes(&mut self, value: &[u8]) {
        self.bytes[self.cursor..self.cursor + value.len()].copy_from_slice(value);
        self.cursor += value.len();
    }
}

/// Cached, write-through view of the container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamContainerHeader {
    endianness: Endianness,
    version: u8,
    policy: ContainerPolicy,
    stream_count: u64,
    descriptor_table_end: u64,
    descriptor_key_size: u16,
    reserved_streams: u64,
    cluster_size: u32,
    total_clusters: u64,
    merkle_root: [u8; 32],
    master_key: [u8; 32],
}

impl StreamContainerHeader {
    /// Write a fresh header into an empty store
    pub fn create<S: BackingStore + ?Sized>(
        store: &mut S,
        settings: HeaderSettings,
        endianness: Endianness,
    ) -> Result<Self> {
        if !store.is_empty() {
            return Err(ClusterError::InvalidArgument(format!(
                "cannot create a header over {} existing bytes",
                store.len()
            )));
        }

        let header = StreamContainerHeader {
            endianness,
            version: VERSION,
            policy: settings.policy,
            stream_count: 0,
            descriptor_table_end: NULL_CLUSTER,
            descriptor_key_size: settings.descriptor_key_size,
            reserved_streams: settings.reserved_streams,
            cluster_size: settings.cluster_size,
            total_clusters: 0,
            merkle_root: [0u8; 32],
            master_key: [0u8; 32],
        };
        header.check_integrity()?;

        let mut writer = FieldWriter::new(endianness);
        writer.expect(VERSION_OFFSET);
        writer.put_u8(header.version);
        writer.expect(POLICY_OFFSET);
        writer.put_u32(header.policy.bits());
        writer.expect(STREAM_COUNT_OFFSET);
        writer.put_u64(header.stream_count);
        writer.expect(DESCRIPTOR_TABLE_END_OFFSET);
        writer.put_u64(header.descriptor_table_end);
        writer.expect(DESCRIPTOR_KEY_SIZE_OFFSET);
        writer.put_u16(header.descriptor_key_size);
        writer.expect(RESERVED_STREAMS_OFFSET);
        writer.put_u64(header.reserved_streams);
        writer.expect(CLUSTER_SIZE_OFFSET);
        writer.put_u32(header.cluster_size);
        writer.expect(TOTAL_CLUSTERS_OFFSET);
        writer.put_u64(header.total_clusters);
        writer.expect(MERKLE_ROOT_OFFSET);
        writer.put_bytes(&header.merkle_root);
        writer.expect(MASTER_KEY_OFFSET);
        writer.put_bytes(&header.master_key);
        writer.expect(PADDING_OFFSET);

        store.write_at(0, &writer.bytes)?;
        tracing::debug!(
            "Created container header: cluster size {}, policy {:?}",
            header.cluster_size,
            header.policy
        );

        Ok(header)
    }

    /// Load and integrity-check an existing header
    pub fn load<S: BackingStore + ?Sized>(store: &mut S, endianness: Endianness) -> Result<Self> {
        let settings = HeaderSettings::peek(store, endianness)?;

        let mut bytes = [0u8; HEADER_SIZE];
        store.read_at(0, &mut bytes)?;

        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&bytes[MERKLE_ROOT_OFFSET..MERKLE_ROOT_OFFSET + 32]);
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&bytes[MASTER_KEY_OFFSET..MASTER_KEY_OFFSET + 32]);

        let header = StreamContainerHeader {
            endianness,
            version: bytes[VERSION_OFFSET],
            policy: settings.policy,
            stream_count: endianness.read_u64(&bytes[STREAM_COUNT_OFFSET..]),
            descriptor_table_end: endianness.read_u64(&bytes[DESCRIPTOR_TABLE_END_OFFSET..]),
            descriptor_key_size: settings.descriptor_key_size,
            reserved_streams: settings.reserved_streams,
            cluster_size: settings.cluster_size,
            total_clusters: endianness.read_u64(&bytes[TOTAL_CLUSTERS_OFFSET..]),
            merkle_root,
            master_key,
        };
        header.check_integrity()?;

        Ok(header)
    }

    /// Re-read every field from the store, discarding the cache
    pub fn reload<S: BackingStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        *self = Self::load(store, self.endianness)?;
        Ok(())
    }

    /// Validate field ranges and cross-field consistency
    pub fn check_integrity(&self) -> Result<()> {
        if self.version != VERSION {
            return Err(ClusterError::UnsupportedVersion(self.version));
        }

        if self.cluster_size == 0 {
            return Err(ClusterError::CorruptHeader(
                "cluster size must be positive".into(),
            ));
        }

        // Counts are signed 64-bit quantities on disk
        if self.total_clusters > i64::MAX as u64 {
            return Err(ClusterError::CorruptHeader(format!(
                "negative total cluster count {}",
                self.total_clusters as i64
            )));
        }
        if self.stream_count > i64::MAX as u64 {
            return Err(ClusterError::CorruptHeader(format!(
                "negative stream count {}",
                self.stream_count as i64
            )));
        }
        if self.reserved_streams > i64::MAX as u64 {
            return Err(ClusterError::CorruptHeader(format!(
                "negative reserved stream count {}",
                self.reserved_streams as i64
            )));
        }

        if self.descriptor_table_end != NULL_CLUSTER
            && self.descriptor_table_end >= self.total_clusters
        {
            return Err(ClusterError::CorruptHeader(format!(
                "descriptor table end {} outside {} clusters",
                self.descriptor_table_end, self.total_clusters
            )));
        }

        if (self.stream_count == 0) != (self.descriptor_table_end == NULL_CLUSTER) {
            return Err(ClusterError::CorruptHeader(format!(
                "stream count {} disagrees with descriptor table end {:#x}",
                self.stream_count, self.descriptor_table_end
            )));
        }

        let table_bytes = self
            .stream_count
            .checked_mul(self.descriptor_record_size() as u64)
            .ok_or_else(|| ClusterError::CorruptHeader("stream count overflows".into()))?;
        let table_clusters = table_bytes.div_ceil(self.cluster_size as u64);
        if table_clusters > self.total_clusters {
            return Err(ClusterError::CorruptHeader(format!(
                "{} streams need {} descriptor clusters but only {} exist",
                self.stream_count, table_clusters, self.total_clusters
            )));
        }

        if self.policy.contains(ContainerPolicy::TRACK_KEY) && self.descriptor_key_size == 0 {
            return Err(ClusterError::CorruptHeader(
                "key tracking requires a positive descriptor key size".into(),
            ));
        }

        Ok(())
    }

    fn write_field<S: BackingStore + ?Sized>(
        &self,
        store: &mut S,
        offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        store.write_at(offset as u64, bytes)
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn policy(&self) -> ContainerPolicy {
        self.policy
    }

    pub fn stream_count(&self) -> u64 {
        self.stream_count
    }

    /// End cluster of the descriptor table chain (its start is always cluster 0)
    pub fn descriptor_table_end(&self) -> u64 {
        self.descriptor_table_end
    }

    pub fn descriptor_key_size(&self) -> u16 {
        self.descriptor_key_size
    }

    /// Size of one descriptor record under this header's policy
    pub fn descriptor_record_size(&self) -> usize {
        StreamDescriptor::record_size(self.key_size())
    }

    /// Key bytes per descriptor, zero unless keys are tracked
    pub fn key_size(&self) -> usize {
        if self.policy.contains(ContainerPolicy::TRACK_KEY) {
            self.descriptor_key_size as usize
        } else {
            0
        }
    }

    pub fn reserved_streams(&self) -> u64 {
        self.reserved_streams
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    pub fn merkle_root(&self) -> [u8; 32] {
        self.merkle_root
    }

    pub fn master_key(&self) -> [u8; 32] {
        self.master_key
    }

    pub fn settings(&self) -> HeaderSettings {
        HeaderSettings {
            cluster_size: self.cluster_size,
            policy: self.policy,
            descriptor_key_size: self.descriptor_key_size,
            reserved_streams: self.reserved_streams,
        }
    }

    pub fn set_stream_count<S: BackingStore + ?Sized>(
        &mut self,
        store: &mut S,
        value: u64,
    ) -> Result<()> {
        if self.stream_count == value {
            return Ok(());
        }
        self.write_field(store, STREAM_COUNT_OFFSET, &self.endianness.u64_bytes(value))?;
        self.stream_count = value;
        Ok(())
    }

    pub fn set_descriptor_table_end<S: BackingStore + ?Sized>(
        &mut self,
        store: &mut S,
        value: u64,
    ) -> Result<()> {
        if self.descriptor_table_end == value {
            return Ok(());
        }
        self.write_field(
            store,
            DESCRIPTOR_TABLE_END_OFFSET,
            &self.endianness.u64_bytes(value),
        )?;
        self.descriptor_table_end = value;
        Ok(())
    }

    pub fn set_total_clusters<S: BackingStore + ?Sized>(
        &mut self,
        store: &mut S,
        value: u64,
    ) -> Result<()> {
        if self.total_clusters == value {
            return Ok(());
        }
        self.write_field(store, TOTAL_CLUSTERS_OFFSET, &self.endianness.u64_bytes(value))?;
        self.total_clusters = value;
        Ok(())
    }

    pub fn set_merkle_root<S: BackingStore + ?Sized>(
        &mut self,
        store: &mut S,
        value: [u8; 32],
    ) -> Result<()> {
        if self.merkle_root == value {
            return Ok(());
        }
        self.write_field(store, MERKLE_ROOT_OFFSET, &value)?;
        self.merkle_root = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;

    fn settings() -> HeaderSettings {
        HeaderSettings {
            cluster_size: 64,
            policy: ContainerPolicy::DEFAULT,
            descriptor_key_size: 0,
            reserved_streams: 2,
        }
    }

    #[test]
    fn test_header_create_layout() {
        let mut store = MemoryStore::new();
        let header = StreamContainerHeader::create(&mut store, settings(), Endianness::Little).unwrap();

        assert_eq!(store.len(), HEADER_SIZE as u64);
        let bytes = store.as_bytes();
        assert_eq!(bytes[VERSION_OFFSET], VERSION);
        assert_eq!(
            &bytes[DESCRIPTOR_TABLE_END_OFFSET..DESCRIPTOR_TABLE_END_OFFSET + 8],
            &[0xFF; 8]
        );
        assert_eq!(
            &bytes[CLUSTER_SIZE_OFFSET..CLUSTER_SIZE_OFFSET + 4],
            &64u32.to_le_bytes()
        );
        assert!(bytes[PADDING_OFFSET..].iter().all(|&b| b == 0));
        assert_eq!(header.descriptor_table_end(), NULL_CLUSTER);
    }

    #[test]
    fn test_header_big_endian_layout() {
        let mut store = MemoryStore::new();
        StreamContainerHeader::create(&mut store, settings(), Endianness::Big).unwrap();
        let bytes = store.as_bytes();
        assert_eq!(
            &bytes[CLUSTER_SIZE_OFFSET..CLUSTER_SIZE_OFFSET + 4],
            &64u32.to_be_bytes()
        );
        assert_eq!(
            &bytes[RESERVED_STREAMS_OFFSET..RESERVED_STREAMS_OFFSET + 8],
            &2u64.to_be_bytes()
        );
    }

    #[test]
    fn test_setters_write_through() {
        let mut store = MemoryStore::new();
        let mut header = StreamContainerHeader::create(&mut store, settings(), Endianness::Little).unwrap();

        header.set_total_clusters(&mut store, 3).unwrap();
        header.set_stream_count(&mut store, 1).unwrap();
        header.set_descriptor_table_end(&mut store, 0).unwrap();
        header.set_merkle_root(&mut store, [7u8; 32]).unwrap();

        let loaded = StreamContainerHeader::load(&mut store, Endianness::Little).unwrap();
        assert_eq!(loaded.total_clusters(), 3);
        assert_eq!(loaded.stream_count(), 1);
        assert_eq!(loaded.descriptor_table_end(), 0);
        assert_eq!(loaded.merkle_root(), [7u8; 32]);
    }

    #[test]
    fn test_setter_skips_unchanged_value() {
        let mut store = MemoryStore::new();
        let mut header = StreamContainerHeader::create(&mut store, settings(), Endianness::Little).unwrap();

        // Scribble over the field; an unchanged set must not rewrite it
        store.as_bytes_mut()[TOTAL_CLUSTERS_OFFSET] = 0xAA;
        header.set_total_clusters(&mut store, 0).unwrap();
        assert_eq!(store.as_bytes()[TOTAL_CLUSTERS_OFFSET], 0xAA);
    }

    #[test]
    fn test_peek_settings() {
        let mut store = MemoryStore::new();
        StreamContainerHeader::create(&mut store, settings(), Endianness::Big).unwrap();
        let peeked = HeaderSettings::peek(&mut store, Endianness::Big).unwrap();
        assert_eq!(peeked, settings());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut store = MemoryStore::new();
        StreamContainerHeader::create(&mut store, settings(), Endianness::Little).unwrap();
        store.as_bytes_mut()[VERSION_OFFSET] = 9;
        assert!(matches!(
            StreamContainerHeader::load(&mut store, Endianness::Little),
            Err(ClusterError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_zero_cluster_size_rejected() {
        let mut store = MemoryStore::new();
        let mut bad = settings();
        bad.cluster_size = 0;
        assert!(matches!(
            StreamContainerHeader::create(&mut store, bad, Endianness::Little),
            Err(ClusterError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_negative_count_rejected() {
        let mut store = MemoryStore::new();
        StreamContainerHeader::create(&mut store, settings(), Endianness::Little).unwrap();
        store.as_bytes_mut()[STREAM_COUNT_OFFSET..STREAM_COUNT_OFFSET + 8]
            .copy_from_slice(&(-1i64).to_le_bytes());
        assert!(matches!(
            StreamContainerHeader::load(&mut store, Endianness::Little),
            Err(ClusterError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_stream_count_without_clusters_rejected() {
        let mut store = MemoryStore::new();
        StreamContainerHeader::create(&mut store, settings(), Endianness::Little).unwrap();
        store.as_bytes_mut()[STREAM_COUNT_OFFSET..STREAM_COUNT_OFFSET + 8]
            .copy_from_slice(&5u64.to_le_bytes());
        store.as_bytes_mut()[DESCRIPTOR_TABLE_END_OFFSET..DESCRIPTOR_TABLE_END_OFFSET + 8]
            .copy_from_slice(&0u64.to_le_bytes());
        assert!(StreamContainerHeader::load(&mut store, Endianness::Little).is_err());
    }

    #[test]
    fn test_key_tracking_requires_key_size() {
        let mut store = MemoryStore::new();
        let mut bad = settings();
        bad.policy |= ContainerPolicy::TRACK_KEY;
        assert!(StreamContainerHeader::create(&mut store, bad, Endianness::Little).is_err());
    }

    #[test]
    fn test_truncated_header() {
        let mut store = MemoryStore::from_bytes(vec![VERSION; 100]);
        assert!(matches!(
            StreamContainerHeader::load(&mut store, Endianness::Little),
            Err(ClusterError::Truncated { .. })
        ));
    }
}
