//! Fragment provider: a contiguous byte range laid over a cluster chain
//!
//! Logical offset `o` lives in fragment `o / cluster_size` at byte
//! `o % cluster_size`. The fragment-to-cluster table is built lazily by
//! walking the chain once and then kept in step with allocations and with
//! relocations reported by the cluster map.

use crate::cluster::{ClusterRole, NULL_CLUSTER};
use crate::cluster_map::{ChainChange, ClusterMap, ClusterMapChangedEvent, ClusterMapListener};
use crate::error::{ClusterError, Result};
use crate::io::BackingStore;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FragmentProvider {
    owner: u64,
    role: ClusterRole,
    start: u64,
    end: u64,
    length: u64,
    cluster_size: u64,
    chain: Option<Vec<u64>>,
}

impl FragmentProvider {
    pub fn new(
        owner: u64,
        role: ClusterRole,
        start: u64,
        end: u64,
        length: u64,
        cluster_size: u32,
    ) -> Self {
        FragmentProvider {
            owner,
            role,
            start,
            end,
            length,
            cluster_size: cluster_size as u64,
            chain: None,
        }
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Clusters needed to hold the current length
    pub fn cluster_count(&self) -> u64 {
        self.length.div_ceil(self.cluster_size)
    }

    /// Forget the chain entirely (used after the whole cluster map is cleared)
    pub fn reset(&mut self) {
        self.start = NULL_CLUSTER;
        self.end = NULL_CLUSTER;
        self.length = 0;
        self.chain = Some(Vec::new());
    }

    /// Fragment-to-cluster table, walking the chain on first use
    pub fn chain<'a, S: BackingStore>(&'a mut self, map: &mut ClusterMap<S>) -> Result<&'a [u64]> {
        let chain = match self.chain.take() {
            Some(chain) => chain,
            None => {
                let walked = map.walk_chain(self.owner, self.role, self.start, self.cluster_count())?;
                if let Some(&last) = walked.last() {
                    if last != self.end {
                        return Err(ClusterError::corrupt_chain(
                            self.owner,
                            format!("chain ends at {} but {} is recorded", last, self.end),
                        ));
                    }
                }
                walked
            }
        };
        let chain: &'a [u64] = self.chain.insert(chain);
        Ok(chain)
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the number read
    pub fn read<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= self.length || buf.is_empty() {
            return Ok(0);
        }

        let available = (self.length - offset).min(buf.len() as u64) as usize;
        let cluster_size = self.cluster_size;
        let chain = self.chain(map)?;

        let mut done = 0;
        while done < available {
            let position = offset + done as u64;
            let fragment = (position / cluster_size) as usize;
            let within = (position % cluster_size) as usize;
            let span = (cluster_size as usize - within).min(available - done);
            map.read_data(chain[fragment], within, &mut buf[done..done + span])?;
            done += span;
        }

        Ok(done)
    }

    /// Write `data` at `offset`, growing the range (zero-filled) as needed
    pub fn write<S: BackingStore>(
        &mut self,
        map: &mut ClusterMap<S>,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            ClusterError::InvalidArgument(format!(
                "write of {} bytes at offset {} overflows",
                data.len(),
                offset
            ))
        })?;
        if end > self.length {
            self.set_len(map, end)?;
        }

        let cluster_size = self.cluster_size;
        let chain = self.chain(map)?;

        let mut done = 0;
        while done < data.len() {
            let position = offset + done as u64;
            let fragment = (position / cluster_size) as usize;
            let within = (position % cluster_size) as usize;
            let span = (cluster_size as usize - within).min(data.len() - done);
            map.write_data(chain[fragment], within, &data[done..done + span])?;
            done += span;
        }

        Ok(())
    }

    /// Grow or shrink the range, allocating or releasing clusters
    pub fn set_len<S: BackingStore>(&mut self, map: &mut ClusterMap<S>, length: u64) -> Result<()> {
        if length == self.length {
            return Ok(());
        }

        let owner = self.owner;
        let current = self.cluster_count();
        let wanted = length.div_ceil(self.cluster_size);

        if length > self.length {
            // Bytes past the old length in its last cluster may be stale
            let within = (self.length % self.cluster_size) as usize;
            if within != 0 {
                let cluster_size = self.cluster_size as usize;
                let last = *self
                    .chain(map)?
                    .last()
                    .ok_or_else(|| ClusterError::corrupt_chain(owner, "missing last cluster"))?;
                map.write_data(last, within, &vec![0u8; cluster_size - within])?;
            }

            if wanted > current {
                self.grow(map, wanted - current)?;
            }
        } else if wanted < current {
            let event = {
                let chain = self.chain(map)?;
                map.truncate_chain(owner, chain, wanted as usize)?
            };
            if let Some(chain) = self.chain.as_mut() {
                chain.truncate(wanted as usize);
            }
            self.apply(&event);
        }

        self.length = length;
        Ok(())
    }

    fn grow<S: BackingStore>(&mut self, map: &mut ClusterMap<S>, count: u64) -> Result<()> {
        let event = if self.start == NULL_CLUSTER {
            self.chain = Some(Vec::new());
            map.new_chain(self.owner, self.role, count)?
        } else {
            // Load the table first so the appended clusters extend it
            self.chain(map)?;
            map.extend_chain(self.owner, self.role, self.end, count)?
        };

        if let (Some(chain), Some(last)) = (self.chain.as_mut(), event.chain_end) {
            chain.extend(last + 1 - count..=last);
        }
        self.apply(&event);
        Ok(())
    }

    fn apply(&mut self, event: &ClusterMapChangedEvent) {
        if event.change == ChainChange::Removed {
            self.start = NULL_CLUSTER;
            self.end = NULL_CLUSTER;
            self.chain = Some(Vec::new());
        } else {
            if let Some(start) = event.chain_start {
                self.start = start;
            }
            if let Some(end) = event.chain_end {
                self.end = end;
            }
        }
        self.apply_relocations(event);
    }

    fn apply_relocations(&mut self, event: &ClusterMapChangedEvent) {
        if let Some(relocation) = event.relocated_terminals.get(&self.owner) {
            if let Some(start) = relocation.start {
                self.start = start;
            }
            if let Some(end) = relocation.end {
                self.end = end;
            }
        }

        if event.moved_clusters.is_empty() {
            return;
        }
        if let Some(chain) = self.chain.as_mut() {
            let moved: HashMap<u64, u64> = event.moved_clusters.iter().copied().collect();
            for cluster in chain.iter_mut() {
                if let Some(&to) = moved.get(cluster) {
                    *cluster = to;
                }
            }
        }
    }
}

impl ClusterMapListener for FragmentProvider {
    fn on_cluster_map_changed(&mut self, event: &ClusterMapChangedEvent) {
        if event.owner == self.owner {
            // Our chain was changed through another path; re-walk on next use
            self.apply(event);
            self.chain = None;
        } else {
            self.apply_relocations(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::Endianness;
    use crate::header::HEADER_SIZE;
    use crate::io::MemoryStore;

    fn map(cluster_size: u32) -> ClusterMap<MemoryStore> {
        let store = MemoryStore::from_bytes(vec![0u8; HEADER_SIZE]);
        ClusterMap::new(store, Endianness::Little, cluster_size, 0, true).unwrap()
    }

    fn provider(owner: u64, cluster_size: u32) -> FragmentProvider {
        FragmentProvider::new(
            owner,
            ClusterRole::Data,
            NULL_CLUSTER,
            NULL_CLUSTER,
            0,
            cluster_size,
        )
    }

    #[test]
    fn test_write_offset_overflow() {
        let mut map = map(4);
        let mut p = provider(0, 4);
        p.write(&mut map, 0, b"abcd").unwrap();

        assert!(matches!(
            p.write(&mut map, u64::MAX - 1, b"abcd"),
            Err(ClusterError::InvalidArgument(_))
        ));
        // Fits in u64 but not in an addressable store
        assert!(matches!(
            p.set_len(&mut map, u64::MAX - 1),
            Err(ClusterError::InvalidArgument(_))
        ));

        assert_eq!(p.len(), 4);
        assert_eq!(p.cluster_count(), 1);
        assert_eq!(map.total_clusters(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(p.read(&mut map, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_write_spans_clusters() {
        let mut map = map(4);
        let mut p = provider(0, 4);

        p.write(&mut map, 0, b"hello world").unwrap();
        assert_eq!(p.len(), 11);
        assert_eq!(p.cluster_count(), 3);
        assert_eq!(map.total_clusters(), 3);

        let mut buf = vec![0u8; 11];
        assert_eq!(p.read(&mut map, 0, &mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");

        let mut partial = [0u8; 5];
        assert_eq!(p.read(&mut map, 3, &mut partial).unwrap(), 5);
        assert_eq!(&partial, b"lo wo");
    }

    #[test]
    fn test_read_past_end() {
        let mut map = map(4);
        let mut p = provider(0, 4);
        p.write(&mut map, 0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(p.read(&mut map, 1, &mut buf).unwrap(), 2);
        assert_eq!(p.read(&mut map, 3, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_with_gap_zero_fills() {
        let mut map = map(4);
        let mut p = provider(0, 4);
        p.write(&mut map, 6, b"xy").unwrap();
        assert_eq!(p.len(), 8);

        let mut buf = [0xFFu8; 8];
        p.read(&mut map, 0, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, 0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn test_shrink_then_grow_clears_stale_bytes() {
        let mut map = map(8);
        let mut p = provider(0, 8);
        p.write(&mut map, 0, b"abcdefgh").unwrap();
        p.set_len(&mut map, 3).unwrap();
        p.set_len(&mut map, 8).unwrap();

        let mut buf = [0u8; 8];
        p.read(&mut map, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc\0\0\0\0\0");
    }

    #[test]
    fn test_set_len_zero_releases_chain() {
        let mut map = map(5);
        let mut p = provider(0, 5);
        p.write(&mut map, 0, &[7u8; 25]).unwrap();
        assert_eq!(map.total_clusters(), 5);

        p.set_len(&mut map, 0).unwrap();
        assert_eq!(p.start(), NULL_CLUSTER);
        assert_eq!(p.end(), NULL_CLUSTER);
        assert_eq!(map.total_clusters(), 0);
    }

    #[test]
    fn test_listener_follows_relocation() {
        let mut map = map(2);
        let mut a = provider(0, 2);
        let mut b = provider(1, 2);
        a.write(&mut map, 0, b"aaaa").unwrap();
        b.write(&mut map, 0, b"bbbb").unwrap();
        a.write(&mut map, 4, b"AA").unwrap();
        map.take_events();

        // Load b's table before a's shrink moves one of its clusters
        let mut buf = [0u8; 4];
        b.read(&mut map, 0, &mut buf).unwrap();

        a.set_len(&mut map, 2).unwrap();
        for event in map.take_events() {
            b.on_cluster_map_changed(&event);
        }

        b.read(&mut map, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"bbbb");

        let mut a_buf = [0u8; 2];
        a.read(&mut map, 0, &mut a_buf).unwrap();
        assert_eq!(&a_buf, b"aa");
        assert_eq!(map.total_clusters(), 3);
    }

    #[test]
    fn test_corrupt_link_detected_on_access() {
        let mut map = map(1);
        let mut p = provider(0, 1);
        p.write(&mut map, 0, b"abc").unwrap();
        map.write_next(1, 9999).unwrap();

        let mut fresh = FragmentProvider::new(0, ClusterRole::Data, p.start(), p.end(), 3, 1);
        let err = fresh.write(&mut map, 3, b"d").unwrap_err();
        assert!(err.is_corruption());
    }
}
