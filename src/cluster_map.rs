//! Cluster map: chains of fixed-size clusters over the backing store
//!
//! Clusters are only ever appended to, or cut from, the end of the cluster
//! array. Shrinking a chain that sits in the middle of the array therefore
//! moves whichever live cluster occupies the tail into each freed slot before
//! truncating. Every structural change is recorded as a
//! [`ClusterMapChangedEvent`] describing the primary chain change plus every
//! side-effect relocation, so owners of other chains can repair their
//! terminal pointers and cached cluster lists.

use crate::cluster::{
    record_size, ClusterHeader, ClusterRole, ClusterTraits, CLUSTER_HEADER_SIZE, DATA_OFFSET,
    NEXT_OFFSET, NULL_CLUSTER, PREV_OFFSET, TRAITS_OFFSET,
};
use crate::endian::Endianness;
use crate::error::{ClusterError, Result};
use crate::header::HEADER_SIZE;
use crate::io::BackingStore;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Largest backing store the map will grow to (signed file offsets)
const MAX_STORE_LEN: u64 = i64::MAX as u64;

/// Upper bound on the buffer used to write freshly appended clusters
const APPEND_BATCH_BYTES: u64 = 1 << 20;

/// What happened to the primary chain of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainChange {
    /// A chain came into existence
    Created,
    /// The whole chain was released
    Removed,
    /// The chain grew or shrank
    Resized,
}

/// New terminal positions of a chain moved as a side effect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalRelocation {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

/// One structural change of the cluster map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMapChangedEvent {
    /// Net change of the total cluster count
    pub cluster_count_delta: i64,
    /// Owner of the chain that changed: a descriptor index, or
    /// [`NULL_CLUSTER`] for the descriptor table
    pub owner: u64,
    pub change: ChainChange,
    /// New start cluster of the primary chain, when it changed
    pub chain_start: Option<u64>,
    /// New end cluster of the primary chain, when it changed
    pub chain_end: Option<u64>,
    /// Other chains whose start or end cluster was relocated, keyed by owner
    pub relocated_terminals: BTreeMap<u64, TerminalRelocation>,
    /// Every cluster moved from the tail into a freed slot, as (from, to), in order
    pub moved_clusters: Vec<(u64, u64)>,
}

/// Receives cluster map changes made through someone else
pub trait ClusterMapListener {
    fn on_cluster_map_changed(&mut self, event: &ClusterMapChangedEvent);
}

/// Fixed-size cluster array stored after the container header
pub struct ClusterMap<S: BackingStore> {
    store: S,
    endianness: Endianness,
    cluster_size: u32,
    record_size: u64,
    total: u64,
    integrity_checks: bool,
    pending: Vec<ClusterMapChangedEvent>,
}

impl<S: BackingStore> ClusterMap<S> {
    /// Wrap a store already holding a header and `total` cluster records
    pub fn new(
        store: S,
        endianness: Endianness,
        cluster_size: u32,
        total: u64,
        integrity_checks: bool,
    ) -> Result<Self> {
        let map = ClusterMap {
            store,
            endianness,
            cluster_size,
            record_size: record_size(cluster_size),
            total,
            integrity_checks,
            pending: Vec::new(),
        };

        let expected = map.offset(total);
        if map.store.len() < expected {
            return Err(ClusterError::Truncated {
                expected,
                actual: map.store.len(),
            });
        }

        Ok(map)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Payload bytes per cluster
    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn total_clusters(&self) -> u64 {
        self.total
    }

    pub fn integrity_checks(&self) -> bool {
        self.integrity_checks
    }

    /// Drain the changes recorded since the last call
    pub fn take_events(&mut self) -> Vec<ClusterMapChangedEvent> {
        std::mem::take(&mut self.pending)
    }

    fn offset(&self, cluster: u64) -> u64 {
        HEADER_SIZE as u64 + cluster * self.record_size
    }

    fn check_index(&self, cluster: u64) -> Result<()> {
        if cluster >= self.total {
            return Err(ClusterError::corrupt_cluster(
                cluster,
                format!("index outside {} clusters", self.total),
            ));
        }
        Ok(())
    }

    pub fn read_header(&mut self, cluster: u64) -> Result<ClusterHeader> {
        self.check_index(cluster)?;
        let mut bytes = [0u8; CLUSTER_HEADER_SIZE];
        self.store.read_at(self.offset(cluster), &mut bytes)?;
        ClusterHeader::from_bytes(cluster, &bytes, self.endianness)
    }

    /// Overwrite the traits/prev/next prefix of a cluster
    pub fn update_cluster(&mut self, cluster: u64, header: &ClusterHeader) -> Result<()> {
        self.check_index(cluster)?;
        let bytes = header.to_bytes(self.endianness);
        self.store.write_at(self.offset(cluster), &bytes)
    }

    pub fn write_traits(&mut self, cluster: u64, traits: ClusterTraits) -> Result<()> {
        self.check_index(cluster)?;
        self.store
            .write_at(self.offset(cluster) + TRAITS_OFFSET as u64, &[traits.bits()])
    }

    pub fn write_prev(&mut self, cluster: u64, prev: u64) -> Result<()> {
        self.check_index(cluster)?;
        let bytes = self.endianness.u64_bytes(prev);
        self.store
            .write_at(self.offset(cluster) + PREV_OFFSET as u64, &bytes)
    }

    pub fn write_next(&mut self, cluster: u64, next: u64) -> Result<()> {
        self.check_index(cluster)?;
        let bytes = self.endianness.u64_bytes(next);
        self.store
            .write_at(self.offset(cluster) + NEXT_OFFSET as u64, &bytes)
    }

    fn check_data_range(&self, cluster: u64, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.cluster_size as usize {
            return Err(ClusterError::InvalidArgument(format!(
                "range {}..{} exceeds cluster {} data size {}",
                offset,
                offset + len,
                cluster,
                self.cluster_size
            )));
        }
        Ok(())
    }

    pub fn read_data(&mut self, cluster: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_index(cluster)?;
        self.check_data_range(cluster, offset, buf.len())?;
        let at = self.offset(cluster) + (DATA_OFFSET + offset) as u64;
        self.store.read_at(at, buf)
    }

    pub fn write_data(&mut self, cluster: u64, offset: usize, data: &[u8]) -> Result<()> {
        self.check_index(cluster)?;
        self.check_data_range(cluster, offset, data.len())?;
        let at = self.offset(cluster) + (DATA_OFFSET + offset) as u64;
        self.store.write_at(at, data)
    }

    /// Cut `count` clusters off the end of the array
    pub fn remove_end_clusters(&mut self, count: u64) -> Result<()> {
        if count > self.total {
            return Err(ClusterError::InvalidArgument(format!(
                "cannot remove {} of {} clusters",
                count, self.total
            )));
        }
        self.total -= count;
        let len = self.offset(self.total);
        self.store.set_len(len)
    }

    /// Drop every cluster. Returns how many were removed; records no event.
    pub fn clear_clusters(&mut self) -> Result<u64> {
        let removed = self.total;
        self.remove_end_clusters(removed)?;
        self.pending.clear();
        Ok(removed)
    }

    /// Append `count` zeroed, linked clusters and return (first, last)
    fn append_linked(
        &mut self,
        owner: u64,
        role: ClusterRole,
        count: u64,
        attach_to: Option<u64>,
    ) -> Result<(u64, u64)> {
        let first = self.total;
        count
            .checked_mul(self.record_size)
            .and_then(|bytes| self.offset(first).checked_add(bytes))
            .filter(|&end| end <= MAX_STORE_LEN)
            .ok_or_else(|| {
                ClusterError::InvalidArgument(format!(
                    "{} more clusters exceed the addressable store",
                    count
                ))
            })?;
        let last = first + count - 1;

        let per_batch = (APPEND_BATCH_BYTES / self.record_size).max(1);
        let mut batch_first = first;
        while batch_first <= last {
            let batch_last = (batch_first + per_batch - 1).min(last);
            let mut buf = vec![0u8; ((batch_last - batch_first + 1) * self.record_size) as usize];

            for cluster in batch_first..=batch_last {
                let mut traits = role.traits();
                let prev = if cluster == first {
                    match attach_to {
                        Some(prev) => prev,
                        None => {
                            traits |= ClusterTraits::START;
                            owner
                        }
                    }
                } else {
                    cluster - 1
                };
                let next = if cluster == last {
                    traits |= ClusterTraits::END;
                    owner
                } else {
                    cluster + 1
                };

                let header = ClusterHeader { traits, prev, next };
                let at = ((cluster - batch_first) * self.record_size) as usize;
                buf[at..at + CLUSTER_HEADER_SIZE]
                    .copy_from_slice(&header.to_bytes(self.endianness));
            }

            self.store.write_at(self.offset(batch_first), &buf)?;
            batch_first = batch_last + 1;
        }
        self.total += count;
        trace!(
            "Appended clusters {}..={} for owner {:#x}",
            first,
            last,
            owner
        );

        Ok((first, last))
    }

    /// Allocate a brand new chain of `count` clusters for `owner`
    pub fn new_chain(
        &mut self,
        owner: u64,
        role: ClusterRole,
        count: u64,
    ) -> Result<ClusterMapChangedEvent> {
        if count == 0 {
            return Err(ClusterError::InvalidArgument(
                "a chain needs at least one cluster".into(),
            ));
        }

        let (first, last) = self.append_linked(owner, role, count, None)?;
        let event = ClusterMapChangedEvent {
            cluster_count_delta: count as i64,
            owner,
            change: ChainChange::Created,
            chain_start: Some(first),
            chain_end: Some(last),
            relocated_terminals: BTreeMap::new(),
            moved_clusters: Vec::new(),
        };
        self.pending.push(event.clone());
        Ok(event)
    }

    /// Append `count` clusters after the chain ending at `end`
    pub fn extend_chain(
        &mut self,
        owner: u64,
        role: ClusterRole,
        end: u64,
        count: u64,
    ) -> Result<ClusterMapChangedEvent> {
        if count == 0 {
            return Err(ClusterError::InvalidArgument(
                "cannot extend a chain by zero clusters".into(),
            ));
        }

        let mut end_header = self.read_header(end)?;
        if !end_header.is_end() || end_header.next != owner {
            return Err(ClusterError::corrupt_chain(
                owner,
                format!(
                    "cluster {} is not the end of this chain (next {:#x})",
                    end, end_header.next
                ),
            ));
        }
        if end_header.traits.role() != role {
            return Err(ClusterError::corrupt_cluster(end, "chain role mismatch"));
        }

        let (first, last) = self.append_linked(owner, role, count, Some(end))?;
        end_header.traits.remove(ClusterTraits::END);
        end_header.next = first;
        self.update_cluster(end, &end_header)?;

        let event = ClusterMapChangedEvent {
            cluster_count_delta: count as i64,
            owner,
            change: ChainChange::Resized,
            chain_start: None,
            chain_end: Some(last),
            relocated_terminals: BTreeMap::new(),
            moved_clusters: Vec::new(),
        };
        self.pending.push(event.clone());
        Ok(event)
    }

    /// Keep the first `keep` clusters of `chain` and release the rest.
    /// `keep == 0` removes the chain entirely.
    pub fn truncate_chain(
        &mut self,
        owner: u64,
        chain: &[u64],
        keep: usize,
    ) -> Result<ClusterMapChangedEvent> {
        if keep >= chain.len() {
            return Err(ClusterError::InvalidArgument(format!(
                "cannot keep {} of {} clusters",
                keep,
                chain.len()
            )));
        }

        let released: BTreeSet<u64> = chain[keep..].iter().copied().collect();
        if released.len() != chain.len() - keep {
            return Err(ClusterError::corrupt_chain(owner, "chain visits a cluster twice"));
        }

        if keep > 0 {
            let new_end = chain[keep - 1];
            let mut header = self.read_header(new_end)?;
            header.traits.insert(ClusterTraits::END);
            header.next = owner;
            self.update_cluster(new_end, &header)?;
        }

        let delta = released.len() as i64;
        let (mut relocated_terminals, moved_clusters) = self.compact(released)?;
        let own = relocated_terminals.remove(&owner).unwrap_or_default();

        let event = if keep == 0 {
            ClusterMapChangedEvent {
                cluster_count_delta: -delta,
                owner,
                change: ChainChange::Removed,
                chain_start: Some(NULL_CLUSTER),
                chain_end: Some(NULL_CLUSTER),
                relocated_terminals,
                moved_clusters,
            }
        } else {
            ClusterMapChangedEvent {
                cluster_count_delta: -delta,
                owner,
                change: ChainChange::Resized,
                chain_start: own.start,
                chain_end: Some(own.end.unwrap_or(chain[keep - 1])),
                relocated_terminals,
                moved_clusters,
            }
        };
        self.pending.push(event.clone());
        Ok(event)
    }

    /// Release `released` clusters, filling interior holes from the tail
    fn compact(
        &mut self,
        mut released: BTreeSet<u64>,
    ) -> Result<(BTreeMap<u64, TerminalRelocation>, Vec<(u64, u64)>)> {
        if let Some(&highest) = released.last() {
            self.check_index(highest)?;
        }

        let mut relocations: BTreeMap<u64, TerminalRelocation> = BTreeMap::new();
        let mut moved = Vec::new();
        let mut live = self.total;

        while let Some(&highest) = released.last() {
            let tail = live - 1;
            if highest == tail {
                released.pop_last();
            } else if let Some(gap) = released.pop_first() {
                self.relocate(tail, gap, live, &mut relocations)?;
                moved.push((tail, gap));
            }
            live -= 1;
        }

        let removed = self.total - live;
        self.remove_end_clusters(removed)?;
        Ok((relocations, moved))
    }

    /// Move the record at `from` into `to` and repair everything pointing at it
    fn relocate(
        &mut self,
        from: u64,
        to: u64,
        live: u64,
        relocations: &mut BTreeMap<u64, TerminalRelocation>,
    ) -> Result<()> {
        let mut record = vec![0u8; self.record_size as usize];
        self.store.read_at(self.offset(from), &mut record)?;
        let header = ClusterHeader::from_bytes(from, &record, self.endianness)?;
        self.store.write_at(self.offset(to), &record)?;

        if header.is_start() {
            relocations.entry(header.prev).or_default().start = Some(to);
        } else {
            self.check_link(from, header.prev, live)?;
            self.write_next(header.prev, to)?;
        }

        if header.is_end() {
            relocations.entry(header.next).or_default().end = Some(to);
        } else {
            self.check_link(from, header.next, live)?;
            self.write_prev(header.next, to)?;
        }

        trace!("Relocated cluster {} -> {}", from, to);
        Ok(())
    }

    fn check_link(&self, cluster: u64, link: u64, live: u64) -> Result<()> {
        if link >= live || link == cluster {
            return Err(ClusterError::corrupt_cluster(
                cluster,
                format!("link to cluster {} outside {} live clusters", link, live),
            ));
        }
        Ok(())
    }

    /// Hand the chain `start..=end` from `old_owner` to `new_owner` by
    /// rewriting its terminal backlinks
    pub fn set_chain_owner(
        &mut self,
        start: u64,
        end: u64,
        old_owner: u64,
        new_owner: u64,
    ) -> Result<()> {
        let start_header = self.read_header(start)?;
        let end_header = self.read_header(end)?;
        if !start_header.is_start() || !end_header.is_end() {
            return Err(ClusterError::corrupt_chain(
                old_owner,
                format!("clusters {}/{} are not chain terminals", start, end),
            ));
        }
        if self.integrity_checks && (start_header.prev != old_owner || end_header.next != old_owner) {
            return Err(ClusterError::corrupt_chain(
                old_owner,
                format!(
                    "terminal backlinks {:#x}/{:#x} do not name this owner",
                    start_header.prev, end_header.next
                ),
            ));
        }

        self.write_prev(start, new_owner)?;
        self.write_next(end, new_owner)
    }

    /// Walk `count` clusters forward from `start`, validating every link
    pub fn walk_chain(
        &mut self,
        owner: u64,
        role: ClusterRole,
        start: u64,
        count: u64,
    ) -> Result<Vec<u64>> {
        if count == 0 {
            if start != NULL_CLUSTER {
                return Err(ClusterError::corrupt_chain(
                    owner,
                    format!("empty chain starts at cluster {}", start),
                ));
            }
            return Ok(Vec::new());
        }
        if count > self.total {
            return Err(ClusterError::corrupt_chain(
                owner,
                format!("chain of {} clusters exceeds {} total", count, self.total),
            ));
        }

        let mut chain = Vec::with_capacity(count as usize);
        let mut previous = owner;
        let mut current = start;

        for step in 0..count {
            if current >= self.total {
                return Err(ClusterError::corrupt_chain(
                    owner,
                    format!(
                        "link to cluster {} outside {} clusters",
                        current, self.total
                    ),
                ));
            }

            let header = self.read_header(current)?;
            if header.traits.role() != role {
                return Err(ClusterError::corrupt_cluster(current, "chain role mismatch"));
            }
            if header.is_start() != (step == 0) {
                return Err(ClusterError::corrupt_chain(
                    owner,
                    format!("unexpected start marker at cluster {}", current),
                ));
            }
            if self.integrity_checks && header.prev != previous {
                return Err(ClusterError::corrupt_chain(
                    owner,
                    format!(
                        "cluster {} links back to {:#x}, expected {:#x}",
                        current, header.prev, previous
                    ),
                ));
            }

            chain.push(current);

            if step + 1 == count {
                if !header.is_end() {
                    return Err(ClusterError::corrupt_chain(
                        owner,
                        format!("chain continues past cluster {}", current),
                    ));
                }
                if self.integrity_checks && header.next != owner {
                    return Err(ClusterError::corrupt_chain(
                        owner,
                        format!("end cluster {} names owner {:#x}", current, header.next),
                    ));
                }
            } else {
                if header.is_end() {
                    return Err(ClusterError::corrupt_chain(
                        owner,
                        format!("chain ends early at cluster {}", current),
                    ));
                }
                if header.next == current {
                    return Err(ClusterError::corrupt_cluster(current, "cluster links to itself"));
                }
                previous = current;
                current = header.next;
            }
        }

        Ok(chain)
    }

    /// Walk `count` clusters backward from `end`; returns them in chain order
    pub fn walk_chain_backward(
        &mut self,
        owner: u64,
        role: ClusterRole,
        end: u64,
        count: u64,
    ) -> Result<Vec<u64>> {
        if count > self.total {
            return Err(ClusterError::corrupt_chain(
                owner,
                format!("chain of {} clusters exceeds {} total", count, self.total),
            ));
        }

        let mut chain = Vec::with_capacity(count as usize);
        let mut current = end;

        for step in 0..count {
            if current >= self.total {
                return Err(ClusterError::corrupt_chain(
                    owner,
                    format!(
                        "link to cluster {} outside {} clusters",
                        current, self.total
                    ),
                ));
            }

            let header = self.read_header(current)?;
            if header.traits.role() != role || header.is_end() != (step == 0) {
                return Err(ClusterError::corrupt_chain(
                    owner,
                    format!("unexpected traits at cluster {}", current),
                ));
            }

            chain.push(current);

            if step + 1 == count {
                if !header.is_start() || header.prev != owner {
                    return Err(ClusterError::corrupt_chain(
                        owner,
                        format!("backward walk does not end at a start of this chain ({})", current),
                    ));
                }
            } else {
                if header.is_start() || header.prev == current {
                    return Err(ClusterError::corrupt_chain(
                        owner,
                        format!("chain starts early at cluster {}", current),
                    ));
                }
                current = header.prev;
            }
        }

        chain.reverse();
        Ok(chain)
    }
}
