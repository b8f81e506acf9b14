//! Stream container: many logical streams over one backing store
//!
//! All state sits behind a single `parking_lot::Mutex`. Every public
//! operation locks it for the duration of one synchronous call. Open stream
//! handles are tracked by an [`AccessScope`]; conflicting opens and
//! structural changes while handles are open fail immediately.
//!
//! Cluster map changes are drained after every mutation and applied in a
//! fixed order: header counters, the descriptor table's own pointers, the
//! table's fragment provider, descriptors relocated as a side effect, the
//! descriptor of the chain that changed, and finally every other open
//! stream.

use crate::cluster::{ClusterRole, NULL_CLUSTER};
use crate::cluster_map::{ChainChange, ClusterMap, ClusterMapChangedEvent, ClusterMapListener};
use crate::config::ContainerOptions;
use crate::descriptor::{DescriptorTable, StreamDescriptor};
use crate::endian::Endianness;
use crate::error::{ClusterError, Result};
use crate::fragment::FragmentProvider;
use crate::header::{HeaderSettings, StreamContainerHeader};
use crate::io::BackingStore;
use crate::policy::ContainerPolicy;
use crate::scope::{AccessMode, AccessScope};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, info, warn};

/// Who initiated a batch of cluster map changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOrigin {
    /// The descriptor table's own provider
    DescriptorTable,
    /// The provider of an open stream handle
    Stream(u64),
    /// A provider owned by the container for the duration of one call
    Container,
}

/// Snapshot of container bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStats {
    pub stream_count: u64,
    pub reserved_streams: u64,
    pub total_clusters: u64,
    pub cluster_size: u32,
    pub backing_len: u64,
    pub open_streams: usize,
    pub cached_descriptors: usize,
}

struct ContainerState<S: BackingStore> {
    clusters: ClusterMap<S>,
    header: StreamContainerHeader,
    descriptors: DescriptorTable,
    scope: AccessScope,
    streams: BTreeMap<u64, FragmentProvider>,
}

impl<S: BackingStore> ContainerState<S> {
    fn new(store: S, header: StreamContainerHeader, cache_capacity: usize) -> Result<Self> {
        let integrity = header.policy().contains(ContainerPolicy::INTEGRITY_CHECKS);
        let clusters = ClusterMap::new(
            store,
            header.endianness(),
            header.cluster_size(),
            header.total_clusters(),
            integrity,
        )?;
        let descriptors = DescriptorTable::new(&header, cache_capacity);

        Ok(ContainerState {
            clusters,
            header,
            descriptors,
            scope: AccessScope::new(),
            streams: BTreeMap::new(),
        })
    }

    fn check_index(&self, index: u64) -> Result<()> {
        let count = self.descriptors.count();
        if index >= count {
            return Err(ClusterError::IndexOutOfRange { index, count });
        }
        Ok(())
    }

    fn check_unreserved(&self, index: u64) -> Result<()> {
        if index < self.header.reserved_streams() {
            return Err(ClusterError::ReservedStream(index));
        }
        Ok(())
    }

    fn dispatch(&mut self, origin: ChangeOrigin) -> Result<()> {
        for event in self.clusters.take_events() {
            self.apply_event(&event, origin)?;
        }
        debug_assert_eq!(
            self.header.total_clusters(),
            self.clusters.total_clusters(),
            "header cluster count out of step with the cluster map"
        );
        Ok(())
    }

    fn apply_event(&mut self, event: &ClusterMapChangedEvent, origin: ChangeOrigin) -> Result<()> {
        let total = self
            .header
            .total_clusters()
            .checked_add_signed(event.cluster_count_delta)
            .ok_or_else(|| ClusterError::CorruptHeader("total cluster count underflow".into()))?;
        self.header.set_total_clusters(self.clusters.store_mut(), total)?;

        if event.owner == NULL_CLUSTER {
            let end = if event.change == ChainChange::Removed {
                Some(NULL_CLUSTER)
            } else {
                event.chain_end
            };
            if let Some(end) = end {
                self.header.set_descriptor_table_end(self.clusters.store_mut(), end)?;
            }
        } else if let Some(end) = event
            .relocated_terminals
            .get(&NULL_CLUSTER)
            .and_then(|relocation| relocation.end)
        {
            self.header.set_descriptor_table_end(self.clusters.store_mut(), end)?;
        }

        if origin != ChangeOrigin::DescriptorTable {
            self.descriptors.provider_mut().on_cluster_map_changed(event);
        }

        for (&owner, relocation) in &event.relocated_terminals {
            if owner != NULL_CLUSTER {
                self.descriptors.patch_terminals(
                    &mut self.clusters,
                    owner,
                    relocation.start,
                    relocation.end,
                )?;
            }
        }

        if event.owner != NULL_CLUSTER {
            if event.change == ChainChange::Removed {
                self.descriptors.patch_extent(
                    &mut self.clusters,
                    event.owner,
                    NULL_CLUSTER,
                    NULL_CLUSTER,
                    0,
                )?;
            } else {
                self.descriptors.patch_terminals(
                    &mut self.clusters,
                    event.owner,
                    event.chain_start,
                    event.chain_end,
                )?;
            }
        }

        for (&index, provider) in self.streams.iter_mut() {
            if origin != ChangeOrigin::Stream(index) {
                provider.on_cluster_map_changed(event);
            }
        }

        Ok(())
    }

    fn sync_stream_count(&mut self) -> Result<()> {
        let count = self.descriptors.count();
        self.header.set_stream_count(self.clusters.store_mut(), count)
    }

    fn insert_descriptor(&mut self, index: u64) -> Result<()> {
        let descriptor = StreamDescriptor::empty(self.descriptors.key_size());
        let inserted = self.descriptors.insert(&mut self.clusters, index, &descriptor);
        self.dispatch(ChangeOrigin::DescriptorTable)?;
        inserted?;
        self.sync_stream_count()
    }

    fn create_reserved(&mut self) -> Result<()> {
        for index in 0..self.header.reserved_streams() {
            self.insert_descriptor(index)?;
        }
        Ok(())
    }

    /// Release every data cluster of stream `index`
    fn release_chain(&mut self, index: u64) -> Result<()> {
        let descriptor = self.descriptors.read(&mut self.clusters, index)?;
        if descriptor.is_empty() {
            return Ok(());
        }

        let mut provider = FragmentProvider::new(
            index,
            ClusterRole::Data,
            descriptor.start_cluster,
            descriptor.end_cluster,
            descriptor.size,
            self.header.cluster_size(),
        );
        let released = provider.set_len(&mut self.clusters, 0);
        self.dispatch(ChangeOrigin::Container)?;
        released
    }

    fn open_stream(&mut self, index: u64, mode: AccessMode) -> Result<()> {
        self.check_index(index)?;
        self.scope.enter(index, mode)?;

        let descriptor = match self.descriptors.read(&mut self.clusters, index) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.scope.exit(index);
                return Err(err);
            }
        };

        let provider = FragmentProvider::new(
            index,
            ClusterRole::Data,
            descriptor.start_cluster,
            descriptor.end_cluster,
            descriptor.size,
            self.header.cluster_size(),
        );
        self.streams.insert(index, provider);
        debug!("Opened stream {} ({:?}, {} bytes)", index, mode, descriptor.size);
        Ok(())
    }

    fn close_stream(&mut self, index: u64) {
        self.scope.exit(index);
        self.streams.remove(&index);
        debug!("Closed stream {}", index);
    }

    fn provider(&mut self, index: u64) -> Result<&mut FragmentProvider> {
        self.streams
            .get_mut(&index)
            .ok_or_else(|| ClusterError::InvalidArgument(format!("stream {} is not open", index)))
    }

    fn stream_len(&mut self, index: u64) -> Result<u64> {
        Ok(self.provider(index)?.len())
    }

    fn read_stream(&mut self, index: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let provider = self
            .streams
            .get_mut(&index)
            .ok_or_else(|| ClusterError::InvalidArgument(format!("stream {} is not open", index)))?;
        provider.read(&mut self.clusters, offset, buf)
    }

    /// Run a mutating provider operation, then propagate its cluster map
    /// changes and persist the stream's extent
    fn mutate_stream<R>(
        &mut self,
        index: u64,
        op: impl FnOnce(&mut FragmentProvider, &mut ClusterMap<S>) -> Result<R>,
    ) -> Result<R> {
        if self.scope.mode(index) != Some(AccessMode::Write) {
            return Err(ClusterError::ReadOnly(index));
        }

        let provider = self
            .streams
            .get_mut(&index)
            .ok_or_else(|| ClusterError::InvalidArgument(format!("stream {} is not open", index)))?;
        let outcome = op(provider, &mut self.clusters);

        let propagated = self
            .dispatch(ChangeOrigin::Stream(index))
            .and_then(|_| self.sync_descriptor(index));
        let value = outcome?;
        propagated?;
        Ok(value)
    }

    fn sync_descriptor(&mut self, index: u64) -> Result<()> {
        let provider = self.provider(index)?;
        let (start, end, len) = (provider.start(), provider.end(), provider.len());
        self.descriptors
            .patch_extent(&mut self.clusters, index, start, end, len)
    }

    fn verify(&mut self) -> Result<()> {
        let cached = self.header.clone();
        self.header.reload(self.clusters.store_mut())?;
        if self.header != cached {
            return Err(ClusterError::CorruptHeader(
                "stored header differs from the in-memory copy".into(),
            ));
        }

        let total = self.clusters.total_clusters();
        if self.header.total_clusters() != total {
            return Err(ClusterError::CorruptHeader(format!(
                "header records {} clusters, map holds {}",
                self.header.total_clusters(),
                total
            )));
        }

        let count = self.descriptors.count();
        if self.header.stream_count() != count {
            return Err(ClusterError::CorruptHeader(format!(
                "header records {} streams, table holds {}",
                self.header.stream_count(),
                count
            )));
        }

        let cluster_size = self.header.cluster_size() as u64;
        let mut claimed = HashSet::new();

        let table_clusters = (count * self.header.descriptor_record_size() as u64).div_ceil(cluster_size);
        let table_start = if count == 0 { NULL_CLUSTER } else { 0 };
        let table_end = self.header.descriptor_table_end();
        self.verify_chain(
            NULL_CLUSTER,
            ClusterRole::Descriptor,
            table_start,
            table_end,
            table_clusters,
            &mut claimed,
        )?;

        for index in 0..count {
            let descriptor = self.descriptors.read_uncached(&mut self.clusters, index)?;
            self.verify_chain(
                index,
                ClusterRole::Data,
                descriptor.start_cluster,
                descriptor.end_cluster,
                descriptor.size.div_ceil(cluster_size),
                &mut claimed,
            )?;
        }

        if claimed.len() as u64 != total {
            return Err(ClusterError::CorruptHeader(format!(
                "{} of {} clusters are reachable from a chain",
                claimed.len(),
                total
            )));
        }

        Ok(())
    }

    fn verify_chain(
        &mut self,
        owner: u64,
        role: ClusterRole,
        start: u64,
        end: u64,
        count: u64,
        claimed: &mut HashSet<u64>,
    ) -> Result<()> {
        let forward = self.clusters.walk_chain(owner, role, start, count)?;
        if count == 0 {
            if end != NULL_CLUSTER {
                return Err(ClusterError::corrupt_chain(
                    owner,
                    format!("empty chain ends at cluster {}", end),
                ));
            }
            return Ok(());
        }

        let backward = self.clusters.walk_chain_backward(owner, role, end, count)?;
        if forward != backward {
            return Err(ClusterError::corrupt_chain(
                owner,
                "forward and backward walks disagree",
            ));
        }

        for cluster in forward {
            if !claimed.insert(cluster) {
                return Err(ClusterError::corrupt_cluster(
                    cluster,
                    "claimed by more than one chain",
                ));
            }
        }
        Ok(())
    }
}

/// A container of independently growable logical streams
pub struct StreamContainer<S: BackingStore> {
    state: Mutex<ContainerState<S>>,
}

impl<S: BackingStore> StreamContainer<S> {
    /// Initialize a new container in an empty store
    pub fn create(mut store: S, options: &ContainerOptions) -> Result<Self> {
        options.validate()?;
        let header = StreamContainerHeader::create(&mut store, options.settings(), options.endianness)?;
        let mut state = ContainerState::new(store, header, options.descriptor_cache_capacity)?;
        state.create_reserved()?;

        info!(
            "Created stream container: cluster size {}, {} reserved stream(s)",
            options.cluster_size, options.reserved_streams
        );
        Ok(StreamContainer {
            state: Mutex::new(state),
        })
    }

    /// Load an existing container. Settings stored in the header win over
    /// `options`; differences are logged.
    pub fn load(mut store: S, options: &ContainerOptions) -> Result<Self> {
        let header = StreamContainerHeader::load(&mut store, options.endianness)?;
        if header.settings() != options.settings() {
            warn!(
                "Container settings {:?} differ from requested {:?}; using stored settings",
                header.settings(),
                options.settings()
            );
        }

        let state = ContainerState::new(store, header, options.descriptor_cache_capacity)?;
        info!(
            "Opened stream container: {} stream(s), {} cluster(s)",
            state.header.stream_count(),
            state.header.total_clusters()
        );
        Ok(StreamContainer {
            state: Mutex::new(state),
        })
    }

    /// Open a container without prior knowledge of its settings, reading
    /// them from the header's fixed offsets
    pub fn open_existing(mut store: S, endianness: Endianness) -> Result<Self> {
        let settings = HeaderSettings::peek(&mut store, endianness)?;
        debug!("Peeked container settings {:?}", settings);
        Self::load(store, &ContainerOptions::from_settings(settings, endianness))
    }

    /// Create when the store is empty, otherwise open
    pub fn load_or_create(store: S, options: &ContainerOptions) -> Result<Self> {
        if store.is_empty() {
            Self::create(store, options)
        } else {
            Self::load(store, options)
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState<S>> {
        self.state.lock()
    }

    /// Append a new empty stream and open it for writing
    pub fn add(&self) -> Result<ClusteredStream<'_, S>> {
        let mut state = self.lock();
        state.scope.require_idle()?;

        let index = state.descriptors.count();
        state.insert_descriptor(index)?;
        state.open_stream(index, AccessMode::Write)?;
        debug!("Added stream {}", index);

        Ok(ClusteredStream::new(self, index, AccessMode::Write))
    }

    /// Insert a new empty stream at `index`, shifting later streams up,
    /// and open it for writing
    pub fn insert(&self, index: u64) -> Result<ClusteredStream<'_, S>> {
        let mut state = self.lock();
        state.scope.require_idle()?;
        state.check_unreserved(index)?;
        let count = state.descriptors.count();
        if index > count {
            return Err(ClusterError::IndexOutOfRange { index, count });
        }

        state.insert_descriptor(index)?;
        state.open_stream(index, AccessMode::Write)?;
        debug!("Inserted stream {} ({} streams)", index, count + 1);

        Ok(ClusteredStream::new(self, index, AccessMode::Write))
    }

    pub fn open(&self, index: u64, mode: AccessMode) -> Result<ClusteredStream<'_, S>> {
        self.lock().open_stream(index, mode)?;
        Ok(ClusteredStream::new(self, index, mode))
    }

    pub fn open_read(&self, index: u64) -> Result<ClusteredStream<'_, S>> {
        self.open(index, AccessMode::Read)
    }

    pub fn open_write(&self, index: u64) -> Result<ClusteredStream<'_, S>> {
        self.open(index, AccessMode::Write)
    }

    /// Delete stream `index` and its data, shifting later streams down
    pub fn remove(&self, index: u64) -> Result<()> {
        let mut state = self.lock();
        state.scope.require_idle()?;
        state.check_index(index)?;
        state.check_unreserved(index)?;

        state.release_chain(index)?;
        let state = &mut *state;
        let removed = state.descriptors.remove(&mut state.clusters, index);
        state.dispatch(ChangeOrigin::DescriptorTable)?;
        removed?;
        state.sync_stream_count()?;

        debug!("Removed stream {} ({} remain)", index, state.descriptors.count());
        Ok(())
    }

    /// Exchange the streams at `a` and `b` without moving their data
    pub fn swap(&self, a: u64, b: u64) -> Result<()> {
        let mut state = self.lock();
        state.scope.require_idle()?;
        state.check_index(a)?;
        state.check_index(b)?;
        if a == b {
            return Ok(());
        }
        state.check_unreserved(a)?;
        state.check_unreserved(b)?;

        let state = &mut *state;
        state.descriptors.swap(&mut state.clusters, a, b)?;
        debug!("Swapped streams {} and {}", a, b);
        Ok(())
    }

    /// Truncate stream `index` to zero length, releasing its clusters
    pub fn clear_stream(&self, index: u64) -> Result<()> {
        let mut state = self.lock();
        state.scope.require_idle()?;
        state.check_index(index)?;
        state.release_chain(index)?;
        debug!("Cleared stream {}", index);
        Ok(())
    }

    /// Drop every stream and cluster, then recreate the reserved streams
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        state.scope.require_idle()?;

        let state = &mut *state;
        let removed = state.clusters.clear_clusters()?;
        let store = state.clusters.store_mut();
        state.header.set_total_clusters(store, 0)?;
        state.header.set_stream_count(store, 0)?;
        state.header.set_descriptor_table_end(store, NULL_CLUSTER)?;
        state.header.set_merkle_root(store, [0u8; 32])?;
        state.descriptors.reset();
        state.create_reserved()?;

        debug!("Cleared container ({} clusters released)", removed);
        Ok(())
    }

    pub fn stream_count(&self) -> u64 {
        self.lock().descriptors.count()
    }

    pub fn descriptor(&self, index: u64) -> Result<StreamDescriptor> {
        let mut state = self.lock();
        let state = &mut *state;
        state.descriptors.read(&mut state.clusters, index)
    }

    pub fn descriptor_key(&self, index: u64) -> Result<Vec<u8>> {
        let mut state = self.lock();
        if !state.header.policy().contains(ContainerPolicy::TRACK_KEY) {
            return Err(ClusterError::KeyTrackingDisabled);
        }
        let state = &mut *state;
        Ok(state.descriptors.read(&mut state.clusters, index)?.key)
    }

    pub fn set_descriptor_key(&self, index: u64, key: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if !state.header.policy().contains(ContainerPolicy::TRACK_KEY) {
            return Err(ClusterError::KeyTrackingDisabled);
        }
        let state = &mut *state;
        state.descriptors.patch_key(&mut state.clusters, index, key)
    }

    pub fn merkle_root(&self) -> [u8; 32] {
        self.lock().header.merkle_root()
    }

    pub fn set_merkle_root(&self, root: [u8; 32]) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        state.header.set_merkle_root(state.clusters.store_mut(), root)
    }

    pub fn master_key(&self) -> [u8; 32] {
        self.lock().header.master_key()
    }

    /// Cluster defragmentation is not implemented
    pub fn optimize(&self) -> Result<()> {
        Err(ClusterError::Unsupported("cluster defragmentation"))
    }

    /// Full scan of every chain against the header and descriptors
    pub fn verify(&self) -> Result<()> {
        self.lock().verify()
    }

    pub fn stats(&self) -> ContainerStats {
        let state = self.lock();
        ContainerStats {
            stream_count: state.descriptors.count(),
            reserved_streams: state.header.reserved_streams(),
            total_clusters: state.clusters.total_clusters(),
            cluster_size: state.header.cluster_size(),
            backing_len: state.clusters.store().len(),
            open_streams: state.scope.open_count(),
            cached_descriptors: state.descriptors.cached_len(),
        }
    }

    pub fn header(&self) -> StreamContainerHeader {
        self.lock().header.clone()
    }

    /// Make all writes durable in the backing store
    pub fn flush(&self) -> Result<()> {
        self.lock().clusters.store_mut().sync()
    }

    pub fn into_store(self) -> S {
        self.state.into_inner().clusters.into_store()
    }
}

/// Handle to one open stream. Closing (dropping) it releases the scope.
pub struct ClusteredStream<'a, S: BackingStore> {
    container: &'a StreamContainer<S>,
    index: u64,
    mode: AccessMode,
    position: u64,
}

impl<'a, S: BackingStore> std::fmt::Debug for ClusteredStream<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredStream")
            .field("index", &self.index)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<'a, S: BackingStore> ClusteredStream<'a, S> {
    fn new(container: &'a StreamContainer<S>, index: u64, mode: AccessMode) -> Self {
        ClusteredStream {
            container,
            index,
            mode,
            position: 0,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn len(&self) -> Result<u64> {
        self.container.lock().stream_len(self.index)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Cursor used by the `Read`/`Write`/`Seek` impls
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.container.lock().read_stream(self.index, offset, buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.container
            .lock()
            .mutate_stream(self.index, |provider, map| provider.write(map, offset, data))
    }

    /// Write at the current end; returns the offset written at
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        self.container.lock().mutate_stream(self.index, |provider, map| {
            let offset = provider.len();
            provider.write(map, offset, data)?;
            Ok(offset)
        })
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.container
            .lock()
            .mutate_stream(self.index, |provider, map| provider.set_len(map, len))
    }

    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut state = self.container.lock();
        let len = state.stream_len(self.index)?;
        let len = usize::try_from(len).map_err(|_| {
            ClusterError::InvalidArgument(format!("stream of {} bytes does not fit in memory", len))
        })?;
        let mut buf = vec![0u8; len];
        let read = state.read_stream(self.index, 0, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Release the handle; same as dropping it
    pub fn close(self) {}
}

impl<S: BackingStore> Drop for ClusteredStream<'_, S> {
    fn drop(&mut self) {
        self.container.lock().close_stream(self.index);
    }
}

impl<S: BackingStore> Read for ClusteredStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.read_at(self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<S: BackingStore> Write for ClusteredStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.container.flush()?)
    }
}

impl<S: BackingStore> Seek for ClusteredStream<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(offset) => {
                self.position = offset;
                return Ok(offset);
            }
            SeekFrom::End(offset) => (self.len()?, offset),
            SeekFrom::Current(offset) => (self.position, offset),
        };

        self.position = base.checked_add_signed(offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        Ok(self.position)
    }
}
