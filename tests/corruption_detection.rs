//! Corruption detection tests
//!
//! Bytes are poked directly into container images; the damage must surface
//! as a corrupt-data error on load, on access of the affected chain, or from
//! a full `verify` scan.

use cartridge_streams::{
    ClusterError, Endianness, FileStore, MemoryStore, StreamContainer, StreamContainerBuilder,
    HEADER_SIZE,
};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

const VERSION_OFFSET: usize = 0;
const STREAM_COUNT_OFFSET: usize = 5;
const TOTAL_CLUSTERS_OFFSET: usize = 35;

/// Image with one stream per payload, cluster size `cluster_size`
fn image(cluster_size: u32, integrity: bool, payloads: &[&[u8]]) -> MemoryStore {
    let container = StreamContainerBuilder::new()
        .cluster_size(cluster_size)
        .integrity_checks(integrity)
        .create(MemoryStore::new())
        .unwrap();
    for payload in payloads {
        container.add().unwrap().append(payload).unwrap();
    }
    container.into_store()
}

fn reopen(store: MemoryStore) -> cartridge_streams::Result<StreamContainer<MemoryStore>> {
    StreamContainer::open_existing(store, Endianness::Little)
}

/// Byte offset of a cluster record's field
fn cluster_field(cluster_size: u32, cluster: u64, field: usize) -> usize {
    HEADER_SIZE + cluster as usize * (17 + cluster_size as usize) + field
}

fn write_u64(store: &mut MemoryStore, offset: usize, value: u64) {
    store.as_bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[test]
fn test_unsupported_version() {
    let mut store = image(16, true, &[b"data"]);
    store.as_bytes_mut()[VERSION_OFFSET] = 2;
    assert!(matches!(reopen(store), Err(ClusterError::UnsupportedVersion(2))));
}

#[test]
fn test_truncated_cluster_array() {
    let store = image(16, true, &[b"data"]);
    let mut bytes = store.into_bytes();
    bytes.truncate(bytes.len() - 5);
    assert!(matches!(
        reopen(MemoryStore::from_bytes(bytes)),
        Err(ClusterError::Truncated { .. })
    ));
}

#[test]
fn test_stream_count_exceeding_clusters() {
    let mut store = image(16, true, &[b"data"]);
    write_u64(&mut store, STREAM_COUNT_OFFSET, 1000);
    assert!(matches!(reopen(store), Err(ClusterError::CorruptHeader(_))));
}

#[test]
fn test_broken_backlink_with_integrity_checks() {
    // Descriptor table: clusters 0..=6, stream data: 7, 8, 9
    let mut store = image(4, true, &[b"abcdefghijkl"]);
    write_u64(&mut store, cluster_field(4, 8, 1), 3);

    let container = reopen(store).unwrap();
    let err = container.open_read(0).unwrap().read_to_vec().unwrap_err();
    assert!(err.is_corruption(), "unexpected {err:?}");
}

#[test]
fn test_broken_backlink_without_integrity_checks() {
    let mut store = image(4, false, &[b"abcdefghijkl"]);
    write_u64(&mut store, cluster_field(4, 8, 1), 3);

    // Forward reads never look at prev
    let container = reopen(store).unwrap();
    assert_eq!(
        container.open_read(0).unwrap().read_to_vec().unwrap(),
        b"abcdefghijkl"
    );

    // The backward walk of a full scan still catches it
    assert!(container.verify().unwrap_err().is_corruption());
}

#[test]
fn test_illegal_cluster_traits() {
    let mut store = image(4, true, &[b"abcdefghijkl"]);
    store.as_bytes_mut()[cluster_field(4, 8, 0)] = 0xFF;

    let container = reopen(store).unwrap();
    let err = container.open_read(0).unwrap().read_to_vec().unwrap_err();
    assert!(matches!(err, ClusterError::CorruptCluster { cluster: 8, .. }));
}

#[test]
fn test_empty_descriptor_with_clusters() {
    let mut store = image(32, true, &[b""]);
    // Descriptor 0 start cluster: first data byte of cluster 0, plus 1
    write_u64(&mut store, cluster_field(32, 0, 17 + 1), 0);

    let container = reopen(store).unwrap();
    assert!(matches!(
        container.open_read(0),
        Err(ClusterError::CorruptDescriptor { index: 0, .. })
    ));
}

#[test]
fn test_descriptor_size_beyond_clusters() {
    // Descriptor table: cluster 0, stream data: cluster 1
    for size in [u64::MAX, 100] {
        let mut store = image(32, true, &[b"data"]);
        write_u64(&mut store, cluster_field(32, 0, 17 + 17), size);

        let container = reopen(store).unwrap();
        assert!(matches!(
            container.open_read(0),
            Err(ClusterError::CorruptDescriptor { index: 0, .. })
        ));
        assert!(container.verify().unwrap_err().is_corruption());
    }
}

#[test]
fn test_verify_detects_orphan_cluster() {
    let store = image(8, true, &[b"one", b"two"]);
    let mut bytes = store.into_bytes();
    let total = u64::from_le_bytes(
        bytes[TOTAL_CLUSTERS_OFFSET..TOTAL_CLUSTERS_OFFSET + 8]
            .try_into()
            .unwrap(),
    );

    // An extra, unowned cluster record
    bytes.extend_from_slice(&[0u8; 17 + 8]);
    bytes[TOTAL_CLUSTERS_OFFSET..TOTAL_CLUSTERS_OFFSET + 8].copy_from_slice(&(total + 1).to_le_bytes());

    let container = reopen(MemoryStore::from_bytes(bytes)).unwrap();
    assert_eq!(container.open_read(1).unwrap().read_to_vec().unwrap(), b"two");
    assert!(matches!(container.verify(), Err(ClusterError::CorruptHeader(_))));
}

#[test]
fn test_file_corruption_detected_on_append() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();

    let container = StreamContainerBuilder::new()
        .cluster_size(1)
        .create_file(&path)
        .unwrap();
    container.add().unwrap().append(b"xyz").unwrap();
    let first = container.descriptor(0).unwrap().start_cluster;
    container.flush().unwrap();
    drop(container);

    {
        let mut raw = OpenOptions::new().write(true).open(&path).unwrap();
        raw.seek(SeekFrom::Start(cluster_field(1, first, 9) as u64))
            .unwrap();
        raw.write_all(&9999u64.to_le_bytes()).unwrap();
        raw.flush().unwrap();
    }

    let container =
        StreamContainer::open_existing(FileStore::open(&path).unwrap(), Endianness::Little).unwrap();
    let err = container.open_write(0).unwrap().append(b"!").unwrap_err();
    assert!(err.is_corruption(), "unexpected {err:?}");
}
