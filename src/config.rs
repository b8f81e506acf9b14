//! Container options and builder

use crate::container::StreamContainer;
use crate::endian::Endianness;
use crate::error::{ClusterError, Result};
use crate::header::HeaderSettings;
use crate::io::{BackingStore, FileStore};
use crate::policy::ContainerPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default payload bytes per cluster
pub const DEFAULT_CLUSTER_SIZE: u32 = 4096;

/// Default number of decoded descriptors kept in memory
pub const DEFAULT_DESCRIPTOR_CACHE_CAPACITY: usize = 256;

/// Settings for creating or opening a container.
///
/// Only `cluster_size`, `policy`, `descriptor_key_size` and
/// `reserved_streams` are persisted; `endianness` must match between writer
/// and reader, and `descriptor_cache_capacity` is a per-process choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    pub cluster_size: u32,
    pub policy: ContainerPolicy,
    pub descriptor_key_size: u16,
    pub reserved_streams: u64,
    pub endianness: Endianness,
    pub descriptor_cache_capacity: usize,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        ContainerOptions {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            policy: ContainerPolicy::DEFAULT,
            descriptor_key_size: 0,
            reserved_streams: 0,
            endianness: Endianness::Little,
            descriptor_cache_capacity: DEFAULT_DESCRIPTOR_CACHE_CAPACITY,
        }
    }
}

impl ContainerOptions {
    /// Parse options from TOML; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: ContainerOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_settings(settings: HeaderSettings, endianness: Endianness) -> Self {
        ContainerOptions {
            cluster_size: settings.cluster_size,
            policy: settings.policy,
            descriptor_key_size: settings.descriptor_key_size,
            reserved_streams: settings.reserved_streams,
            endianness,
            ..ContainerOptions::default()
        }
    }

    /// The persisted subset
    pub fn settings(&self) -> HeaderSettings {
        HeaderSettings {
            cluster_size: self.cluster_size,
            policy: self.policy,
            descriptor_key_size: self.descriptor_key_size,
            reserved_streams: self.reserved_streams,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_size == 0 {
            return Err(ClusterError::InvalidArgument(
                "cluster size must be positive".into(),
            ));
        }
        if self.policy.contains(ContainerPolicy::TRACK_KEY) && self.descriptor_key_size == 0 {
            return Err(ClusterError::InvalidArgument(
                "key tracking requires a positive descriptor key size".into(),
            ));
        }
        if self.reserved_streams > i64::MAX as u64 {
            return Err(ClusterError::InvalidArgument(format!(
                "too many reserved streams: {}",
                self.reserved_streams
            )));
        }
        Ok(())
    }
}

/// Fluent construction of a [`StreamContainer`]
#[derive(Debug, Clone, Default)]
pub struct StreamContainerBuilder {
    options: ContainerOptions,
}

impl StreamContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing options, e.g. loaded with [`ContainerOptions::from_toml_str`]
    pub fn with_options(options: ContainerOptions) -> Self {
        StreamContainerBuilder { options }
    }

    pub fn cluster_size(mut self, cluster_size: u32) -> Self {
        self.options.cluster_size = cluster_size;
        self
    }

    pub fn policy(mut self, policy: ContainerPolicy) -> Self {
        self.options.policy = policy;
        self
    }

    /// Enable key tracking with `key_size`-byte keys
    pub fn track_keys(mut self, key_size: u16) -> Self {
        self.options.policy |= ContainerPolicy::TRACK_KEY;
        self.options.descriptor_key_size = key_size;
        self
    }

    pub fn integrity_checks(mut self, enabled: bool) -> Self {
        self.options.policy.set(ContainerPolicy::INTEGRITY_CHECKS, enabled);
        self
    }

    pub fn reserved_streams(mut self, count: u64) -> Self {
        self.options.reserved_streams = count;
        self
    }

    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.options.endianness = endianness;
        self
    }

    /// Zero disables the cache regardless of policy
    pub fn descriptor_cache_capacity(mut self, capacity: usize) -> Self {
        self.options.descriptor_cache_capacity = capacity;
        self
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    pub fn create<S: BackingStore>(self, store: S) -> Result<StreamContainer<S>> {
        StreamContainer::create(store, &self.options)
    }

    pub fn open<S: BackingStore>(self, store: S) -> Result<StreamContainer<S>> {
        StreamContainer::load(store, &self.options)
    }

    pub fn open_or_create<S: BackingStore>(self, store: S) -> Result<StreamContainer<S>> {
        StreamContainer::load_or_create(store, &self.options)
    }

    /// Create a container in a new (or truncated) file
    pub fn create_file<P: AsRef<Path>>(self, path: P) -> Result<StreamContainer<FileStore>> {
        self.create(FileStore::create(path)?)
    }

    pub fn open_file<P: AsRef<Path>>(self, path: P) -> Result<StreamContainer<FileStore>> {
        self.open(FileStore::open(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ContainerOptions::default();
        assert_eq!(options.cluster_size, 4096);
        assert_eq!(options.policy, ContainerPolicy::DEFAULT);
        assert_eq!(options.endianness, Endianness::Little);
        options.validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let options = ContainerOptions::from_toml_str(
            r#"
            cluster_size = 512
            reserved_streams = 2
            endianness = "big"
            "#,
        )
        .unwrap();
        assert_eq!(options.cluster_size, 512);
        assert_eq!(options.reserved_streams, 2);
        assert_eq!(options.endianness, Endianness::Big);
        assert_eq!(options.descriptor_cache_capacity, 256);
    }

    #[test]
    fn test_toml_validation() {
        assert!(matches!(
            ContainerOptions::from_toml_str("cluster_size = 0"),
            Err(ClusterError::InvalidArgument(_))
        ));
        assert!(matches!(
            ContainerOptions::from_toml_str("cluster_size = \"big\""),
            Err(ClusterError::Config(_))
        ));
        // Key tracking without a key size
        assert!(matches!(
            ContainerOptions::from_toml_str(r#"policy = "INTEGRITY_CHECKS | TRACK_KEY""#),
            Err(ClusterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_policy_by_name() {
        let options = ContainerOptions::from_toml_str(
            r#"
            policy = "CACHE_DESCRIPTORS | TRACK_KEY"
            descriptor_key_size = 8
            "#,
        )
        .unwrap();
        assert!(!options.policy.contains(ContainerPolicy::INTEGRITY_CHECKS));
        assert!(options.policy.contains(ContainerPolicy::TRACK_KEY));
    }

    #[test]
    fn test_builder() {
        let builder = StreamContainerBuilder::new()
            .cluster_size(64)
            .track_keys(16)
            .integrity_checks(false)
            .reserved_streams(1);
        let options = builder.options();
        assert_eq!(options.cluster_size, 64);
        assert!(options.policy.contains(ContainerPolicy::TRACK_KEY));
        assert!(!options.policy.contains(ContainerPolicy::INTEGRITY_CHECKS));
        assert_eq!(options.descriptor_key_size, 16);
    }
}
