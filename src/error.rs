use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Corrupt container header: {0}")]
    CorruptHeader(String),

    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u8),

    #[error("Corrupt cluster {cluster}: {reason}")]
    CorruptCluster { cluster: u64, reason: String },

    #[error("Corrupt chain for owner {owner:#x}: {reason}")]
    CorruptChain { owner: u64, reason: String },

    #[error("Corrupt stream descriptor {index}: {reason}")]
    CorruptDescriptor { index: u64, reason: String },

    #[error("Backing store truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("Stream {0} is already open")]
    StreamAlreadyOpen(u64),

    #[error("Operation requires no open streams ({0} open)")]
    StreamsOpen(usize),

    #[error("Scope conflict: {0}")]
    ScopeConflict(String),

    #[error("Stream index {index} out of range (count {count})")]
    IndexOutOfRange { index: u64, count: u64 },

    #[error("Stream {0} is reserved")]
    ReservedStream(u64),

    #[error("Stream {0} was opened read-only")]
    ReadOnly(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Descriptor keys are not tracked by this container")]
    KeyTrackingDisabled,

    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl ClusterError {
    /// True for errors caused by bad bytes in the backing store rather than by the caller
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ClusterError::CorruptHeader(_)
                | ClusterError::UnsupportedVersion(_)
                | ClusterError::CorruptCluster { .. }
                | ClusterError::CorruptChain { .. }
                | ClusterError::CorruptDescriptor { .. }
                | ClusterError::Truncated { .. }
        )
    }

    pub(crate) fn corrupt_cluster(cluster: u64, reason: impl Into<String>) -> Self {
        let err = ClusterError::CorruptCluster {
            cluster,
            reason: reason.into(),
        };
        tracing::warn!("{}", err);
        err
    }

    pub(crate) fn corrupt_descriptor(index: u64, reason: impl Into<String>) -> Self {
        let err = ClusterError::CorruptDescriptor {
            index,
            reason: reason.into(),
        };
        tracing::warn!("{}", err);
        err
    }

    pub(crate) fn corrupt_chain(owner: u64, reason: impl Into<String>) -> Self {
        let err = ClusterError::CorruptChain {
            owner,
            reason: reason.into(),
        };
        tracing::warn!("{}", err);
        err
    }
}

impl From<ClusterError> for std::io::Error {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Io(inner) => inner,
            other if other.is_corruption() => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, other)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
