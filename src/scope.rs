//! Access scope: which streams are open, and how
//!
//! Any number of streams may be open for reading together. A writer is
//! exclusive: while one stream is open for writing no other stream may be
//! opened, and a writer cannot be opened while anything else is open.
//! Conflicts fail immediately instead of waiting.

use crate::error::{ClusterError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn is_write(self) -> bool {
        self == AccessMode::Write
    }
}

#[derive(Debug, Default)]
pub struct AccessScope {
    open: BTreeMap<u64, AccessMode>,
}

impl AccessScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, index: u64, mode: AccessMode) -> Result<()> {
        if self.open.contains_key(&index) {
            return Err(ClusterError::StreamAlreadyOpen(index));
        }

        if mode.is_write() && !self.open.is_empty() {
            return Err(ClusterError::ScopeConflict(format!(
                "cannot write stream {} while {} other stream(s) are open",
                index,
                self.open.len()
            )));
        }

        if let Some((&writer, _)) = self.open.iter().find(|(_, mode)| mode.is_write()) {
            return Err(ClusterError::ScopeConflict(format!(
                "stream {} is open for writing",
                writer
            )));
        }

        self.open.insert(index, mode);
        Ok(())
    }

    pub fn exit(&mut self, index: u64) -> Option<AccessMode> {
        self.open.remove(&index)
    }

    /// Fail unless no stream is open
    pub fn require_idle(&self) -> Result<()> {
        if self.open.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::StreamsOpen(self.open.len()))
        }
    }

    pub fn mode(&self, index: u64) -> Option<AccessMode> {
        self.open.get(&index).copied()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share() {
        let mut scope = AccessScope::new();
        scope.enter(0, AccessMode::Read).unwrap();
        scope.enter(1, AccessMode::Read).unwrap();
        assert_eq!(scope.open_count(), 2);
        assert!(matches!(
            scope.enter(0, AccessMode::Read),
            Err(ClusterError::StreamAlreadyOpen(0))
        ));
    }

    #[test]
    fn test_writer_is_exclusive() {
        let mut scope = AccessScope::new();
        scope.enter(3, AccessMode::Write).unwrap();
        assert!(matches!(
            scope.enter(4, AccessMode::Read),
            Err(ClusterError::ScopeConflict(_))
        ));
        assert!(matches!(
            scope.enter(4, AccessMode::Write),
            Err(ClusterError::ScopeConflict(_))
        ));

        assert_eq!(scope.exit(3), Some(AccessMode::Write));
        scope.enter(4, AccessMode::Read).unwrap();
        assert!(scope.enter(5, AccessMode::Write).is_err());
    }

    #[test]
    fn test_require_idle() {
        let mut scope = AccessScope::new();
        scope.require_idle().unwrap();
        scope.enter(1, AccessMode::Read).unwrap();
        assert!(matches!(scope.require_idle(), Err(ClusterError::StreamsOpen(1))));
        scope.exit(1);
        scope.require_idle().unwrap();
    }
}
