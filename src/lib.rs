//! # Cartridge Streams - Clustered Stream Storage
//!
//! `cartridge-streams` packs many independently growable logical streams
//! into a single random-access backing store (a file or a memory buffer).
//!
//! - **Fixed-size clusters** linked into per-stream chains
//! - **Positional descriptor table**, itself stored as a chain
//! - **Tail relocation** keeps the cluster array dense when chains shrink
//! - **Fail-fast scopes**: many readers, or one writer
//!
//! ## Quick Start
//!
//! ```rust
//! use cartridge_streams::{MemoryStore, Result, StreamContainerBuilder};
//!
//! # fn main() -> Result<()> {
//! let container = StreamContainerBuilder::new()
//!     .cluster_size(512)
//!     .create(MemoryStore::new())?;
//!
//! // Add a stream and write to it
//! let stream = container.add()?;
//! stream.append(b"Hello, clusters!")?;
//! let index = stream.index();
//! stream.close();
//!
//! // Read it back
//! let reader = container.open_read(index)?;
//! assert_eq!(reader.read_to_vec()?, b"Hello, clusters!");
//! # Ok(())
//! # }
//! ```
//!
//! ## Files
//!
//! ```rust,no_run
//! use cartridge_streams::{Endianness, FileStore, Result, StreamContainer, StreamContainerBuilder};
//!
//! # fn main() -> Result<()> {
//! let container = StreamContainerBuilder::new()
//!     .reserved_streams(1)
//!     .create_file("data.streams")?;
//! container.open_write(0)?.append(b"index")?;
//! container.flush()?;
//! drop(container);
//!
//! // Settings are read back from the header
//! let container = StreamContainer::open_existing(FileStore::open("data.streams")?, Endianness::Little)?;
//! assert_eq!(container.stream_count(), 1);
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod cluster_map;
pub mod config;
pub mod container;
pub mod descriptor;
pub mod endian;
pub mod error;
pub mod fragment;
pub mod header;
pub mod io;
pub mod policy;
pub mod scope;

pub use cluster::NULL_CLUSTER;
pub use config::{ContainerOptions, StreamContainerBuilder};
pub use container::{ClusteredStream, ContainerStats, StreamContainer};
pub use descriptor::{StreamDescriptor, StreamTraits};
pub use endian::Endianness;
pub use error::{ClusterError, Result};
pub use header::{HeaderSettings, StreamContainerHeader, HEADER_SIZE};
pub use io::{BackingStore, FileStore, MemoryStore};
pub use policy::ContainerPolicy;
pub use scope::AccessMode;
