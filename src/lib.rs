//! Read/write access to NTFS-style on-disk B+Tree indexes: the structure
//! used for directories and other keyed lookups.
//!
//! The engine combines a self-balancing tree with a fixed binary block
//! layout and two storage modes: a small resident root embedded in the
//! owning record, and non-resident blocks addressed by virtual cluster
//! number once the tree outgrows residency. Disk I/O and key ordering are
//! supplied by the caller through [`store::IndexStore`] and
//! [`index::KeyOrdering`].

#![warn(missing_docs)]

pub mod dir;
pub mod error;
pub mod index;
pub mod store;
pub mod types;

pub use dir::{Directory, DirectoryMember, FileNameNamespace, FileNameRecord, MemberFilter};
pub use error::{IndexError, Result};
pub use index::{BytewiseOrdering, Index, IndexOptions, KeyOrdering};
pub use store::{FileStore, IndexStore, MemoryStore};
pub use types::{FileReference, Vcn};
