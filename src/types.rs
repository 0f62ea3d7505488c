//! Identifier newtypes and file-attribute constants shared across the crate.

use std::fmt;

/// Virtual cluster number: the logical address of one index block within
/// the index's allocation stream. The byte position of a block is
/// `vcn * block_size`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Vcn(pub u64);

impl fmt::Display for Vcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a file record: 48-bit record index in the low bits, 16-bit
/// sequence number in the high bits.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileReference(pub u64);

impl FileReference {
    /// Build a reference from a record index and a sequence number.
    pub fn new(index: u64, sequence: u16) -> Self {
        Self((index & MFT_INDEX_MASK) | ((sequence as u64) << 48))
    }

    /// Record index within the file table.
    pub fn mft_index(self) -> u64 {
        self.0 & MFT_INDEX_MASK
    }

    /// Sequence number guarding against stale references.
    pub fn sequence(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mft_index(), self.sequence())
    }
}

const MFT_INDEX_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// File records below this index belong to the filesystem itself and are
/// hidden from directory listings unless explicitly requested.
pub const FIRST_AVAILABLE_MFT_INDEX: u64 = 24;

/// Hidden-file attribute bit.
pub const FILE_ATTR_HIDDEN: u32 = 0x0000_0002;

/// System-file attribute bit.
pub const FILE_ATTR_SYSTEM: u32 = 0x0000_0004;
