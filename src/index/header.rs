//! Fixed 16-byte node header prefixing every serialized entry list.

use crate::error::{IndexError, Result};

/// Serialized length of the header.
pub const HEADER_LEN: usize = 16;

const OFFSET_TO_FIRST_ENTRY: usize = 0;
const TOTAL_SIZE: usize = 4;
const ALLOCATED_SIZE: usize = 8;
const HAS_CHILDREN: usize = 12;

/// Round `n` up to the next 8-byte boundary.
pub(crate) fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

/// Per-node metadata: where entries start, how much of the allocation they
/// use, and whether any entry carries a child pointer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Byte offset of the first entry, relative to the header start.
    /// Always a multiple of 8.
    pub offset_to_first_entry: u32,
    /// Bytes in use, the entry-offset region included.
    pub total_size_of_entries: u32,
    /// Hard capacity ceiling for the node's serialized form.
    pub allocated_size: u32,
    /// Whether any entry in the node points at a child block.
    pub has_children: bool,
}

impl Header {
    /// Header for a fresh node. `storage_overhead` is the space the
    /// enclosing container consumes before entries may begin; it differs
    /// between the resident root and allocated blocks.
    pub fn new(storage_overhead: usize, allocated: usize) -> Result<Self> {
        let offset = round_up_8(HEADER_LEN + storage_overhead);
        if offset > allocated || allocated > u32::MAX as usize {
            return Err(IndexError::Invalid("node allocation too small"));
        }
        Ok(Self {
            offset_to_first_entry: offset as u32,
            total_size_of_entries: offset as u32,
            allocated_size: allocated as u32,
            has_children: false,
        })
    }

    /// Encode into the first [`HEADER_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < HEADER_LEN {
            return Err(IndexError::Invalid("header buffer too small"));
        }
        dst[OFFSET_TO_FIRST_ENTRY..OFFSET_TO_FIRST_ENTRY + 4]
            .copy_from_slice(&self.offset_to_first_entry.to_le_bytes());
        dst[TOTAL_SIZE..TOTAL_SIZE + 4].copy_from_slice(&self.total_size_of_entries.to_le_bytes());
        dst[ALLOCATED_SIZE..ALLOCATED_SIZE + 4].copy_from_slice(&self.allocated_size.to_le_bytes());
        dst[HAS_CHILDREN] = self.has_children as u8;
        dst[HAS_CHILDREN + 1..HEADER_LEN].fill(0);
        Ok(())
    }

    /// Decode and validate a header from `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_LEN {
            return Err(IndexError::Corruption("index header truncated"));
        }
        let offset = read_u32(src, OFFSET_TO_FIRST_ENTRY);
        let total = read_u32(src, TOTAL_SIZE);
        let allocated = read_u32(src, ALLOCATED_SIZE);
        if offset as usize % 8 != 0 || (offset as usize) < HEADER_LEN {
            return Err(IndexError::Corruption("entry offset misaligned"));
        }
        if total < offset {
            return Err(IndexError::Corruption("entry size below entry offset"));
        }
        if total > allocated {
            return Err(IndexError::Corruption("entries exceed node allocation"));
        }
        let has_children = match src[HAS_CHILDREN] {
            0 => false,
            1 => true,
            _ => return Err(IndexError::Corruption("bad child-presence flag")),
        };
        if src[HAS_CHILDREN + 1..HEADER_LEN].iter().any(|&b| b != 0) {
            return Err(IndexError::Corruption("header padding not zero"));
        }
        Ok(Self {
            offset_to_first_entry: offset,
            total_size_of_entries: total,
            allocated_size: allocated,
            has_children,
        })
    }
}

fn read_u32(src: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(src[offset..offset + 4].try_into().expect("4-byte slice"))
}
