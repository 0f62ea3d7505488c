//! On-disk container for non-resident nodes, and the allocator handing
//! out their virtual cluster numbers.
//!
//! Block layout: `INDX` magic, CRC32 of the payload, the block's own VCN
//! echoed back for mismatch detection, then the serialized node.

use tracing::trace;

use crate::error::{IndexError, Result};
use crate::types::Vcn;

/// Bytes the block container consumes before the node payload.
pub const BLOCK_HDR_LEN: usize = 16;

/// Magic prefixing every index block.
pub const BLOCK_MAGIC: [u8; 4] = *b"INDX";

const CRC_OFFSET: usize = 4;
const VCN_OFFSET: usize = 8;

/// Wrap a serialized node into a full block image of `block_size` bytes.
pub fn encode_block(vcn: Vcn, node_bytes: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if node_bytes.len() > block_size - BLOCK_HDR_LEN {
        return Err(IndexError::Invalid("node larger than block payload"));
    }
    let mut buf = vec![0u8; block_size];
    buf[..4].copy_from_slice(&BLOCK_MAGIC);
    buf[VCN_OFFSET..VCN_OFFSET + 8].copy_from_slice(&vcn.0.to_le_bytes());
    buf[BLOCK_HDR_LEN..BLOCK_HDR_LEN + node_bytes.len()].copy_from_slice(node_bytes);
    let crc = crc32fast::hash(&buf[BLOCK_HDR_LEN..]);
    buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Validate a block image read for `expected` and return its node payload.
pub fn decode_block(buf: &[u8], expected: Vcn) -> Result<&[u8]> {
    if buf.len() < BLOCK_HDR_LEN {
        return Err(IndexError::Corruption("index block truncated"));
    }
    if buf[..4] != BLOCK_MAGIC {
        return Err(IndexError::Corruption("bad index block magic"));
    }
    let stored_crc = u32::from_le_bytes(
        buf[CRC_OFFSET..CRC_OFFSET + 4]
            .try_into()
            .expect("4-byte slice"),
    );
    if crc32fast::hash(&buf[BLOCK_HDR_LEN..]) != stored_crc {
        return Err(IndexError::Corruption("index block checksum mismatch"));
    }
    let stored_vcn = u64::from_le_bytes(
        buf[VCN_OFFSET..VCN_OFFSET + 8]
            .try_into()
            .expect("8-byte slice"),
    );
    if stored_vcn != expected.0 {
        return Err(IndexError::Corruption("index block vcn mismatch"));
    }
    Ok(&buf[BLOCK_HDR_LEN..])
}

/// Bitmap-backed allocator for block virtual cluster numbers.
///
/// The bitmap persists beside the index data so a reopened index resumes
/// allocation where it left off.
#[derive(Debug)]
pub(crate) struct BlockAllocator {
    bits: Vec<u8>,
    max_blocks: Option<u64>,
}

impl BlockAllocator {
    pub fn new(max_blocks: Option<u64>) -> Self {
        Self {
            bits: Vec::new(),
            max_blocks,
        }
    }

    pub fn from_bytes(bits: Vec<u8>, max_blocks: Option<u64>) -> Self {
        Self { bits, max_blocks }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Hand out the lowest free cluster number, growing the bitmap on
    /// demand.
    pub fn allocate(&mut self) -> Result<Vcn> {
        let mut candidate = None;
        for n in 0..self.bits.len() * 8 {
            if !self.get(n) {
                candidate = Some(n);
                break;
            }
        }
        let n = match candidate {
            Some(n) => n,
            None => {
                self.bits.push(0);
                (self.bits.len() - 1) * 8
            }
        };
        if let Some(max) = self.max_blocks {
            if n as u64 >= max {
                return Err(IndexError::Exhausted("index block allocation limit reached"));
            }
        }
        self.set(n, true);
        trace!(target: "ntfs_index::alloc", vcn = n, "allocated block");
        Ok(Vcn(n as u64))
    }

    /// Release a cluster number back to the free pool.
    pub fn free(&mut self, vcn: Vcn) -> Result<()> {
        let n = vcn.0 as usize;
        if n >= self.bits.len() * 8 || !self.get(n) {
            return Err(IndexError::Invalid("freeing unallocated block"));
        }
        self.set(n, false);
        trace!(target: "ntfs_index::alloc", vcn = n, "freed block");
        Ok(())
    }

    /// Number of clusters currently allocated.
    pub fn allocated_count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether `count` further allocations could all succeed under the
    /// configured cap.
    pub fn can_allocate(&self, count: usize) -> bool {
        match self.max_blocks {
            None => true,
            Some(max) => (self.allocated_count() + count) as u64 <= max,
        }
    }

    fn get(&self, n: usize) -> bool {
        self.bits[n / 8] & (1 << (n % 8)) != 0
    }

    fn set(&mut self, n: usize, value: bool) {
        if value {
            self.bits[n / 8] |= 1 << (n % 8);
        } else {
            self.bits[n / 8] &= !(1 << (n % 8));
        }
    }
}
