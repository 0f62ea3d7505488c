//! Byte-range abstraction the index engine persists through.
//!
//! The engine never performs disk I/O itself. All persistence goes
//! through [`IndexStore`], which exposes three regions: the resident root
//! image, fixed-size blocks addressed by virtual cluster number, and the
//! allocation bitmap.
//! Callers embedding the engine in a filesystem implement the trait over
//! their attribute streams; [`MemoryStore`] and [`FileStore`] cover tests
//! and standalone use.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{IndexError, Result};
use crate::types::Vcn;

/// Storage capability supplied by the owner of an index.
///
/// Writes must be durable by the time the call returns `Ok`; the engine
/// treats any error as a failure of the mutating operation in progress.
pub trait IndexStore {
    /// Read the serialized resident root node.
    fn read_root(&mut self) -> Result<Vec<u8>>;
    /// Replace the serialized resident root node.
    fn write_root(&mut self, data: &[u8]) -> Result<()>;
    /// Read the block at `vcn` into `buf`; `buf` is exactly one block long.
    fn read_block(&mut self, vcn: Vcn, buf: &mut [u8]) -> Result<()>;
    /// Write the block at `vcn`; `data` is exactly one block long.
    fn write_block(&mut self, vcn: Vcn, data: &[u8]) -> Result<()>;
    /// Read the block-allocation bitmap.
    fn read_bitmap(&mut self) -> Result<Vec<u8>>;
    /// Replace the block-allocation bitmap.
    fn write_bitmap(&mut self, data: &[u8]) -> Result<()>;
}

/// Heap-backed store for tests and ephemeral indexes.
#[derive(Default)]
pub struct MemoryStore {
    root: Vec<u8>,
    bitmap: Vec<u8>,
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks that have ever been written.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl IndexStore for MemoryStore {
    fn read_root(&mut self) -> Result<Vec<u8>> {
        Ok(self.root.clone())
    }

    fn write_root(&mut self, data: &[u8]) -> Result<()> {
        self.root = data.to_vec();
        Ok(())
    }

    fn read_block(&mut self, vcn: Vcn, buf: &mut [u8]) -> Result<()> {
        let block = self
            .blocks
            .get(&vcn.0)
            .ok_or(IndexError::Invalid("block was never written"))?;
        if block.len() != buf.len() {
            return Err(IndexError::Invalid("block size mismatch"));
        }
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&mut self, vcn: Vcn, data: &[u8]) -> Result<()> {
        self.blocks.insert(vcn.0, data.to_vec());
        Ok(())
    }

    fn read_bitmap(&mut self) -> Result<Vec<u8>> {
        Ok(self.bitmap.clone())
    }

    fn write_bitmap(&mut self, data: &[u8]) -> Result<()> {
        self.bitmap = data.to_vec();
        Ok(())
    }
}

/// Reserved bytes for the root image region, length prefix included.
const ROOT_REGION: u64 = 4096;
/// Reserved bytes for the bitmap region, length prefix included.
const BITMAP_REGION: u64 = 4096;
const LEN_PREFIX: u64 = 4;

/// Minimal file-backed store.
///
/// Layout: root image region, bitmap region, then blocks at
/// `region_end + vcn * block_size`. Both variable-length regions carry a
/// little-endian `u32` length prefix.
pub struct FileStore {
    file: File,
    block_size: u64,
}

impl FileStore {
    /// Create a fresh store file, truncating anything already at `path`.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            block_size: block_size as u64,
        })
    }

    /// Open an existing store file.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            block_size: block_size as u64,
        })
    }

    fn read_region(&mut self, start: u64, limit: u64) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(start))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as u64;
        if len > limit - LEN_PREFIX {
            return Err(IndexError::Corruption("region length out of range"));
        }
        let mut data = vec![0u8; len as usize];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    fn write_region(&mut self, start: u64, limit: u64, data: &[u8]) -> Result<()> {
        if data.len() as u64 > limit - LEN_PREFIX {
            return Err(IndexError::Invalid("data exceeds reserved region"));
        }
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&(data.len() as u32).to_le_bytes())?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }

    fn block_position(&self, vcn: Vcn) -> u64 {
        ROOT_REGION + BITMAP_REGION + vcn.0 * self.block_size
    }
}

impl IndexStore for FileStore {
    fn read_root(&mut self) -> Result<Vec<u8>> {
        self.read_region(0, ROOT_REGION)
    }

    fn write_root(&mut self, data: &[u8]) -> Result<()> {
        self.write_region(0, ROOT_REGION, data)
    }

    fn read_block(&mut self, vcn: Vcn, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 != self.block_size {
            return Err(IndexError::Invalid("block size mismatch"));
        }
        self.file.seek(SeekFrom::Start(self.block_position(vcn)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, vcn: Vcn, data: &[u8]) -> Result<()> {
        if data.len() as u64 != self.block_size {
            return Err(IndexError::Invalid("block size mismatch"));
        }
        self.file.seek(SeekFrom::Start(self.block_position(vcn)))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }

    fn read_bitmap(&mut self) -> Result<Vec<u8>> {
        self.read_region(ROOT_REGION, BITMAP_REGION)
    }

    fn write_bitmap(&mut self, data: &[u8]) -> Result<()> {
        self.write_region(ROOT_REGION, BITMAP_REGION, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_rejects_unknown_block() {
        let mut store = MemoryStore::new();
        let mut buf = vec![0u8; 64];
        assert!(matches!(
            store.read_block(Vcn(3), &mut buf),
            Err(IndexError::Invalid(_))
        ));
    }

    #[test]
    fn memory_store_roundtrips_regions() {
        let mut store = MemoryStore::new();
        store.write_root(b"root image").unwrap();
        store.write_bitmap(&[0b0000_0101]).unwrap();
        store.write_block(Vcn(0), &[7u8; 32]).unwrap();
        assert_eq!(store.read_root().unwrap(), b"root image");
        assert_eq!(store.read_bitmap().unwrap(), vec![0b0000_0101]);
        let mut buf = vec![0u8; 32];
        store.read_block(Vcn(0), &mut buf).unwrap();
        assert_eq!(buf, vec![7u8; 32]);
    }
}
