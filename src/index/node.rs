//! In-memory node representation and its serialized form.

use crate::error::{IndexError, Result};
use crate::index::entry::IndexEntry;
use crate::index::header::{Header, HEADER_LEN};
use crate::types::Vcn;

/// Slot of a node inside the index's arena. Parent links are stored as
/// arena indices, never as owning references.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct NodeIdx(pub usize);

/// One B+Tree node: an ordered entry list terminated by the `END`
/// sentinel, plus bookkeeping for capacity and persistence.
#[derive(Debug)]
pub(crate) struct Node {
    pub header: Header,
    pub entries: Vec<IndexEntry>,
    /// Arena slot of the parent; `None` for the root.
    pub parent: Option<NodeIdx>,
    /// Block address; `None` for the resident root.
    pub vcn: Option<Vcn>,
    /// Total space available to the serialized form, in bytes.
    pub capacity: usize,
    /// Whether the node must be persisted before the current mutation
    /// returns.
    pub dirty: bool,
}

impl Node {
    /// Fresh empty node: a lone `END` sentinel and a header sized for
    /// zero content.
    pub fn fresh(storage_overhead: usize, capacity: usize) -> Result<Self> {
        Ok(Self {
            header: Header::new(storage_overhead, capacity)?,
            entries: vec![IndexEntry::end()],
            parent: None,
            vcn: None,
            capacity,
            dirty: false,
        })
    }

    /// Deserialize a node: header first, then entries until the `END`
    /// sentinel is consumed. Bytes beyond the declared total are
    /// discarded.
    pub fn from_bytes(buf: &[u8], file_index: bool, capacity: usize) -> Result<Self> {
        let header = Header::decode(buf)?;
        let total = header.total_size_of_entries as usize;
        if total > buf.len() {
            return Err(IndexError::Corruption("node entries exceed buffer"));
        }
        let mut offset = header.offset_to_first_entry as usize;
        let mut entries = Vec::new();
        loop {
            if offset >= total {
                return Err(IndexError::Corruption("node missing end entry"));
            }
            let (entry, consumed) = IndexEntry::decode(&buf[offset..total], file_index)?;
            offset += consumed;
            let is_end = entry.is_end();
            entries.push(entry);
            if is_end {
                break;
            }
        }
        Ok(Self {
            header,
            entries,
            parent: None,
            vcn: None,
            capacity,
            dirty: false,
        })
    }

    /// Exact size of the serialized form.
    pub fn space_used(&self, file_index: bool) -> usize {
        self.header.offset_to_first_entry as usize
            + self
                .entries
                .iter()
                .map(|e| e.encoded_len(file_index))
                .sum::<usize>()
    }

    /// Serialize header and entries. Fails if the node outgrew its
    /// allocation; callers must have split or deposed first.
    pub fn serialize(&self, file_index: bool) -> Result<Vec<u8>> {
        let used = self.space_used(file_index);
        if used > self.capacity {
            return Err(IndexError::Invalid("node exceeds its allocation"));
        }
        let mut header = self.header.clone();
        header.total_size_of_entries = used as u32;
        header.allocated_size = self.capacity as u32;
        header.has_children = self.entries.iter().any(IndexEntry::has_child);
        let mut buf = vec![0u8; header.offset_to_first_entry as usize];
        header.encode(&mut buf[..HEADER_LEN])?;
        for entry in &self.entries {
            entry.encode(file_index, &mut buf)?;
        }
        Ok(buf)
    }
}
