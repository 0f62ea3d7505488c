//! The atomic key/value record stored in a node.
//!
//! Layout (all integers little-endian):
//!
//! | off | size | field |
//! |-----|------|-------|
//! | 0   | 8    | file reference when the index is file-indexed, else `data_offset:u16, data_len:u16, zero:u32` |
//! | 8   | 2    | entry length (total, multiple of 8) |
//! | 10  | 2    | key length |
//! | 12  | 2    | flags: bit 0 `NODE`, bit 1 `END` |
//! | 14  | 2    | zero |
//! | 16  |      | key bytes, then data bytes for non-file-indexed entries |
//!
//! When `NODE` is set the last 8 bytes of the entry hold the child's
//! virtual cluster number. An `END` entry carries no key and no data and
//! terminates every node's entry list.

use crate::error::{IndexError, Result};
use crate::index::header::round_up_8;
use crate::types::Vcn;

/// Fixed part of every entry before the key bytes.
pub const ENTRY_FIXED_LEN: usize = 16;

const FLAG_NODE: u16 = 0x0001;
const FLAG_END: u16 = 0x0002;
const KNOWN_FLAGS: u16 = FLAG_NODE | FLAG_END;

const ENTRY_LENGTH: usize = 8;
const KEY_LENGTH: usize = 10;
const FLAGS: usize = 12;

/// One key/value record, possibly carrying a pointer to a child block of
/// strictly smaller keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    key: Vec<u8>,
    data: Vec<u8>,
    end: bool,
    child: Option<Vcn>,
}

impl IndexEntry {
    /// A plain key/value entry.
    pub fn new(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            end: false,
            child: None,
        }
    }

    /// The `END` sentinel terminating a node's entry list.
    pub fn end() -> Self {
        Self {
            key: Vec::new(),
            data: Vec::new(),
            end: true,
            child: None,
        }
    }

    /// Key bytes; empty for the sentinel.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Data bytes; the 8-byte file reference in file-indexed mode.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Child block address, if the entry points at a subtree.
    pub fn child(&self) -> Option<Vcn> {
        self.child
    }

    /// Whether this is the terminating sentinel.
    pub fn is_end(&self) -> bool {
        self.end
    }

    /// Whether the entry carries a child pointer.
    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// Attach or clear the child pointer.
    pub fn set_child(&mut self, child: Option<Vcn>) {
        self.child = child;
    }

    /// Replace the data in place.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Replace key and data together, keeping flags and child pointer.
    /// Used by predecessor substitution during deletion.
    pub fn set_key_data(&mut self, key: Vec<u8>, data: Vec<u8>) {
        self.key = key;
        self.data = data;
    }

    /// Exact serialized length. Load-bearing for every capacity
    /// computation in the node layer.
    pub fn encoded_len(&self, file_index: bool) -> usize {
        let mut len = ENTRY_FIXED_LEN + self.key.len();
        if !file_index {
            len += self.data.len();
        }
        len = round_up_8(len);
        if self.child.is_some() {
            len += 8;
        }
        len
    }

    /// Append the serialized entry to `dst`.
    pub fn encode(&self, file_index: bool, dst: &mut Vec<u8>) -> Result<()> {
        if self.key.len() > u16::MAX as usize {
            return Err(IndexError::Invalid("key longer than u16"));
        }
        if !file_index && self.data.len() > u16::MAX as usize {
            return Err(IndexError::Invalid("data longer than u16"));
        }
        if file_index && !self.end && self.data.len() != 8 {
            return Err(IndexError::Invalid(
                "file-indexed entry data must be an 8-byte reference",
            ));
        }
        let total = self.encoded_len(file_index);
        if total > u16::MAX as usize {
            return Err(IndexError::Invalid("entry longer than u16"));
        }
        let start = dst.len();
        dst.resize(start + total, 0);
        let buf = &mut dst[start..];
        if !self.end {
            if file_index {
                buf[0..8].copy_from_slice(&self.data);
            } else {
                let data_offset = (ENTRY_FIXED_LEN + self.key.len()) as u16;
                buf[0..2].copy_from_slice(&data_offset.to_le_bytes());
                buf[2..4].copy_from_slice(&(self.data.len() as u16).to_le_bytes());
            }
        }
        buf[ENTRY_LENGTH..ENTRY_LENGTH + 2].copy_from_slice(&(total as u16).to_le_bytes());
        buf[KEY_LENGTH..KEY_LENGTH + 2].copy_from_slice(&(self.key.len() as u16).to_le_bytes());
        let mut flags = 0u16;
        if self.child.is_some() {
            flags |= FLAG_NODE;
        }
        if self.end {
            flags |= FLAG_END;
        }
        buf[FLAGS..FLAGS + 2].copy_from_slice(&flags.to_le_bytes());
        buf[ENTRY_FIXED_LEN..ENTRY_FIXED_LEN + self.key.len()].copy_from_slice(&self.key);
        if !file_index && !self.end {
            let data_start = ENTRY_FIXED_LEN + self.key.len();
            buf[data_start..data_start + self.data.len()].copy_from_slice(&self.data);
        }
        if let Some(vcn) = self.child {
            buf[total - 8..total].copy_from_slice(&vcn.0.to_le_bytes());
        }
        Ok(())
    }

    /// Decode one entry from the front of `buf`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(buf: &[u8], file_index: bool) -> Result<(Self, usize)> {
        if buf.len() < ENTRY_FIXED_LEN {
            return Err(IndexError::Corruption("index entry truncated"));
        }
        let total = read_u16(buf, ENTRY_LENGTH) as usize;
        let key_len = read_u16(buf, KEY_LENGTH) as usize;
        let flags = read_u16(buf, FLAGS);
        if total < ENTRY_FIXED_LEN || total % 8 != 0 {
            return Err(IndexError::Corruption("bad entry length"));
        }
        if total > buf.len() {
            return Err(IndexError::Corruption("entry exceeds node bounds"));
        }
        if flags & !KNOWN_FLAGS != 0 {
            return Err(IndexError::Corruption("unknown entry flags"));
        }
        let end = flags & FLAG_END != 0;
        let node = flags & FLAG_NODE != 0;
        if end && key_len != 0 {
            return Err(IndexError::Corruption("end entry carries a key"));
        }
        let trailer = if node { 8 } else { 0 };
        if ENTRY_FIXED_LEN + key_len + trailer > total {
            return Err(IndexError::Corruption("entry key exceeds entry length"));
        }
        let key = buf[ENTRY_FIXED_LEN..ENTRY_FIXED_LEN + key_len].to_vec();
        let data = if end {
            Vec::new()
        } else if file_index {
            buf[0..8].to_vec()
        } else {
            let data_offset = read_u16(buf, 0) as usize;
            let data_len = read_u16(buf, 2) as usize;
            if data_len == 0 {
                Vec::new()
            } else {
                if data_offset < ENTRY_FIXED_LEN + key_len {
                    return Err(IndexError::Corruption("entry data overlaps key"));
                }
                if data_offset + data_len > total - trailer {
                    return Err(IndexError::Corruption("entry data out of bounds"));
                }
                buf[data_offset..data_offset + data_len].to_vec()
            }
        };
        let child = if node {
            Some(Vcn(u64::from_le_bytes(
                buf[total - 8..total].try_into().expect("8-byte slice"),
            )))
        } else {
            None
        };
        Ok((
            Self {
                key,
                data,
                end,
                child,
            },
            total,
        ))
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().expect("2-byte slice"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_generic_entry() {
        let entry = IndexEntry::new(b"key-1".to_vec(), b"payload".to_vec());
        let mut buf = Vec::new();
        entry.encode(false, &mut buf).unwrap();
        assert_eq!(buf.len(), entry.encoded_len(false));
        assert_eq!(buf.len() % 8, 0);
        let (decoded, consumed) = IndexEntry::decode(&buf, false).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn roundtrip_file_indexed_entry_with_child() {
        let mut entry = IndexEntry::new(b"NAME".to_vec(), 42u64.to_le_bytes().to_vec());
        entry.set_child(Some(Vcn(9)));
        let mut buf = Vec::new();
        entry.encode(true, &mut buf).unwrap();
        let (decoded, _) = IndexEntry::decode(&buf, true).unwrap();
        assert_eq!(decoded.child(), Some(Vcn(9)));
        assert_eq!(decoded.data(), 42u64.to_le_bytes());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn roundtrip_end_sentinel_with_child() {
        let mut entry = IndexEntry::end();
        entry.set_child(Some(Vcn(3)));
        let mut buf = Vec::new();
        entry.encode(false, &mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        let (decoded, _) = IndexEntry::decode(&buf, false).unwrap();
        assert!(decoded.is_end());
        assert_eq!(decoded.child(), Some(Vcn(3)));
    }

    #[test]
    fn decode_rejects_unknown_flags() {
        let mut buf = Vec::new();
        IndexEntry::new(b"k".to_vec(), b"v".to_vec())
            .encode(false, &mut buf)
            .unwrap();
        buf[12] |= 0x80;
        assert!(matches!(
            IndexEntry::decode(&buf, false),
            Err(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut buf = Vec::new();
        IndexEntry::new(b"key".to_vec(), b"value".to_vec())
            .encode(false, &mut buf)
            .unwrap();
        assert!(matches!(
            IndexEntry::decode(&buf[..buf.len() - 1], false),
            Err(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn decode_rejects_keyed_end_entry() {
        let mut buf = Vec::new();
        IndexEntry::new(b"k".to_vec(), Vec::new())
            .encode(false, &mut buf)
            .unwrap();
        buf[12] |= 0x02;
        assert!(matches!(
            IndexEntry::decode(&buf, false),
            Err(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn file_indexed_entry_requires_reference_data() {
        let entry = IndexEntry::new(b"NAME".to_vec(), b"short".to_vec());
        let mut buf = Vec::new();
        assert!(matches!(
            entry.encode(true, &mut buf),
            Err(IndexError::Invalid(_))
        ));
    }
}
