//! Directory layer: a file-name-keyed consumer of the index engine.
//!
//! Keys are serialized [`FileNameRecord`]s, entry data is the owning
//! file's 8-byte reference. Enumeration flattens the whole tree in
//! comparator order, filters by attribute policy and collapses hard-link
//! short/long name pairs to the long-name entry.

use std::cmp::Ordering;

use rustc_hash::FxHashMap;

use crate::error::{IndexError, Result};
use crate::index::{Index, IndexOptions, KeyOrdering};
use crate::store::IndexStore;
use crate::types::{
    FileReference, FILE_ATTR_HIDDEN, FILE_ATTR_SYSTEM, FIRST_AVAILABLE_MFT_INDEX,
};

/// Which of a file's names a directory entry carries.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FileNameNamespace {
    /// Case-sensitive POSIX name.
    Posix = 0,
    /// Long Win32 name.
    Win32 = 1,
    /// 8.3 short name.
    Dos = 2,
    /// Single name valid in both the Win32 and DOS namespaces.
    Win32AndDos = 3,
}

impl FileNameNamespace {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Posix),
            1 => Ok(Self::Win32),
            2 => Ok(Self::Dos),
            3 => Ok(Self::Win32AndDos),
            _ => Err(IndexError::Corruption("unknown file name namespace")),
        }
    }
}

/// The name record stored as a directory entry's key.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FileNameRecord {
    /// File attribute bits (hidden, system, ...).
    pub attributes: u32,
    /// Namespace the name belongs to.
    pub namespace: FileNameNamespace,
    /// The file name itself.
    pub name: String,
}

const RECORD_FIXED_LEN: usize = 8;
const NAME_LEN_OFFSET: usize = 6;

impl FileNameRecord {
    /// A plain long-named record without attribute bits.
    pub fn new(name: &str) -> Self {
        Self {
            attributes: 0,
            namespace: FileNameNamespace::Win32,
            name: name.to_string(),
        }
    }

    /// Whether the record carries the canonical long form of the name.
    pub fn is_long_name(&self) -> bool {
        self.namespace != FileNameNamespace::Dos
    }

    /// Serialize: attributes, namespace, zero, name length, UTF-8 name.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.name.len() > u16::MAX as usize {
            return Err(IndexError::Invalid("file name longer than u16"));
        }
        let mut buf = Vec::with_capacity(RECORD_FIXED_LEN + self.name.len());
        buf.extend_from_slice(&self.attributes.to_le_bytes());
        buf.push(self.namespace as u8);
        buf.push(0);
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        Ok(buf)
    }

    /// Deserialize a record from an entry key.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_FIXED_LEN {
            return Err(IndexError::Corruption("file name record truncated"));
        }
        let attributes = u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice"));
        let namespace = FileNameNamespace::from_u8(buf[4])?;
        let name_len = u16::from_le_bytes(
            buf[NAME_LEN_OFFSET..NAME_LEN_OFFSET + 2]
                .try_into()
                .expect("2-byte slice"),
        ) as usize;
        if RECORD_FIXED_LEN + name_len > buf.len() {
            return Err(IndexError::Corruption("file name exceeds record bounds"));
        }
        let name = std::str::from_utf8(&buf[RECORD_FIXED_LEN..RECORD_FIXED_LEN + name_len])
            .map_err(|_| IndexError::Corruption("file name not valid utf-8"))?
            .to_string();
        Ok(Self {
            attributes,
            namespace,
            name,
        })
    }
}

/// Case-insensitive ordering over the name portion of serialized
/// [`FileNameRecord`] keys.
pub struct FileNameOrdering;

impl KeyOrdering for FileNameOrdering {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (name_slice(a), name_slice(b)) {
            (Some(a), Some(b)) => caseless_cmp(a, b),
            // Malformed keys only ever come from corrupted inputs; give
            // them a stable order so traversal still terminates.
            _ => a.cmp(b),
        }
    }
}

fn name_slice(key: &[u8]) -> Option<&str> {
    if key.len() < RECORD_FIXED_LEN {
        return None;
    }
    let name_len =
        u16::from_le_bytes(key[NAME_LEN_OFFSET..NAME_LEN_OFFSET + 2].try_into().ok()?) as usize;
    let name = key.get(RECORD_FIXED_LEN..RECORD_FIXED_LEN + name_len)?;
    std::str::from_utf8(name).ok()
}

fn caseless_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().flat_map(char::to_uppercase);
    let mut right = b.chars().flat_map(char::to_uppercase);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Policy for which members a listing includes.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemberFilter {
    /// Include entries with the hidden attribute bit.
    pub include_hidden: bool,
    /// Include entries with the system attribute bit.
    pub include_system: bool,
    /// Include entries referencing reserved filesystem records.
    pub include_meta_files: bool,
}

/// One visible directory member.
#[derive(Clone, Debug)]
pub struct DirectoryMember {
    /// The name record under which the member is listed.
    pub record: FileNameRecord,
    /// The file the member points at.
    pub reference: FileReference,
}

/// A directory built on a file-name-keyed index.
pub struct Directory<S: IndexStore> {
    index: Index<S>,
}

impl<S: IndexStore> Directory<S> {
    /// Create a fresh directory index on `store`.
    pub fn create(store: S, mut opts: IndexOptions) -> Result<Self> {
        opts.file_index = true;
        Ok(Self {
            index: Index::create(store, Box::new(FileNameOrdering), opts)?,
        })
    }

    /// Open an existing directory index.
    pub fn open(store: S, mut opts: IndexOptions) -> Result<Self> {
        opts.file_index = true;
        Ok(Self {
            index: Index::open(store, Box::new(FileNameOrdering), opts)?,
        })
    }

    /// Give the backing store back.
    pub fn into_store(self) -> S {
        self.index.into_store()
    }

    /// Add one name entry for a file. Hard links insert one entry per
    /// name.
    pub fn add_member(&mut self, record: &FileNameRecord, reference: FileReference) -> Result<()> {
        self.index
            .insert(&record.encode()?, &reference.0.to_le_bytes())
    }

    /// Remove the entry for `name`. Returns whether anything was removed.
    pub fn remove_member(&mut self, name: &str) -> Result<bool> {
        self.index.remove(&probe_key(name)?)
    }

    /// Look up a member by name.
    pub fn find(&mut self, name: &str) -> Result<Option<FileReference>> {
        match self.index.try_get(&probe_key(name)?)? {
            Some(data) => Ok(Some(decode_reference(&data)?)),
            None => Ok(None),
        }
    }

    /// Enumerate visible members in name order.
    ///
    /// The flattened tree is filtered per `filter`, then entries
    /// referencing the same file are collapsed: the long-form name
    /// displaces a provisionally kept short form, so each file appears at
    /// most once however many names it has on disk.
    pub fn get_members(&mut self, filter: MemberFilter) -> Result<Vec<DirectoryMember>> {
        let flat = self.index.entries()?;
        let mut out: Vec<DirectoryMember> = Vec::new();
        let mut by_reference: FxHashMap<u64, usize> = FxHashMap::default();
        for (key, data) in flat {
            let record = FileNameRecord::decode(&key)?;
            let reference = decode_reference(&data)?;
            if reference.mft_index() < FIRST_AVAILABLE_MFT_INDEX && !filter.include_meta_files {
                continue;
            }
            if record.attributes & FILE_ATTR_HIDDEN != 0 && !filter.include_hidden {
                continue;
            }
            if record.attributes & FILE_ATTR_SYSTEM != 0 && !filter.include_system {
                continue;
            }
            match by_reference.get(&reference.0) {
                Some(&slot) => {
                    if !out[slot].record.is_long_name() && record.is_long_name() {
                        out[slot] = DirectoryMember { record, reference };
                    }
                }
                None => {
                    by_reference.insert(reference.0, out.len());
                    out.push(DirectoryMember { record, reference });
                }
            }
        }
        Ok(out)
    }
}

fn probe_key(name: &str) -> Result<Vec<u8>> {
    // The comparator only looks at the name, so attribute bits and
    // namespace in the probe are irrelevant.
    FileNameRecord::new(name).encode()
}

fn decode_reference(data: &[u8]) -> Result<FileReference> {
    let raw: [u8; 8] = data
        .try_into()
        .map_err(|_| IndexError::Corruption("member reference malformed"))?;
    Ok(FileReference(u64::from_le_bytes(raw)))
}
