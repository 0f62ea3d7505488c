//! The B+Tree index engine.
//!
//! [`Index`] owns the root node, the comparator, the block allocator and
//! a cache of materialized child blocks. Mutations descend recursively
//! and bubble structural changes (divide/depose/merge) back up through
//! arena-indexed parent links; affected nodes are persisted through the
//! caller-supplied [`IndexStore`](crate::store::IndexStore) before the
//! mutating call returns.

pub mod block;
pub mod entry;
pub mod header;
pub(crate) mod node;


use std::cmp::Ordering;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::error::{IndexError, Result};
use crate::store::IndexStore;
use crate::types::Vcn;
use block::BlockAllocator;
use entry::IndexEntry;
use header::{round_up_8, HEADER_LEN};
use node::{Node, NodeIdx};

/// Caller-supplied ordering over raw key bytes.
pub trait KeyOrdering {
    /// Three-way comparison of two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Plain lexicographic byte ordering.
pub struct BytewiseOrdering;

impl KeyOrdering for BytewiseOrdering {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Configuration for an index.
#[derive(Clone, Debug)]
pub struct IndexOptions {
    /// Size in bytes of one non-resident block, container header included.
    pub block_size: usize,
    /// Bytes available to the resident root's serialized form.
    pub root_capacity: usize,
    /// Whether entries carry the fixed 8-byte file-reference trailer
    /// instead of inline data.
    pub file_index: bool,
    /// Optional ceiling on the number of allocated blocks.
    pub max_blocks: Option<u64>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            root_capacity: 1024,
            file_index: false,
            max_blocks: None,
        }
    }
}

/// Space the resident root's enclosing attribute consumes before the
/// node header.
const ROOT_STORAGE_OVERHEAD: usize = 16;

pub(crate) const ROOT: NodeIdx = NodeIdx(0);

/// An NTFS-style B+Tree index over a caller-supplied byte range.
pub struct Index<S: IndexStore> {
    store: S,
    ordering: Box<dyn KeyOrdering>,
    opts: IndexOptions,
    arena: Vec<Node>,
    free_slots: Vec<usize>,
    cache: FxHashMap<Vcn, NodeIdx>,
    alloc: BlockAllocator,
    alloc_dirty: bool,
}

impl<S: IndexStore> Index<S> {
    /// Create a fresh index: a resident root holding a single `END`
    /// sentinel, persisted immediately.
    pub fn create(store: S, ordering: Box<dyn KeyOrdering>, opts: IndexOptions) -> Result<Self> {
        validate_options(&opts)?;
        let mut root = Node::fresh(ROOT_STORAGE_OVERHEAD, opts.root_capacity)?;
        root.dirty = true;
        let mut index = Self {
            store,
            ordering,
            opts: opts.clone(),
            arena: vec![root],
            free_slots: Vec::new(),
            cache: FxHashMap::default(),
            alloc: BlockAllocator::new(opts.max_blocks),
            alloc_dirty: true,
        };
        index.flush()?;
        Ok(index)
    }

    /// Open an existing index from its persisted root and bitmap. Child
    /// blocks are materialized lazily on first descent.
    pub fn open(mut store: S, ordering: Box<dyn KeyOrdering>, opts: IndexOptions) -> Result<Self> {
        validate_options(&opts)?;
        let root_bytes = store.read_root()?;
        let root = Node::from_bytes(&root_bytes, opts.file_index, opts.root_capacity)?;
        let bitmap = store.read_bitmap()?;
        let alloc = BlockAllocator::from_bytes(bitmap, opts.max_blocks);
        Ok(Self {
            store,
            ordering,
            opts,
            arena: vec![root],
            free_slots: Vec::new(),
            cache: FxHashMap::default(),
            alloc,
            alloc_dirty: false,
        })
    }

    /// Give the backing store back, e.g. to reopen the index later.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Look up `key`, returning a copy of its data if present.
    pub fn try_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .find_entry(ROOT, key)?
            .map(|(idx, pos)| self.arena[idx.0].entries[pos].data().to_vec()))
    }

    /// Insert a new key. Fails with [`IndexError::Conflict`] if the key
    /// already exists; the tree is left unmodified.
    pub fn insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(IndexError::Invalid("key must be non-empty"));
        }
        if self.opts.file_index && data.len() != 8 {
            return Err(IndexError::Invalid(
                "file-indexed entry data must be an 8-byte reference",
            ));
        }
        let entry = IndexEntry::new(key.to_vec(), data.to_vec());
        // A divided node must still hold two entries of this size plus
        // the sentinel, or splitting could never restore the capacity
        // invariant.
        let worst = entry.encoded_len(self.opts.file_index) + 8;
        if 2 * worst > self.block_capacity() - round_up_8(HEADER_LEN) - end_sentinel_len() {
            return Err(IndexError::Invalid("entry too large for index block"));
        }
        self.add_entry(ROOT, entry, false)?;
        self.flush()
    }

    /// Replace the data of an existing key in place. The serialized size
    /// of an entry is fixed once inserted; a different data length fails
    /// with [`IndexError::Unsupported`].
    pub fn update(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        let (idx, pos) = self.find_entry(ROOT, key)?.ok_or(IndexError::NotFound)?;
        let entry = &mut self.arena[idx.0].entries[pos];
        if entry.data().len() != data.len() {
            return Err(IndexError::Unsupported(
                "update may not change an entry's serialized size",
            ));
        }
        entry.set_data(data.to_vec());
        self.arena[idx.0].dirty = true;
        self.flush()
    }

    /// Remove `key` if present. Returns whether anything was deleted.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let removed = self.remove_entry(ROOT, key)?;
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    /// Flatten the whole tree in comparator order into `(key, data)`
    /// pairs.
    pub fn entries(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.collect_entries(ROOT, &mut out)?;
        Ok(out)
    }

    fn block_capacity(&self) -> usize {
        self.opts.block_size - block::BLOCK_HDR_LEN
    }

    fn space_used(&self, idx: NodeIdx) -> usize {
        self.arena[idx.0].space_used(self.opts.file_index)
    }

    /// Check that the allocator can cover the worst structural cascade an
    /// overflow at `idx` can trigger: one divide per level up to the root,
    /// a depose, its follow-up divide, and a second depose when the
    /// promoted median overflows the fresh root. Failing here, before any
    /// entry has moved, is the only way a mutation may run out of blocks;
    /// a cascade that died halfway up would strand split-off siblings.
    fn ensure_headroom(&self, idx: NodeIdx) -> Result<()> {
        let mut depth = 0;
        let mut at = idx;
        while let Some(parent) = self.arena[at.0].parent {
            depth += 1;
            at = parent;
        }
        if !self.alloc.can_allocate(depth + 3) {
            return Err(IndexError::Exhausted(
                "not enough free blocks for a structural change",
            ));
        }
        Ok(())
    }

    /// Expose whether a child block is already materialized. Never loads;
    /// structural shuffles use this to skip re-parenting work for blocks
    /// that were never touched.
    fn cached_child(&self, vcn: Vcn) -> Option<NodeIdx> {
        self.cache.get(&vcn).copied()
    }

    /// Materialize the block at `vcn` (or return the cached node) as a
    /// child of `parent`.
    fn load_child(&mut self, parent: NodeIdx, vcn: Vcn) -> Result<NodeIdx> {
        if let Some(idx) = self.cached_child(vcn) {
            return Ok(idx);
        }
        let mut buf = vec![0u8; self.opts.block_size];
        self.store.read_block(vcn, &mut buf)?;
        let payload = block::decode_block(&buf, vcn)?;
        let mut node = Node::from_bytes(payload, self.opts.file_index, self.block_capacity())?;
        node.parent = Some(parent);
        node.vcn = Some(vcn);
        let idx = self.push_node(node);
        self.cache.insert(vcn, idx);
        Ok(idx)
    }

    fn push_node(&mut self, node: Node) -> NodeIdx {
        match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot] = node;
                NodeIdx(slot)
            }
            None => {
                self.arena.push(node);
                NodeIdx(self.arena.len() - 1)
            }
        }
    }

    fn release_node(&mut self, idx: NodeIdx) {
        let node = &mut self.arena[idx.0];
        node.entries.clear();
        node.parent = None;
        node.vcn = None;
        node.dirty = false;
        self.free_slots.push(idx.0);
    }

    /// Classic descent: equal → found here; less-than into a pointer
    /// entry → recurse; less-than into a leaf position → absent.
    fn find_entry(&mut self, idx: NodeIdx, key: &[u8]) -> Result<Option<(NodeIdx, usize)>> {
        let count = self.arena[idx.0].entries.len();
        for pos in 0..count {
            let (is_end, child) = {
                let e = &self.arena[idx.0].entries[pos];
                (e.is_end(), e.child())
            };
            if !is_end {
                match self
                    .ordering
                    .compare(key, self.arena[idx.0].entries[pos].key())
                {
                    Ordering::Equal => return Ok(Some((idx, pos))),
                    Ordering::Greater => continue,
                    Ordering::Less => {}
                }
            }
            // Key sorts below this entry (the sentinel counts as
            // infinitely large): descend or give up.
            return match child {
                Some(vcn) => {
                    let c = self.load_child(idx, vcn)?;
                    self.find_entry(c, key)
                }
                None => Ok(None),
            };
        }
        Err(IndexError::Corruption("node missing end entry"))
    }

    /// Insert `entry` under `idx`. Normal inserts chase pointer entries
    /// down to a leaf position; promotion inserts (medians from a divide,
    /// entries folded by a merge) land in this node directly.
    fn add_entry(&mut self, idx: NodeIdx, entry: IndexEntry, promoting: bool) -> Result<()> {
        let count = self.arena[idx.0].entries.len();
        let mut target = None;
        for pos in 0..count {
            let (is_end, child) = {
                let e = &self.arena[idx.0].entries[pos];
                (e.is_end(), e.child())
            };
            let order = if is_end {
                Ordering::Greater
            } else {
                self.ordering
                    .compare(self.arena[idx.0].entries[pos].key(), entry.key())
            };
            match order {
                Ordering::Equal => return Err(IndexError::Conflict("key already present in index")),
                Ordering::Greater => {
                    target = Some((pos, child));
                    break;
                }
                Ordering::Less => {}
            }
        }
        let (pos, child) = target.ok_or(IndexError::Corruption("node missing end entry"))?;
        if let (Some(vcn), false) = (child, promoting) {
            let c = self.load_child(idx, vcn)?;
            return self.add_entry(c, entry, false);
        }
        self.arena[idx.0].entries.insert(pos, entry);
        self.arena[idx.0].dirty = true;
        if self.space_used(idx) > self.arena[idx.0].capacity {
            // Promotions ride on the headroom reserved by the operation
            // that started the cascade; only a fresh insert reserves.
            if !promoting {
                if let Err(err) = self.ensure_headroom(idx) {
                    self.arena[idx.0].entries.remove(pos);
                    return Err(err);
                }
            }
            if self.arena[idx.0].parent.is_none() {
                self.depose()?;
            } else {
                self.divide(idx)?;
            }
        }
        Ok(())
    }

    /// Non-root split: move the lower half into a fresh sibling block and
    /// promote the median, now pointing at the sibling, into the parent.
    fn divide(&mut self, idx: NodeIdx) -> Result<()> {
        let parent = self.arena[idx.0]
            .parent
            .ok_or(IndexError::Invalid("divide called on the root node"))?;
        // Allocate before touching any entry so an exhausted free list
        // leaves the tree untouched.
        let new_vcn = self.alloc.allocate()?;
        self.alloc_dirty = true;
        let mid = self.arena[idx.0].entries.len() / 2;
        let mut moved: Vec<IndexEntry> = self.arena[idx.0].entries.drain(..mid).collect();
        let mut median = self.arena[idx.0].entries.remove(0);
        if median.is_end() {
            return Err(IndexError::Corruption("divide selected the end entry"));
        }
        // The sibling inherits the median's subtree through its sentinel:
        // keys there are below the median but above the sibling's own.
        let mut sentinel = IndexEntry::end();
        sentinel.set_child(median.child());
        moved.push(sentinel);
        let moved_children: SmallVec<[Vcn; 8]> =
            moved.iter().filter_map(IndexEntry::child).collect();
        let mut sibling = Node::fresh(0, self.block_capacity())?;
        sibling.entries = moved;
        sibling.parent = Some(parent);
        sibling.vcn = Some(new_vcn);
        sibling.dirty = true;
        let sibling_idx = self.push_node(sibling);
        self.cache.insert(new_vcn, sibling_idx);
        for vcn in moved_children {
            if let Some(child) = self.cached_child(vcn) {
                self.arena[child.0].parent = Some(sibling_idx);
            }
        }
        self.arena[idx.0].dirty = true;
        median.set_child(Some(new_vcn));
        trace!(
            target: "ntfs_index::node",
            sibling = new_vcn.0,
            "divided node, promoting median into parent"
        );
        self.add_entry(parent, median, true)
    }

    /// Root-only overflow handling: move the entire root content into one
    /// fresh block and leave the root as a single pointer sentinel,
    /// deepening the tree by one level.
    fn depose(&mut self) -> Result<()> {
        if self.arena[ROOT.0].entries.len() == 1 {
            return Ok(());
        }
        let new_vcn = self.alloc.allocate()?;
        self.alloc_dirty = true;
        let entries = std::mem::take(&mut self.arena[ROOT.0].entries);
        let moved_children: SmallVec<[Vcn; 8]> =
            entries.iter().filter_map(IndexEntry::child).collect();
        let mut child = Node::fresh(0, self.block_capacity())?;
        child.entries = entries;
        child.parent = Some(ROOT);
        child.vcn = Some(new_vcn);
        child.dirty = true;
        let child_idx = self.push_node(child);
        self.cache.insert(new_vcn, child_idx);
        for vcn in moved_children {
            if let Some(grandchild) = self.cached_child(vcn) {
                self.arena[grandchild.0].parent = Some(child_idx);
            }
        }
        let mut sentinel = IndexEntry::end();
        sentinel.set_child(Some(new_vcn));
        self.arena[ROOT.0].entries = vec![sentinel];
        self.arena[ROOT.0].dirty = true;
        trace!(target: "ntfs_index::node", child = new_vcn.0, "deposed root into child block");
        if self.space_used(child_idx) > self.arena[child_idx.0].capacity {
            self.divide(child_idx)?;
        }
        Ok(())
    }

    /// Remove `key` from the subtree at `idx`. Internal matches are
    /// replaced by their in-order predecessor; leaf matches are removed
    /// outright. Every level that changed rebalances before returning.
    fn remove_entry(&mut self, idx: NodeIdx, key: &[u8]) -> Result<bool> {
        let count = self.arena[idx.0].entries.len();
        for pos in 0..count {
            let (is_end, child) = {
                let e = &self.arena[idx.0].entries[pos];
                (e.is_end(), e.child())
            };
            let order = if is_end {
                Ordering::Greater
            } else {
                self.ordering
                    .compare(self.arena[idx.0].entries[pos].key(), key)
            };
            match order {
                Ordering::Equal => {
                    if let Some(vcn) = child {
                        let matched = self.arena[idx.0].entries[pos].key().to_vec();
                        let c = self.load_child(idx, vcn)?;
                        let (pred_key, pred_data) = self.find_biggest_leaf(c)?;
                        // A longer predecessor key makes the substituted
                        // entry outgrow the node; the divide it forces must
                        // have its blocks before anything is removed.
                        let old_len =
                            self.arena[idx.0].entries[pos].encoded_len(self.opts.file_index);
                        let mut grown = IndexEntry::new(pred_key.clone(), pred_data.clone());
                        grown.set_child(Some(vcn));
                        let new_len = grown.encoded_len(self.opts.file_index);
                        if self.space_used(idx) - old_len + new_len > self.arena[idx.0].capacity {
                            self.ensure_headroom(idx)?;
                        }
                        if !self.remove_entry(c, &pred_key)? {
                            return Err(IndexError::Corruption(
                                "predecessor vanished during delete",
                            ));
                        }
                        // Removing the predecessor can promote a median
                        // into this node and shift positions.
                        let pos = self
                            .arena[idx.0]
                            .entries
                            .iter()
                            .position(|e| {
                                !e.is_end()
                                    && self.ordering.compare(e.key(), &matched) == Ordering::Equal
                            })
                            .ok_or(IndexError::Corruption(
                                "matched entry vanished during delete",
                            ))?;
                        self.arena[idx.0].entries[pos].set_key_data(pred_key, pred_data);
                    } else {
                        self.arena[idx.0].entries.remove(pos);
                    }
                    self.arena[idx.0].dirty = true;
                    // Substitution can grow the entry past the allocation
                    // when the predecessor's key is longer.
                    if self.space_used(idx) > self.arena[idx.0].capacity {
                        if self.arena[idx.0].parent.is_none() {
                            self.depose()?;
                        } else {
                            self.divide(idx)?;
                        }
                    }
                    self.rebalance(idx)?;
                    return Ok(true);
                }
                Ordering::Greater => {
                    if let Some(vcn) = child {
                        let c = self.load_child(idx, vcn)?;
                        if self.remove_entry(c, key)? {
                            self.arena[idx.0].dirty = true;
                            self.rebalance(idx)?;
                            return Ok(true);
                        }
                    }
                    // Entries ascend; nothing later can match.
                    return Ok(false);
                }
                Ordering::Less => {}
            }
        }
        Err(IndexError::Corruption("node missing end entry"))
    }

    /// In-order predecessor of a subtree: descend the sentinel's child
    /// chain to the rightmost node and take its second-to-last entry.
    fn find_biggest_leaf(&mut self, idx: NodeIdx) -> Result<(Vec<u8>, Vec<u8>)> {
        let sentinel_child = self.arena[idx.0]
            .entries
            .last()
            .and_then(IndexEntry::child);
        if let Some(vcn) = sentinel_child {
            let c = self.load_child(idx, vcn)?;
            return self.find_biggest_leaf(c);
        }
        let entries = &self.arena[idx.0].entries;
        if entries.len() < 2 {
            return Err(IndexError::Corruption("subtree has no predecessor entry"));
        }
        let predecessor = &entries[entries.len() - 2];
        Ok((predecessor.key().to_vec(), predecessor.data().to_vec()))
    }

    /// Fold in every child whose entire content now fits in this node's
    /// free space. May fire zero or several merges; cascading deletions
    /// re-run it at each level.
    fn rebalance(&mut self, idx: NodeIdx) -> Result<()> {
        'restart: loop {
            let count = self.arena[idx.0].entries.len();
            for pos in 0..count {
                let Some(vcn) = self.arena[idx.0].entries[pos].child() else {
                    continue;
                };
                let child = self.load_child(idx, vcn)?;
                let (folded_size, sentinel_has_child) = {
                    let node = &self.arena[child.0];
                    let folded: usize = node
                        .entries
                        .iter()
                        .filter(|e| !e.is_end())
                        .map(|e| e.encoded_len(self.opts.file_index))
                        .sum();
                    let keeps_trailer = node.entries.last().is_some_and(IndexEntry::has_child);
                    (folded, keeps_trailer)
                };
                // Absorbing drops this entry's 8-byte child trailer
                // unless the child's sentinel passes one on.
                let trailer_saving = if sentinel_has_child { 0 } else { 8 };
                if self.space_used(idx) + folded_size
                    <= self.arena[idx.0].capacity + trailer_saving
                {
                    self.merge(idx, pos, child)?;
                    continue 'restart;
                }
            }
            return Ok(());
        }
    }

    /// Absorb the child at entry `pos` into this node and free its block.
    fn merge(&mut self, idx: NodeIdx, pos: usize, child: NodeIdx) -> Result<()> {
        let vcn = self.arena[child.0]
            .vcn
            .ok_or(IndexError::Corruption("merge target is not a block node"))?;
        let mut folded = std::mem::take(&mut self.arena[child.0].entries);
        let sentinel = folded
            .pop()
            .ok_or(IndexError::Corruption("child node without entries"))?;
        if !sentinel.is_end() {
            return Err(IndexError::Corruption("child node missing end entry"));
        }
        self.arena[idx.0].entries[pos].set_child(sentinel.child());
        self.arena[idx.0].dirty = true;
        let grandchildren: SmallVec<[Vcn; 8]> = folded
            .iter()
            .filter_map(IndexEntry::child)
            .chain(sentinel.child())
            .collect();
        for gv in grandchildren {
            if let Some(grandchild) = self.cached_child(gv) {
                self.arena[grandchild.0].parent = Some(idx);
            }
        }
        for entry in folded {
            self.add_entry(idx, entry, true)?;
        }
        self.cache.remove(&vcn);
        self.release_node(child);
        self.alloc.free(vcn)?;
        self.alloc_dirty = true;
        trace!(target: "ntfs_index::node", block = vcn.0, "merged child block into parent");
        Ok(())
    }

    fn collect_entries(&mut self, idx: NodeIdx, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let count = self.arena[idx.0].entries.len();
        for pos in 0..count {
            let (is_end, child) = {
                let e = &self.arena[idx.0].entries[pos];
                (e.is_end(), e.child())
            };
            if let Some(vcn) = child {
                let c = self.load_child(idx, vcn)?;
                self.collect_entries(c, out)?;
            }
            if !is_end {
                let e = &self.arena[idx.0].entries[pos];
                out.push((e.key().to_vec(), e.data().to_vec()));
            }
        }
        Ok(())
    }

    fn store_node(&mut self, idx: NodeIdx) -> Result<()> {
        let (bytes, vcn) = {
            let node = &self.arena[idx.0];
            (node.serialize(self.opts.file_index)?, node.vcn)
        };
        match vcn {
            None => self.store.write_root(&bytes),
            Some(vcn) => {
                let image = block::encode_block(vcn, &bytes, self.opts.block_size)?;
                self.store.write_block(vcn, &image)
            }
        }
    }

    /// Persist every node the current mutation touched, plus the
    /// allocation bitmap if it changed.
    fn flush(&mut self) -> Result<()> {
        for slot in 0..self.arena.len() {
            if self.arena[slot].dirty {
                self.store_node(NodeIdx(slot))?;
                self.arena[slot].dirty = false;
            }
        }
        if self.alloc_dirty {
            self.store.write_bitmap(self.alloc.as_bytes())?;
            self.alloc_dirty = false;
        }
        Ok(())
    }
}

fn end_sentinel_len() -> usize {
    // Sentinel with a child trailer.
    24
}

fn validate_options(opts: &IndexOptions) -> Result<()> {
    let min_root = round_up_8(HEADER_LEN + ROOT_STORAGE_OVERHEAD) + end_sentinel_len();
    if opts.root_capacity < min_root {
        return Err(IndexError::Invalid("root capacity too small"));
    }
    let min_block = block::BLOCK_HDR_LEN + round_up_8(HEADER_LEN) + end_sentinel_len() + 64;
    if opts.block_size < min_block {
        return Err(IndexError::Invalid("block size too small"));
    }
    // Deposing moves the whole root into one block; a root allowed to
    // outgrow a block's payload could never be shed by a single divide.
    if opts.root_capacity > opts.block_size - block::BLOCK_HDR_LEN {
        return Err(IndexError::Invalid("root capacity exceeds block payload"));
    }
    Ok(())
}
