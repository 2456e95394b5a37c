//! Disk-resident B+tree index with latch-coupled concurrent access.
//!
//! The tree maps fixed-length keys to fixed-length values, one node per
//! page. Lookups couple shared latches down the tree, never holding more
//! than two nodes. Inserts run an optimistic pass with shared interior
//! latches first; when a full node is found the descent restarts with
//! exclusive latches and splits full nodes top-down, so a parent always
//! has room for its child's separator. After any split the whole
//! operation restarts from the root. Erase never merges under-full nodes;
//! the page-id space of the tree only grows.

mod node;
mod search;

pub use node::{Datum, InnerNode, InnerNodeRef, LeafNode, LeafNodeRef, NodeHeader};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use ferrite_buffer::{BufferManager, PageGuard};
use ferrite_common::{PageId, Result, PAGE_SIZE};

/// B+tree segment.
pub struct BTree<K, V> {
    segment_id: u16,
    buffer: Arc<BufferManager>,
    /// Packed page id of the root node.
    root: AtomicU64,
    /// Monotonic node allocator; tree pages are never reclaimed.
    node_count: AtomicU64,
    /// Height of the tree; 1 while the root is a leaf.
    height: AtomicU16,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: Datum + Ord, V: Datum> BTree<K, V> {
    /// Creates a tree with an empty leaf root in the given segment.
    pub fn new(segment_id: u16, buffer: Arc<BufferManager>) -> Result<Self> {
        let tree = Self {
            segment_id,
            buffer,
            root: AtomicU64::new(0),
            node_count: AtomicU64::new(0),
            height: AtomicU16::new(1),
            _marker: PhantomData,
        };

        let root_pid = tree.create_node_id();
        let mut guard = tree.buffer.fix_page(root_pid, true)?;
        LeafNode::<K, V>::init(guard.data_mut());
        tree.buffer.unfix_page(guard, true);
        tree.root.store(root_pid.as_u64(), Ordering::Release);

        Ok(tree)
    }

    /// Number of entries a leaf node holds.
    pub fn leaf_capacity() -> usize {
        node::leaf_capacity::<K, V>(PAGE_SIZE)
    }

    /// Number of children an inner node holds.
    pub fn inner_capacity() -> usize {
        node::inner_capacity::<K>(PAGE_SIZE)
    }

    /// Returns the current root page id.
    pub fn root_page(&self) -> PageId {
        PageId::from_u64(self.root.load(Ordering::Acquire))
    }

    /// Returns the current tree height.
    pub fn height(&self) -> u16 {
        self.height.load(Ordering::Acquire)
    }

    /// Allocates a fresh node page id.
    fn create_node_id(&self) -> PageId {
        let index = self.node_count.fetch_add(1, Ordering::SeqCst);
        PageId::new(self.segment_id, index)
    }

    /// Fixes the root, re-checking that it did not move between the
    /// snapshot and the fix. Returns None when the caller must restart.
    fn fix_root(&self, root_pid: u64, exclusive: bool) -> Result<Option<PageGuard>> {
        let guard = self
            .buffer
            .fix_page(PageId::from_u64(root_pid), exclusive)?;
        if self.root.load(Ordering::Acquire) != root_pid {
            // The root was replaced while we latched the old one.
            self.buffer.unfix_page(guard, false);
            return Ok(None);
        }
        Ok(Some(guard))
    }

    /// Installs a new inner root over a split node and bumps the height.
    fn grow_root(&self, level: u16, separator: K, left: u64, right: u64) -> Result<()> {
        let root_pid = self.create_node_id();
        let mut guard = self.buffer.fix_page(root_pid, true)?;
        InnerNode::<K>::init_root(guard.data_mut(), level, separator, left, right);
        self.root.store(root_pid.as_u64(), Ordering::Release);
        self.height.fetch_add(1, Ordering::AcqRel);
        self.buffer.unfix_page(guard, true);
        Ok(())
    }

    /// Looks up the value stored under a key.
    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        loop {
            let root_pid = self.root.load(Ordering::Acquire);
            let Some(mut current) = self.fix_root(root_pid, false)? else {
                continue;
            };
            let mut parent: Option<PageGuard> = None;

            while !NodeHeader::read(current.data()).is_leaf() {
                let child_pid = {
                    let inner = InnerNodeRef::<K>::new(current.data());
                    let (pos, _) = inner.lower_bound(key);
                    inner.child_at(pos)
                };

                // Latch coupling: drop the grandparent, then fix the child.
                if let Some(p) = parent.take() {
                    self.buffer.unfix_page(p, false);
                }
                let next = self.buffer.fix_page(PageId::from_u64(child_pid), false)?;
                parent = Some(std::mem::replace(&mut current, next));
            }

            let leaf = LeafNodeRef::<K, V>::new(current.data());
            let (pos, found) = leaf.lower_bound(key);
            let value = if found { Some(leaf.value_at(pos)) } else { None };

            if let Some(p) = parent.take() {
                self.buffer.unfix_page(p, false);
            }
            self.buffer.unfix_page(current, false);
            return Ok(value);
        }
    }

    /// Inserts an entry, overwriting the value if the key exists.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let mut exclusive = false;

        'restart: loop {
            let root_pid = self.root.load(Ordering::Acquire);
            let height = self.height.load(Ordering::Acquire);
            let Some(mut current) = self.fix_root(root_pid, exclusive || height == 1)? else {
                continue 'restart;
            };
            let mut current_pid = root_pid;
            let mut parent: Option<PageGuard> = None;

            loop {
                let header = NodeHeader::read(current.data());
                if header.is_leaf() {
                    break;
                }

                let child_pid = {
                    let inner = InnerNodeRef::<K>::new(current.data());
                    if !inner.has_space() {
                        None
                    } else {
                        let (pos, _) = inner.lower_bound(&key);
                        Some(inner.child_at(pos))
                    }
                };

                let Some(child_pid) = child_pid else {
                    // Full inner node on the path.
                    if !exclusive {
                        self.buffer.unfix_page(current, false);
                        if let Some(p) = parent.take() {
                            self.buffer.unfix_page(p, false);
                        }
                        exclusive = true;
                        continue 'restart;
                    }

                    let right_pid = self.create_node_id();
                    let mut right = self.buffer.fix_page(right_pid, true)?;
                    let separator = {
                        let mut left = InnerNode::<K>::new(current.data_mut());
                        left.split(right.data_mut())
                    };

                    match parent.take() {
                        Some(mut p) => {
                            InnerNode::<K>::new(p.data_mut())
                                .insert_split(separator, right_pid.as_u64());
                            self.buffer.unfix_page(p, true);
                        }
                        None => {
                            self.grow_root(
                                header.level + 1,
                                separator,
                                current_pid,
                                right_pid.as_u64(),
                            )?;
                        }
                    }

                    self.buffer.unfix_page(right, true);
                    self.buffer.unfix_page(current, true);
                    // Restart the whole descent rather than continuing
                    // into a changed subtree.
                    exclusive = false;
                    continue 'restart;
                };

                if let Some(p) = parent.take() {
                    self.buffer.unfix_page(p, false);
                }
                let child_exclusive = exclusive || header.level == 1;
                let next = self
                    .buffer
                    .fix_page(PageId::from_u64(child_pid), child_exclusive)?;
                parent = Some(std::mem::replace(&mut current, next));
                current_pid = child_pid;
            }

            if !LeafNodeRef::<K, V>::new(current.data()).has_space() {
                if !exclusive {
                    self.buffer.unfix_page(current, false);
                    if let Some(p) = parent.take() {
                        self.buffer.unfix_page(p, false);
                    }
                    exclusive = true;
                    continue 'restart;
                }

                let right_pid = self.create_node_id();
                let mut right = self.buffer.fix_page(right_pid, true)?;
                let separator = {
                    let mut left = LeafNode::<K, V>::new(current.data_mut());
                    left.split(right.data_mut())
                };

                match parent.take() {
                    Some(mut p) => {
                        InnerNode::<K>::new(p.data_mut())
                            .insert_split(separator, right_pid.as_u64());
                        self.buffer.unfix_page(p, true);
                    }
                    None => {
                        self.grow_root(1, separator, current_pid, right_pid.as_u64())?;
                    }
                }

                self.buffer.unfix_page(right, true);
                self.buffer.unfix_page(current, true);
                exclusive = false;
                continue 'restart;
            }

            LeafNode::<K, V>::new(current.data_mut()).insert(key, value);
            self.buffer.unfix_page(current, true);
            if let Some(p) = parent.take() {
                self.buffer.unfix_page(p, false);
            }
            return Ok(());
        }
    }

    /// Removes a key if present. Under-full leaves are left as they are.
    pub fn erase(&self, key: &K) -> Result<()> {
        loop {
            let root_pid = self.root.load(Ordering::Acquire);
            let height = self.height.load(Ordering::Acquire);
            let Some(mut current) = self.fix_root(root_pid, height == 1)? else {
                continue;
            };
            let mut parent: Option<PageGuard> = None;

            while !NodeHeader::read(current.data()).is_leaf() {
                let (level, child_pid) = {
                    let inner = InnerNodeRef::<K>::new(current.data());
                    let (pos, _) = inner.lower_bound(key);
                    (NodeHeader::read(current.data()).level, inner.child_at(pos))
                };

                if let Some(p) = parent.take() {
                    self.buffer.unfix_page(p, false);
                }
                let next = self
                    .buffer
                    .fix_page(PageId::from_u64(child_pid), level == 1)?;
                parent = Some(std::mem::replace(&mut current, next));
            }

            let erased = LeafNode::<K, V>::new(current.data_mut()).erase(key);

            if let Some(p) = parent.take() {
                self.buffer.unfix_page(p, false);
            }
            self.buffer.unfix_page(current, erased);
            return Ok(());
        }
    }
}
