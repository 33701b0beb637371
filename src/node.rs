//! Concurrency-safe node wrapper over a node map (C3).
//!
//! Every `Node` carries a node id, a version counter bumped on each local
//! mutation, a `parking_lot::Mutex` guarding the map pointer, and dirty /
//! in-memory flags. The map itself is held behind an `Arc` so optimistic
//! readers can clone the pointer under a brief lock and inspect it
//! lock-free afterwards; a writer that finds the map shared (`strong_count
//! > 1`) clones it before mutating (copy-on-write), which is what lets a
//! checkpoint traversal retain a stable view of old pages.
//!
//! Eviction is not implemented (see the open question in the node-manager
//! module): every `Node` that exists in the manager's registry is fully
//! loaded, so `in_memory` is always `true` in this build. The field is
//! kept because a future eviction policy would flip it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::key::{Bytes, Comparator};
use crate::node_map::{InternalMap, LeafMap};

pub type NodeId = u64;

#[derive(Debug, Clone)]
pub enum NodeKind {
    Leaf(LeafMap),
    Internal(InternalMap),
}

#[derive(Debug)]
pub struct Node {
    node_id: NodeId,
    is_leaf: bool,
    version: AtomicU64,
    dirty: AtomicBool,
    in_memory: AtomicBool,
    map: Mutex<Arc<NodeKind>>,
}

impl Node {
    pub fn new_leaf(node_id: NodeId, map: LeafMap, dirty: bool) -> Arc<Node> {
        Arc::new(Node {
            node_id,
            is_leaf: true,
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(dirty),
            in_memory: AtomicBool::new(true),
            map: Mutex::new(Arc::new(NodeKind::Leaf(map))),
        })
    }

    pub fn new_internal(node_id: NodeId, map: InternalMap, dirty: bool) -> Arc<Node> {
        Arc::new(Node {
            node_id,
            is_leaf: false,
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(dirty),
            in_memory: AtomicBool::new(true),
            map: Mutex::new(Arc::new(NodeKind::Internal(map))),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn in_memory(&self) -> bool {
        self.in_memory.load(Ordering::Acquire)
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, value: bool) {
        self.dirty.store(value, Ordering::Release);
    }

    /// Consistency check for optimistic readers: acquire-ordered load.
    pub fn check_version(&self, v: u64) -> bool {
        self.version.load(Ordering::Acquire) == v
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Optimistic leaf lookup: sample the map and version together under a
    /// brief lock, then release and let the caller validate against the
    /// parent's version.
    pub fn get_leaf_value(&self, cmp: &dyn Comparator, k: &[u8]) -> (Option<Bytes>, u64) {
        let guard = self.map.lock();
        let version = self.version.load(Ordering::Acquire);
        let map = Arc::clone(&guard);
        drop(guard);
        match &*map {
            NodeKind::Leaf(m) => (m.get(cmp, k), version),
            NodeKind::Internal(_) => unreachable!("get_leaf_value on internal node"),
        }
    }

    /// Optimistic internal lookup: returns the child id to descend into.
    pub fn get_internal_child(&self, cmp: &dyn Comparator, k: &[u8]) -> (NodeId, u64) {
        let guard = self.map.lock();
        let version = self.version.load(Ordering::Acquire);
        let map = Arc::clone(&guard);
        drop(guard);
        match &*map {
            NodeKind::Internal(m) => (m.get(cmp, k), version),
            NodeKind::Leaf(_) => unreachable!("get_internal_child on leaf node"),
        }
    }

    /// Takes the exclusive lock for lock-coupled writes. Also used (briefly)
    /// by the optimistic-read helpers above.
    pub fn lock(&self) -> NodeGuard<'_> {
        NodeGuard {
            node: self,
            guard: self.map.lock(),
        }
    }
}

pub struct NodeGuard<'a> {
    node: &'a Node,
    guard: MutexGuard<'a, Arc<NodeKind>>,
}

impl<'a> NodeGuard<'a> {
    pub fn node_id(&self) -> NodeId {
        self.node.node_id
    }

    pub fn is_leaf(&self) -> bool {
        self.node.is_leaf
    }

    pub fn size(&self) -> usize {
        match &**self.guard {
            NodeKind::Leaf(m) => m.len(),
            NodeKind::Internal(m) => m.len(),
        }
    }

    /// `size == 2B + 1`.
    pub fn need_split(&self, b: usize) -> bool {
        self.size() == 2 * b + 1
    }

    /// Root leaf never fixes; root internal fixes at size 1 (collapse);
    /// non-root fixes at size B.
    pub fn need_fix(&self, is_root: bool, b: usize) -> bool {
        if is_root {
            !self.node.is_leaf && self.size() == 1
        } else {
            self.size() == b
        }
    }

    pub fn leaf_map(&self) -> &LeafMap {
        match &**self.guard {
            NodeKind::Leaf(m) => m,
            NodeKind::Internal(_) => panic!("leaf_map on internal node"),
        }
    }

    pub fn internal_map(&self) -> &InternalMap {
        match &**self.guard {
            NodeKind::Internal(m) => m,
            NodeKind::Leaf(_) => panic!("internal_map on leaf node"),
        }
    }

    /// Copy-on-write: clones the map if another reference observes it
    /// (e.g. a checkpoint traversal holding the pre-mutation snapshot).
    fn cow(&mut self) -> &mut NodeKind {
        if Arc::strong_count(&self.guard) > 1 {
            let cloned = (**self.guard).clone();
            *self.guard = Arc::new(cloned);
        }
        Arc::get_mut(&mut self.guard).expect("sole owner of node map after copy-on-write")
    }

    pub fn leaf_map_mut(&mut self) -> &mut LeafMap {
        match self.cow() {
            NodeKind::Leaf(m) => m,
            NodeKind::Internal(_) => panic!("leaf_map_mut on internal node"),
        }
    }

    pub fn internal_map_mut(&mut self) -> &mut InternalMap {
        match self.cow() {
            NodeKind::Internal(m) => m,
            NodeKind::Leaf(_) => panic!("internal_map_mut on leaf node"),
        }
    }

    /// Records that this guard's map was mutated: bumps the version
    /// (release-ordered) and marks the node dirty for the next checkpoint.
    pub fn mark_mutated(&self) {
        self.node.bump_version();
        self.node.set_dirty(true);
    }

    /// Snapshot of the map behind an `Arc`, for serialization or append to
    /// a sibling without holding this guard's lock.
    pub fn map_snapshot(&self) -> Arc<NodeKind> {
        Arc::clone(&self.guard)
    }
}
