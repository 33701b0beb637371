//! Node manager (C5): allocates node ids, fetches evicted nodes from the
//! page store at a pinned snapshot, serializes/deserializes nodes.
//!
//! No eviction policy is implemented (§9 open question), so "fetch" only
//! ever runs once per node id, the first time a child reference is
//! followed that the in-process registry hasn't seen yet (typically right
//! after open, while only the checkpoint root is resident). Once fetched a
//! node stays in the registry for the life of the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result, StorageError};
use crate::key::{bytes_from, Bytes};
use crate::node::{Node, NodeId, NodeKind};
use crate::node_map::{InternalMap, LeafMap};
use crate::page_store::{self, PageStore};
use crate::varint;

const PAGE_TYPE_LEAF: u32 = 0;
const PAGE_TYPE_INTERNAL: u32 = 1;

pub struct NodeManager {
    page_store: Arc<dyn PageStore>,
    next_node_id: AtomicU64,
    /// 0 once replay completes ("use latest"); pinned to a fixed sequence
    /// while recovery is reconstructing a pre-checkpoint view.
    snapshot_seq: RwLock<u64>,
    registry: RwLock<HashMap<NodeId, Arc<Node>>>,
}

impl NodeManager {
    pub fn new(page_store: Arc<dyn PageStore>, next_node_id: NodeId, snapshot_seq: u64) -> Self {
        Self {
            page_store,
            next_node_id: AtomicU64::new(next_node_id),
            snapshot_seq: RwLock::new(snapshot_seq),
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_node_id(&self) -> NodeId {
        self.next_node_id.load(Ordering::SeqCst)
    }

    pub fn set_snapshot_seq(&self, seq: u64) {
        *self.snapshot_seq.write() = seq;
    }

    /// Unpins the recovery snapshot once WAL replay completes; subsequent
    /// fetches observe the current page-store state.
    pub fn unpin_snapshot(&self) {
        *self.snapshot_seq.write() = 0;
    }

    fn allocate_id(&self) -> NodeId {
        self.next_node_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn allocate_leaf(&self, map: LeafMap) -> Arc<Node> {
        let id = self.allocate_id();
        let node = Node::new_leaf(id, map, true);
        self.registry.write().insert(id, Arc::clone(&node));
        node
    }

    pub fn allocate_internal(&self, map: InternalMap) -> Arc<Node> {
        let id = self.allocate_id();
        let node = Node::new_internal(id, map, true);
        self.registry.write().insert(id, Arc::clone(&node));
        node
    }

    /// Registers an externally constructed node under its own id (used for
    /// the checkpoint root reconstructed during recovery).
    pub fn register(&self, node: Arc<Node>) {
        self.registry.write().insert(node.node_id(), node);
    }

    /// Drops the registry's strong reference to a node absorbed by a merge;
    /// it is no longer reachable from the root, so nothing else should hold
    /// it once in-flight readers that observed it finish.
    pub fn retire(&self, node_id: NodeId) {
        self.registry.write().remove(&node_id);
    }

    /// Resolves a node id to its `Arc<Node>`, fetching from the page store
    /// and caching on first reference. Mirrors §4.5: the first encoded tag
    /// selects Leaf vs Internal; the remainder populates the node's map.
    pub fn get(&self, node_id: NodeId) -> Result<Arc<Node>> {
        if let Some(node) = self.registry.read().get(&node_id).cloned() {
            return Ok(node);
        }
        let snapshot_seq = *self.snapshot_seq.read();
        let key = node_id.to_le_bytes();
        let bytes = self
            .page_store
            .get(&key, snapshot_seq)?
            .ok_or_else(|| StorageError(format!("node {node_id} not found in page store")))?;
        let node = deserialize_node(node_id, &bytes)?;
        let mut registry = self.registry.write();
        let node = registry.entry(node_id).or_insert(node).clone();
        Ok(node)
    }

    /// Depth-first checkpoint traversal (§4.8): serializes and writes every
    /// dirty, in-memory node reachable from `root`, clearing its dirty flag.
    pub fn checkpoint(&self, root: &Arc<Node>) -> Result<()> {
        let mut stack = vec![Arc::clone(root)];
        while let Some(node) = stack.pop() {
            if !(node.in_memory() && node.dirty()) {
                continue;
            }
            let guard = node.lock();
            let payload = serialize_guard(&guard);
            let children: Vec<NodeId> = if guard.is_leaf() {
                Vec::new()
            } else {
                guard.internal_map().entries().iter().map(|(_, c)| *c).collect()
            };
            drop(guard);
            self.page_store.put(&node.node_id().to_le_bytes(), bytes_from(payload))?;
            node.set_dirty(false);
            for child_id in children {
                if let Some(child) = self.registry.read().get(&child_id).cloned() {
                    stack.push(child);
                }
            }
        }
        Ok(())
    }

    pub fn page_store(&self) -> &Arc<dyn PageStore> {
        &self.page_store
    }
}

fn serialize_guard(guard: &crate::node::NodeGuard<'_>) -> Vec<u8> {
    let mut buf = Vec::new();
    match &*guard.map_snapshot() {
        NodeKind::Leaf(map) => {
            varint::encode_u32(PAGE_TYPE_LEAF, &mut buf);
            varint::encode_u32(map.entries().len() as u32, &mut buf);
            for (k, v) in map.entries() {
                varint::encode_u32(k.len() as u32, &mut buf);
                buf.extend_from_slice(k);
                varint::encode_u32(v.len() as u32, &mut buf);
                buf.extend_from_slice(v);
            }
        }
        NodeKind::Internal(map) => {
            varint::encode_u32(PAGE_TYPE_INTERNAL, &mut buf);
            varint::encode_u32(map.entries().len() as u32, &mut buf);
            for (k, child) in map.entries() {
                varint::encode_u32(k.len() as u32, &mut buf);
                buf.extend_from_slice(k);
                buf.extend_from_slice(&child.to_le_bytes());
            }
        }
    }
    buf
}

fn deserialize_node(node_id: NodeId, buf: &[u8]) -> Result<Arc<Node>> {
    let mut pos = 0usize;
    let (page_type, n) = varint::decode_u32(&buf[pos..])?;
    pos += n;
    let (count, n) = varint::decode_u32(&buf[pos..])?;
    pos += n;
    let count = count as usize;

    match page_type {
        PAGE_TYPE_LEAF => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let (key_len, n) = varint::decode_u32(&buf[pos..])?;
                pos += n;
                let key_len = key_len as usize;
                let key = require_slice(buf, pos, key_len)?;
                pos += key_len;
                let (value_len, n) = varint::decode_u32(&buf[pos..])?;
                pos += n;
                let value_len = value_len as usize;
                let value = require_slice(buf, pos, value_len)?;
                pos += value_len;
                entries.push((bytes_from(key.to_vec()), bytes_from(value.to_vec())));
            }
            Ok(Node::new_leaf(node_id, LeafMap::from_entries(entries), false))
        }
        PAGE_TYPE_INTERNAL => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let (key_len, n) = varint::decode_u32(&buf[pos..])?;
                pos += n;
                let key_len = key_len as usize;
                let key = require_slice(buf, pos, key_len)?;
                pos += key_len;
                let child_bytes = require_slice(buf, pos, 8)?;
                pos += 8;
                let child = u64::from_le_bytes(child_bytes.try_into().unwrap());
                entries.push((bytes_from(key.to_vec()), child));
            }
            Ok(Node::new_internal(
                node_id,
                InternalMap::from_entries(entries),
                false,
            ))
        }
        other => Err(Error::Corruption(format!("unknown page type tag: {other}"))),
    }
}

fn require_slice(buf: &[u8], pos: usize, len: usize) -> Result<&[u8]> {
    if buf.len() < pos + len {
        return Err(Error::Corruption("page payload truncated".into()));
    }
    Ok(&buf[pos..pos + len])
}

pub use page_store::{
    KEY_LAST_CHECKPOINT_SNAPSHOT_SEQ, KEY_LAST_SEQ_IN_LAST_LOG_FILE, KEY_LOG_FILE_NUMBER,
    KEY_NEXT_NODE_ID, KEY_ROOT_PAGE_ID,
};
