//! The concurrent copy-on-write B+ tree itself (C4).
//!
//! `get` descends optimistically: it samples a child pointer and the
//! parent's version together, keeps a stack of (node, version) it has
//! passed through, and re-validates the parent's version before trusting
//! what it read from the child. A stale read walks back up the stack to
//! the last node whose version still matches and resumes from there,
//! rather than restarting from the root.
//!
//! `put` and `erase` lock-couple down the tree: each level holds its own
//! lock, reads which child to descend into, and locks that child *before*
//! releasing its own lock, so the two are always briefly held together.
//! A sibling operation can never retire or drain a child out from under a
//! descent that has already committed to it. Splitting and merging happen
//! on the way back up once the recursive call reports what the child
//! needed. A split or a fix that reaches the root is reported back to the
//! caller, which swaps in a new root under the tree-level mutex and
//! retries the whole operation; root changes are rare enough that a full
//! retry costs nothing the way it would for an interior node.
//!
//! Grounded on `bpt.cpp`'s `Bpt::get`/`Bpt::put`/`Bpt::erase` for the
//! descent and rebalancing algorithms, reworked from its parent/version
//! stack and `goto retry` control flow into structured Rust recursion.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::key::{bytes_from, Bytes, Comparator};
use crate::node::{Node, NodeGuard};
use crate::node_manager::NodeManager;
use crate::node_map::InternalMap;

pub struct Tree {
    comparator: Arc<dyn Comparator>,
    node_manager: Arc<NodeManager>,
    root: Mutex<Arc<Node>>,
    branching_factor: usize,
}

/// What a single level reports back to its caller after handling its child.
enum Propagate {
    Done,
    /// The child this level owns split; carries the new right sibling and
    /// the separator key the caller must insert.
    Split(Bytes, Arc<Node>),
    /// The child this level owns underflowed and was fixed, but this level
    /// itself now underflows too (only possible once lock-coupling reaches
    /// back up to the root).
    RootUnderflow,
}

impl Tree {
    pub fn new(
        comparator: Arc<dyn Comparator>,
        node_manager: Arc<NodeManager>,
        root: Arc<Node>,
        branching_factor: usize,
    ) -> Self {
        Self {
            comparator,
            node_manager,
            root: Mutex::new(root),
            branching_factor,
        }
    }

    pub fn root_node_id(&self) -> crate::node::NodeId {
        self.root.lock().node_id()
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root.lock())
    }

    /// Optimistic read (§4.3): validated against the version of the last
    /// node passed through, retrying from there rather than from the root
    /// on a stale observation.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        loop {
            let mut stack: Vec<(Arc<Node>, u64)> = Vec::new();
            let mut current = self.root();

            loop {
                let is_leaf = current.lock().is_leaf();
                let (outcome, version) = if is_leaf {
                    let (value, v) = current.get_leaf_value(&*self.comparator, key);
                    (Ok(value), v)
                } else {
                    let (child_id, v) = current.get_internal_child(&*self.comparator, key);
                    (Err(child_id), v)
                };

                let parent_ok = match stack.last() {
                    Some((parent, parent_version)) => parent.check_version(*parent_version),
                    None => Arc::ptr_eq(&current, &self.root()),
                };

                if !parent_ok {
                    // Roll back to the last ancestor whose version still
                    // holds, or restart from the root if none does.
                    match stack.pop() {
                        Some((node, _)) => {
                            current = node;
                            continue;
                        }
                        None => break,
                    }
                }

                match outcome {
                    Ok(value) => return Ok(value),
                    Err(child_id) => {
                        stack.push((Arc::clone(&current), version));
                        current = self.node_manager.get(child_id)?;
                    }
                }
            }
            // Root itself changed under us; restart the whole descent.
        }
    }

    pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        loop {
            let root = self.root();
            let guard = root.lock();
            match self.put_into(&root, guard, &key, &value)? {
                Propagate::Done => return Ok(()),
                Propagate::Split(sep_key, new_right) => {
                    let mut map = InternalMap::new(root.node_id());
                    map.put(&*self.comparator, sep_key, new_right.node_id());
                    let new_root = self.node_manager.allocate_internal(map);
                    *self.root.lock() = new_root;
                }
                Propagate::RootUnderflow => unreachable!("put never underflows"),
            }
        }
    }

    /// `guard` is `node`'s lock, already held by the caller. The coupling
    /// invariant (§4.2): before this guard is released, the child's own
    /// lock is acquired first, so there is always a moment where both are
    /// held together and a sibling operation can never observe `node`'s
    /// child pointer and the child's contents out of step.
    fn put_into(&self, node: &Arc<Node>, mut guard: NodeGuard<'_>, key: &Bytes, value: &Bytes) -> Result<Propagate> {
        if guard.is_leaf() {
            guard
                .leaf_map_mut()
                .put(&*self.comparator, Bytes::clone(key), Bytes::clone(value));
            guard.mark_mutated();
            if !guard.need_split(self.branching_factor) {
                return Ok(Propagate::Done);
            }
            let (new_right, sep_key) = self.split_leaf(&mut guard);
            return Ok(Propagate::Split(sep_key, new_right));
        }

        let child_id = guard.internal_map().get(&*self.comparator, key);
        let child = self.node_manager.get(child_id)?;
        let child_guard = child.lock();
        drop(guard);

        match self.put_into(&child, child_guard, key, value)? {
            Propagate::Done => Ok(Propagate::Done),
            Propagate::Split(sep_key, new_right) => {
                let mut guard = node.lock();
                guard
                    .internal_map_mut()
                    .put(&*self.comparator, sep_key, new_right.node_id());
                guard.mark_mutated();
                if !guard.need_split(self.branching_factor) {
                    return Ok(Propagate::Done);
                }
                let (new_right2, sep_key2) = self.split_internal(&mut guard);
                Ok(Propagate::Split(sep_key2, new_right2))
            }
            Propagate::RootUnderflow => unreachable!("put never underflows"),
        }
    }

    fn split_leaf(&self, guard: &mut NodeGuard<'_>) -> (Arc<Node>, Bytes) {
        let (right_map, split_key) = guard.leaf_map_mut().split();
        guard.mark_mutated();
        let new_right = self.node_manager.allocate_leaf(right_map);
        (new_right, split_key)
    }

    fn split_internal(&self, guard: &mut NodeGuard<'_>) -> (Arc<Node>, Bytes) {
        let (right_map, promoted) = guard.internal_map_mut().split();
        guard.mark_mutated();
        let new_right = self.node_manager.allocate_internal(right_map);
        (new_right, promoted)
    }

    pub fn erase(&self, key: &[u8]) -> Result<()> {
        loop {
            let root = self.root();
            let guard = root.lock();
            match self.erase_from(&root, guard, true, key)? {
                Propagate::Done => return Ok(()),
                Propagate::RootUnderflow => {
                    let guard = root.lock();
                    debug_assert!(!guard.is_leaf() && guard.size() == 1);
                    let sole_child = guard.internal_map().child_at(0);
                    drop(guard);
                    let sole_child = self.node_manager.get(sole_child)?;
                    *self.root.lock() = sole_child;
                    self.node_manager.retire(root.node_id());
                    // Loop again: the new (shrunk) root may itself be a
                    // leaf, or an internal node that is already fine.
                }
                Propagate::Split(..) => unreachable!("erase never splits"),
            }
        }
    }

    /// `guard` is `node`'s lock, already held by the caller; see
    /// `put_into` for the coupling invariant this preserves.
    fn erase_from(&self, node: &Arc<Node>, mut guard: NodeGuard<'_>, is_root: bool, key: &[u8]) -> Result<Propagate> {
        if guard.is_leaf() {
            guard.leaf_map_mut().erase(&*self.comparator, key);
            guard.mark_mutated();
            if guard.need_fix(is_root, self.branching_factor) {
                return Ok(Propagate::RootUnderflow);
            }
            return Ok(Propagate::Done);
        }

        let child_pos = guard.internal_map().position_for(&*self.comparator, key);
        let child_id = guard.internal_map().child_at(child_pos);
        let child = self.node_manager.get(child_id)?;
        let child_guard = child.lock();
        drop(guard);

        match self.erase_from(&child, child_guard, false, key)? {
            Propagate::Done => Ok(Propagate::Done),
            Propagate::RootUnderflow => {
                self.fix_child(node, child_pos, &child)?;
                let guard = node.lock();
                let needs_fix = guard.need_fix(is_root, self.branching_factor);
                drop(guard);
                if needs_fix {
                    Ok(Propagate::RootUnderflow)
                } else {
                    Ok(Propagate::Done)
                }
            }
            Propagate::Split(..) => unreachable!("erase never splits"),
        }
    }

    /// Rebalances an underflowing child (§4.4): try-right-borrow, else
    /// right-merge, else try-left-borrow, else left-merge. One of the two
    /// siblings always exists since a non-root node's parent has at least
    /// two children.
    fn fix_child(&self, parent: &Arc<Node>, child_pos: usize, child: &Arc<Node>) -> Result<()> {
        let mut parent_guard = parent.lock();

        if let Some((right_pos, _)) = parent_guard.internal_map().right_of(child_pos) {
            let right_id = parent_guard.internal_map().child_at(right_pos);
            let right_node = self.node_manager.get(right_id)?;
            let right_needs_fix = right_node.lock().need_fix(false, self.branching_factor);
            if !right_needs_fix {
                self.borrow_from_right(&mut parent_guard, child_pos, right_pos, child, &right_node);
            } else {
                self.merge_with_right(&mut parent_guard, right_pos, child, &right_node);
                self.node_manager.retire(right_node.node_id());
            }
            return Ok(());
        }

        if let Some((left_pos, _)) = parent_guard.internal_map().left_of(child_pos) {
            let left_id = parent_guard.internal_map().child_at(left_pos);
            let left_node = self.node_manager.get(left_id)?;
            let left_needs_fix = left_node.lock().need_fix(false, self.branching_factor);
            if !left_needs_fix {
                self.borrow_from_left(&mut parent_guard, left_pos, child_pos, &left_node, child);
            } else {
                self.merge_with_left(&mut parent_guard, child_pos, &left_node, child);
                self.node_manager.retire(child.node_id());
            }
            return Ok(());
        }

        unreachable!("non-root node without any sibling");
    }

    fn borrow_from_right(
        &self,
        parent_guard: &mut NodeGuard<'_>,
        child_pos: usize,
        right_pos: usize,
        child: &Arc<Node>,
        right_node: &Arc<Node>,
    ) {
        let mut child_guard = child.lock();
        let mut right_guard = right_node.lock();

        if child_guard.is_leaf() {
            let popped = right_guard.leaf_map_mut().pop_front();
            right_guard.mark_mutated();
            child_guard
                .leaf_map_mut()
                .put(&*self.comparator, popped.removed_key, popped.removed_value);
            child_guard.mark_mutated();
            let new_sep = popped
                .new_first_key
                .expect("right sibling keeps at least one entry after lending");
            parent_guard.internal_map_mut().set_key_at(right_pos, new_sep);
        } else {
            let (new_right_sep, borrowed_child) = right_guard.internal_map_mut().pop_front();
            right_guard.mark_mutated();
            let old_sep = parent_guard.internal_map().key_at(right_pos).clone();
            child_guard.internal_map_mut().push_front(borrowed_child, old_sep);
            child_guard.mark_mutated();
            parent_guard.internal_map_mut().set_key_at(right_pos, new_right_sep);
        }
        parent_guard.mark_mutated();
    }

    fn borrow_from_left(
        &self,
        parent_guard: &mut NodeGuard<'_>,
        left_pos: usize,
        child_pos: usize,
        left_node: &Arc<Node>,
        child: &Arc<Node>,
    ) {
        let mut left_guard = left_node.lock();
        let mut child_guard = child.lock();
        let _ = left_pos;

        if child_guard.is_leaf() {
            let (k, v) = left_guard.leaf_map_mut().pop_back();
            left_guard.mark_mutated();
            parent_guard.internal_map_mut().set_key_at(child_pos, k.clone());
            child_guard.leaf_map_mut().put(&*self.comparator, k, v);
            child_guard.mark_mutated();
        } else {
            let (popped_key, popped_child) = left_guard.internal_map_mut().pop_back();
            left_guard.mark_mutated();
            let sep_for_old_front = parent_guard.internal_map().key_at(child_pos).clone();
            child_guard.internal_map_mut().push_front(popped_child, sep_for_old_front);
            child_guard.mark_mutated();
            parent_guard.internal_map_mut().set_key_at(child_pos, popped_key);
        }
        parent_guard.mark_mutated();
    }

    /// `child` absorbs `right`; the separator between them is dropped from
    /// the parent.
    fn merge_with_right(
        &self,
        parent_guard: &mut NodeGuard<'_>,
        right_pos: usize,
        child: &Arc<Node>,
        right_node: &Arc<Node>,
    ) {
        let mut child_guard = child.lock();
        let mut right_guard = right_node.lock();

        if child_guard.is_leaf() {
            let mut right_map = std::mem::take(right_guard.leaf_map_mut());
            child_guard.leaf_map_mut().append_right(&mut right_map);
        } else {
            let sep_between = parent_guard.internal_map().key_at(right_pos).clone();
            let mut right_map = std::mem::take(right_guard.internal_map_mut());
            child_guard.internal_map_mut().append_right(&mut right_map, sep_between);
        }
        child_guard.mark_mutated();
        drop(right_guard);
        parent_guard.internal_map_mut().erase_at(right_pos);
        parent_guard.mark_mutated();
    }

    /// `left` absorbs `child`; the separator between them is dropped from
    /// the parent.
    fn merge_with_left(
        &self,
        parent_guard: &mut NodeGuard<'_>,
        child_pos: usize,
        left_node: &Arc<Node>,
        child: &Arc<Node>,
    ) {
        let mut left_guard = left_node.lock();
        let mut child_guard = child.lock();

        if left_guard.is_leaf() {
            let mut child_map = std::mem::take(child_guard.leaf_map_mut());
            left_guard.leaf_map_mut().append_right(&mut child_map);
        } else {
            let sep_between = parent_guard.internal_map().key_at(child_pos).clone();
            let mut child_map = std::mem::take(child_guard.internal_map_mut());
            left_guard.internal_map_mut().append_right(&mut child_map, sep_between);
        }
        left_guard.mark_mutated();
        drop(child_guard);
        parent_guard.internal_map_mut().erase_at(child_pos);
        parent_guard.mark_mutated();
    }

    /// Depth-first textual dump for tests and diagnostics only; never part
    /// of the durable format.
    pub fn debug_dump(&self) -> Result<String> {
        let mut out = String::new();
        self.dump_node(&self.root(), 0, &mut out)?;
        Ok(out)
    }

    fn dump_node(&self, node: &Arc<Node>, depth: usize, out: &mut String) -> Result<()> {
        let indent = "  ".repeat(depth);
        let guard = node.lock();
        if guard.is_leaf() {
            out.push_str(&format!(
                "{indent}leaf#{} [{} entries]\n",
                guard.node_id(),
                guard.leaf_map().len()
            ));
            drop(guard);
        } else {
            out.push_str(&format!(
                "{indent}internal#{} [{} children]\n",
                guard.node_id(),
                guard.internal_map().len()
            ));
            let children: Vec<_> = guard
                .internal_map()
                .entries()
                .iter()
                .map(|(_, c)| *c)
                .collect();
            drop(guard);
            for child_id in children {
                let child = self.node_manager.get(child_id)?;
                self.dump_node(&child, depth + 1, out)?;
            }
        }
        Ok(())
    }
}

/// Orders two key slices with the tree's injected comparator; a small
/// convenience used outside `Tree` by callers that only hold a comparator.
pub fn cmp_bytes(cmp: &dyn Comparator, a: &[u8], b: &[u8]) -> Ordering {
    cmp.compare(a, b)
}

pub fn empty_bytes() -> Bytes {
    bytes_from(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ByteComparator;
    use crate::node::Node;
    use crate::node_manager::NodeManager;
    use crate::node_map::LeafMap;
    use crate::page_store::FilePageStore;
    use tempfile::tempdir;

    fn new_tree(b: usize) -> (Tree, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(FilePageStore::open(dir.path(), true).unwrap());
        let node_manager = Arc::new(NodeManager::new(store, 1, 0));
        let root = Node::new_leaf(0, LeafMap::new(), true);
        node_manager.register(Arc::clone(&root));
        let tree = Tree::new(Arc::new(ByteComparator), node_manager, root, b);
        (tree, dir)
    }

    #[test]
    fn put_get_erase_round_trip() {
        let (tree, _dir) = new_tree(4);
        for i in 0..50u32 {
            let k = bytes_from(format!("key{i:04}").into_bytes());
            let v = bytes_from(format!("val{i}").into_bytes());
            tree.put(k, v).unwrap();
        }
        for i in 0..50u32 {
            let k = format!("key{i:04}").into_bytes();
            let v = tree.get(&k).unwrap().unwrap();
            assert_eq!(v.as_ref(), format!("val{i}").as_bytes());
        }
        for i in 0..50u32 {
            let k = format!("key{i:04}").into_bytes();
            tree.erase(&k).unwrap();
            assert!(tree.get(&k).unwrap().is_none());
        }
    }

    #[test]
    fn splitting_grows_tree_height_and_preserves_order() {
        let (tree, _dir) = new_tree(2);
        let mut keys: Vec<u32> = (0..200).collect();
        keys.reverse();
        for i in &keys {
            let k = bytes_from(format!("{i:05}").into_bytes());
            tree.put(k.clone(), k).unwrap();
        }
        for i in 0..200u32 {
            let k = format!("{i:05}").into_bytes();
            let v = tree.get(&k).unwrap().unwrap();
            assert_eq!(v.as_ref(), k.as_slice());
        }
    }

    #[test]
    fn erase_triggers_rebalancing_without_losing_keys() {
        let (tree, _dir) = new_tree(2);
        for i in 0..100u32 {
            let k = bytes_from(format!("{i:05}").into_bytes());
            tree.put(k.clone(), k).unwrap();
        }
        for i in (0..100u32).step_by(2) {
            let k = format!("{i:05}").into_bytes();
            tree.erase(&k).unwrap();
        }
        for i in 0..100u32 {
            let k = format!("{i:05}").into_bytes();
            let v = tree.get(&k).unwrap();
            if i % 2 == 0 {
                assert!(v.is_none());
            } else {
                assert_eq!(v.unwrap().as_ref(), k.as_slice());
            }
        }
    }

    #[test]
    fn overwriting_an_existing_key_updates_value() {
        let (tree, _dir) = new_tree(4);
        let k = bytes_from(*b"dup");
        tree.put(k.clone(), bytes_from(*b"v1")).unwrap();
        tree.put(k.clone(), bytes_from(*b"v2")).unwrap();
        assert_eq!(tree.get(b"dup").unwrap().unwrap().as_ref(), b"v2".as_ref());
    }

    /// Checks invariants 1-3: node size bounds, sorted order, and separator
    /// correctness, walking the whole tree from the root.
    fn check_node(
        node: &Arc<crate::node::Node>,
        node_manager: &NodeManager,
        cmp: &ByteComparator,
        b: usize,
        is_root: bool,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) {
        let guard = node.lock();
        let size = guard.size();
        if is_root {
            assert!(size <= 2 * b + 1, "root size {size} exceeds 2B+1");
        } else {
            assert!(
                (b..=2 * b).contains(&size),
                "node {} size {size} outside [{b}, {}]",
                guard.node_id(),
                2 * b
            );
        }

        if guard.is_leaf() {
            let entries = guard.leaf_map().entries();
            for w in entries.windows(2) {
                assert_eq!(cmp.compare(&w[0].0, &w[1].0), Ordering::Less, "leaf keys out of order");
            }
            for (k, _) in entries {
                if let Some(lo) = lower {
                    assert_ne!(cmp.compare(k, lo), Ordering::Less, "leaf key below separator lower bound");
                }
                if let Some(hi) = upper {
                    assert_eq!(cmp.compare(k, hi), Ordering::Less, "leaf key at/above separator upper bound");
                }
            }
            return;
        }

        let entries: Vec<_> = guard.internal_map().entries().to_vec();
        drop(guard);
        for w in entries[1..].windows(2) {
            assert_eq!(cmp.compare(&w[0].0, &w[1].0), Ordering::Less, "separators out of order");
        }
        for (j, (_, child_id)) in entries.iter().enumerate() {
            let child_lower = if j == 0 { lower } else { Some(entries[j].0.as_ref()) };
            let child_upper = if j + 1 < entries.len() {
                Some(entries[j + 1].0.as_ref())
            } else {
                upper
            };
            let child = node_manager.get(*child_id).unwrap();
            check_node(&child, node_manager, cmp, b, false, child_lower, child_upper);
        }
    }

    #[test]
    fn invariants_hold_after_mixed_puts_and_erases() {
        let b = 3;
        let dir = tempdir().unwrap();
        let store = Arc::new(FilePageStore::open(dir.path(), true).unwrap());
        let node_manager = Arc::new(NodeManager::new(store, 1, 0));
        let root = Node::new_leaf(0, LeafMap::new(), true);
        node_manager.register(Arc::clone(&root));
        let cmp = ByteComparator;
        let tree = Tree::new(Arc::new(cmp), Arc::clone(&node_manager), root, b);

        for i in 0..500u32 {
            let k = bytes_from(format!("k{:05}", (i * 37) % 500).into_bytes());
            tree.put(k.clone(), k).unwrap();
        }
        check_node(&tree.root(), &node_manager, &cmp, b, true, None, None);

        for i in 0..500u32 {
            if i % 3 == 0 {
                let k = format!("k{:05}", (i * 37) % 500).into_bytes();
                tree.erase(&k).unwrap();
            }
        }
        check_node(&tree.root(), &node_manager, &cmp, b, true, None, None);
    }
}
