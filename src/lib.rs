//! A latch-free Bw-tree ordered index.
//!
//! The tree maps comparable keys to multisets of opaque values and supports
//! ordered scans. Logical pages are named by stable page ids and represented
//! as delta chains: immutable linked records ending in a base node, with the
//! chain head published through an indirection table. Every mutation, from a
//! single record insert to a node split, is one compare-and-swap of a
//! mapping slot, so readers and writers never block each other.
//!
//! Superseded chains are handed to an epoch reclamation scheme
//! (`crossbeam::epoch`); every public entry point pins an epoch guard, so a
//! reader can keep walking a chain whose slot has already been swapped.
//!
//! Scans observe each leaf atomically but are not globally consistent
//! across leaves.

mod error;
mod mapping;
mod nodes;

#[cfg(test)]
mod proptests;

pub use crate::error::ConfigError;

/// Stable logical identifier of a page. Ids are allocated densely from zero
/// and never reused; the mapping a page id resolves through may change on
/// every mutation.
pub type PageId = u64;

/// Reserved "no page" sentinel.
pub(crate) const NULL_PID: PageId = PageId::MAX;

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::epoch::{self, Guard, Owned, Shared};
use tracing::{debug, trace};

use crate::mapping::MappingTable;
use crate::nodes::{Node, RecordOp, TreeNode};

/// Construction-time tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Nominal page payload in bytes; node fan-out limits are derived from
    /// it and the key/value sizes, with a floor of eight slots.
    pub node_bytes: usize,
    /// Delta chain length beyond which a page is consolidated into a fresh
    /// base node.
    pub max_chain_len: usize,
    /// Width of each mapping-table tier; the table addresses
    /// `2^(2 * mapping_tier_bits)` pages.
    pub mapping_tier_bits: u32,
    /// Reject inserts whose key is already present.
    pub unique_keys: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_bytes: 256,
            max_chain_len: 8,
            mapping_tier_bits: 10,
            unique_keys: false,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.node_bytes == 0 {
            return Err(ConfigError::ZeroNodeBytes);
        }
        if self.max_chain_len == 0 {
            return Err(ConfigError::ZeroChainLen);
        }
        if self.mapping_tier_bits == 0 || self.mapping_tier_bits > 16 {
            return Err(ConfigError::TierBitsOutOfRange(self.mapping_tier_bits));
        }
        Ok(())
    }
}

/// Fan-out limits derived from `Config::node_bytes` and the entry sizes.
#[derive(Debug, Clone, Copy)]
struct NodeLimits {
    leaf_max: usize,
    leaf_min: usize,
    inner_max: usize,
    inner_min: usize,
}

impl NodeLimits {
    fn for_entries<K, V>(node_bytes: usize) -> Self {
        let leaf_entry = (mem::size_of::<K>() + mem::size_of::<V>()).max(1);
        let inner_entry = (mem::size_of::<K>() + mem::size_of::<PageId>()).max(1);
        let leaf_max = (node_bytes / leaf_entry).max(8);
        let inner_max = (node_bytes / inner_entry).max(8);
        Self {
            leaf_max,
            leaf_min: leaf_max / 2,
            inner_max,
            inner_min: inner_max / 2,
        }
    }
}

type KeyPredicate<K> = Box<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// The Bw-tree engine, parameterized over externally supplied key
/// predicates.
///
/// Writers prepend record deltas and retry on contention; structure changes
/// (splits, consolidations) happen opportunistically on the threads that
/// notice the need for them. The only shared mutable words are the mapping
/// slots, the root id and the next-page counter, all moved by CAS.
pub struct BwTreeImpl<K, V>
where
    K: 'static + Clone + fmt::Debug,
    V: 'static + Clone + Eq + Hash + fmt::Debug,
{
    mapping: MappingTable<K, V>,
    key_less: KeyPredicate<K>,
    key_equal: KeyPredicate<K>,
    root: AtomicU64,
    /// Leftmost leaf; splits always keep the left half in place, so the
    /// entry point of the sibling chain never moves.
    head_leaf: PageId,
    unique_keys: bool,
    limits: NodeLimits,
    max_chain_len: usize,
}

impl<K, V> BwTreeImpl<K, V>
where
    K: 'static + Clone + fmt::Debug,
    V: 'static + Clone + Eq + Hash + fmt::Debug,
{
    /// Builds an empty tree from a strict-order predicate and an equality
    /// predicate over keys.
    pub fn with_comparators(
        config: Config,
        key_less: KeyPredicate<K>,
        key_equal: KeyPredicate<K>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let limits = NodeLimits::for_entries::<K, V>(config.node_bytes);
        let mapping = MappingTable::new(config.mapping_tier_bits);

        let guard = &epoch::pin();
        let first = TreeNode::new_leaf(None, None, NULL_PID, Vec::new(), Vec::new());
        let head_leaf = mapping
            .add(Owned::new(first), guard)
            .expect("fresh mapping table rejected the first leaf");

        debug!(
            leaf_max = limits.leaf_max,
            leaf_min = limits.leaf_min,
            inner_max = limits.inner_max,
            inner_min = limits.inner_min,
            "index initialized"
        );

        Ok(Self {
            mapping,
            key_less,
            key_equal,
            root: AtomicU64::new(head_leaf),
            head_leaf,
            unique_keys: config.unique_keys,
            limits,
            max_chain_len: config.max_chain_len,
        })
    }

    /// Inserts one `(key, value)` pair. Returns `false` only when the tree
    /// requires unique keys and `key` is already present.
    pub fn insert(&self, key: &K, mut value: V) -> bool {
        let guard = &epoch::pin();
        loop {
            self.split(key, guard);

            let path = self.search(key, guard);
            let Some(&leaf_pid) = path.last() else {
                continue;
            };
            let Some(head) = self.consolidate(leaf_pid, guard) else {
                continue;
            };
            let head_node = unsafe { head.deref() };

            if !self.key_in_node(key, head_node) {
                trace!(pid = leaf_pid, "insert raced a structure change");
                continue;
            }

            let key_present = self.key_is_in(key, head, guard);
            if self.unique_keys && key_present {
                return false;
            }

            let slot_use = head_node.slot_use + usize::from(!key_present);
            let mut delta = Owned::new(TreeNode::new_record(
                RecordOp::Insert,
                key.clone(),
                value,
                slot_use,
                head_node,
            ));
            delta.next.store(head, Ordering::Relaxed);

            match self.mapping.set(leaf_pid, head, delta, guard) {
                Ok(_) => return true,
                Err(delta) => {
                    trace!(pid = leaf_pid, "cas failed; retrying record insert");
                    value = match delta.into_box().node {
                        Node::Record { value, .. } => value,
                        _ => unreachable!(),
                    };
                }
            }
        }
    }

    /// Deletes one `(key, value)` pair. Returns `false` when the pair is
    /// absent. Deleting a value removes every copy of it under `key`.
    pub fn delete(&self, key: &K, value: &V) -> bool {
        let guard = &epoch::pin();
        loop {
            self.split(key, guard);

            let path = self.search(key, guard);
            let Some(&leaf_pid) = path.last() else {
                continue;
            };
            let Some(head) = self.consolidate(leaf_pid, guard) else {
                continue;
            };
            let head_node = unsafe { head.deref() };

            if !self.key_in_node(key, head_node) {
                trace!(pid = leaf_pid, "delete raced a structure change");
                continue;
            }

            let (total, matching) = self.count_pair(key, value, head, guard);
            if matching == 0 {
                return false;
            }
            debug_assert!(matching <= total);

            // The key disappears only when all of its values are now gone.
            let slot_use = head_node.slot_use - usize::from(matching == total);
            let mut delta = Owned::new(TreeNode::new_record(
                RecordOp::Delete,
                key.clone(),
                value.clone(),
                slot_use,
                head_node,
            ));
            delta.next.store(head, Ordering::Relaxed);

            if self.mapping.set(leaf_pid, head, delta, guard).is_ok() {
                return true;
            }
            trace!(pid = leaf_pid, "cas failed; retrying record delete");
        }
    }

    /// Collects every value currently associated with `key`.
    pub fn lookup(&self, key: &K) -> Vec<V> {
        let guard = &epoch::pin();
        'restart: loop {
            let path = self.search(key, guard);
            let Some(&leaf_pid) = path.last() else {
                continue;
            };
            let mut cur = self.mapping.get(leaf_pid, guard);
            if cur.is_null() {
                continue;
            }
            debug_assert!(unsafe { cur.deref() }.is_leaf);

            let mut found = Vec::new();
            let mut tombstones: HashSet<V> = HashSet::new();

            while !cur.is_null() {
                let node = unsafe { cur.deref() };
                match &node.node {
                    Node::Record { op, key: k, value } => {
                        if (self.key_equal)(k, key) {
                            match op {
                                RecordOp::Insert => {
                                    if !tombstones.contains(value) {
                                        found.push(value.clone());
                                    }
                                }
                                RecordOp::Delete => {
                                    tombstones.insert(value.clone());
                                }
                            }
                        }
                        cur = node.next.load(Ordering::Relaxed, guard);
                    }
                    Node::Leaf { keys, values } => {
                        if let Some(idx) = self.find_key(keys, key) {
                            for v in &values[idx] {
                                if !tombstones.contains(v) {
                                    found.push(v.clone());
                                }
                            }
                        }
                        return found;
                    }
                    Node::Split { pivot, sibling } | Node::Merge { pivot, sibling } => {
                        if self.key_at_or_above(key, pivot) {
                            cur = self.mapping.get(*sibling, guard);
                            if cur.is_null() {
                                continue 'restart;
                            }
                        } else {
                            cur = node.next.load(Ordering::Relaxed, guard);
                        }
                    }
                    // The page went away under us; drop everything gathered
                    // so far, tombstones included, and descend again.
                    Node::Remove => continue 'restart,
                    Node::Inner { .. }
                    | Node::IndexEntry { .. }
                    | Node::DeleteIndexTerm { .. } => {
                        unreachable!("index delta on a leaf chain")
                    }
                }
            }
            return found;
        }
    }

    /// Every value in the tree, in ascending key order.
    pub fn scan_all(&self) -> Vec<V> {
        let guard = &epoch::pin();
        let mut out = Vec::new();
        self.walk_leaves(guard, |_, values| {
            for bucket in values {
                out.extend(bucket);
            }
        });
        out
    }

    /// Every key with its value multiset, in ascending key order.
    pub fn scan(&self) -> (Vec<K>, Vec<Vec<V>>) {
        let guard = &epoch::pin();
        let mut all_keys = Vec::new();
        let mut all_values = Vec::new();
        self.walk_leaves(guard, |keys, values| {
            all_keys.extend(keys);
            all_values.extend(values);
        });
        (all_keys, all_values)
    }

    /// Walks the leaf sibling chain, handing each leaf's logical projection
    /// to `emit`. Each leaf is consolidated in place without installing, so
    /// the view is per-leaf atomic only.
    fn walk_leaves<F>(&self, guard: &Guard, mut emit: F)
    where
        F: FnMut(Vec<K>, Vec<Vec<V>>),
    {
        let mut pid = self.head_leaf;
        while pid != NULL_PID {
            let head = self.mapping.get(pid, guard);
            if head.is_null() {
                break;
            }
            let (keys, values) = self.leaf_projection(head, guard);
            emit(keys, values);
            pid = unsafe { head.deref() }.next_leaf;
        }
    }

    /// Descends from the root to the leaf whose key range contains `key`,
    /// returning the page-id path walked. An empty path means the descent
    /// raced a structure change and the caller should retry.
    fn search(&self, key: &K, guard: &Guard) -> Vec<PageId> {
        let root = self.root.load(Ordering::Acquire);
        let mut path = vec![root];
        let mut cur = self.mapping.get(root, guard);
        if cur.is_null() {
            return Vec::new();
        }

        loop {
            let node = unsafe { cur.deref() };
            match &node.node {
                Node::Leaf { .. } | Node::Record { .. } => return path,
                Node::Inner { keys, children } => {
                    let child = children[self.upper_bound(keys, key)];
                    assert!(child != NULL_PID, "inner node points at the null page");
                    path.push(child);
                    cur = self.mapping.get(child, guard);
                    if cur.is_null() {
                        return Vec::new();
                    }
                }
                Node::IndexEntry {
                    pivot,
                    next_key,
                    child,
                }
                | Node::DeleteIndexTerm {
                    pivot,
                    next_key,
                    child,
                } => {
                    if self.key_at_or_above(key, pivot) && self.below_bound(key, next_key) {
                        path.push(*child);
                        cur = self.mapping.get(*child, guard);
                        if cur.is_null() {
                            return Vec::new();
                        }
                    } else {
                        cur = node.next.load(Ordering::Relaxed, guard);
                    }
                }
                Node::Split { pivot, sibling } => {
                    if self.key_at_or_above(key, pivot) {
                        // The upper half of this page moved; the sibling
                        // replaces it at the same level.
                        path.pop();
                        path.push(*sibling);
                        cur = self.mapping.get(*sibling, guard);
                        if cur.is_null() {
                            return Vec::new();
                        }
                    } else {
                        cur = node.next.load(Ordering::Relaxed, guard);
                    }
                }
                Node::Merge { pivot, sibling } => {
                    if self.key_at_or_above(key, pivot) {
                        // Transplanted contents still answer for this page;
                        // the path keeps the current frame.
                        cur = self.mapping.get(*sibling, guard);
                        if cur.is_null() {
                            return Vec::new();
                        }
                    } else {
                        cur = node.next.load(Ordering::Relaxed, guard);
                    }
                }
                Node::Remove => {
                    path.pop();
                    let Some(&top) = path.last() else {
                        return Vec::new();
                    };
                    cur = self.mapping.get(top, guard);
                    if cur.is_null() {
                        return Vec::new();
                    }
                }
            }
        }
    }

    /// Forward scan of a leaf chain: is any live value recorded for `key`?
    fn key_is_in<'g>(&self, key: &K, head: Shared<'g, TreeNode<K, V>>, guard: &'g Guard) -> bool {
        let mut deleted: HashSet<V> = HashSet::new();
        let mut cur = head;
        while !cur.is_null() {
            let node = unsafe { cur.deref() };
            match &node.node {
                Node::Record { op, key: k, value } => {
                    if (self.key_equal)(k, key) {
                        match op {
                            RecordOp::Insert => {
                                if !deleted.contains(value) {
                                    return true;
                                }
                            }
                            RecordOp::Delete => {
                                deleted.insert(value.clone());
                            }
                        }
                    }
                    cur = node.next.load(Ordering::Relaxed, guard);
                }
                Node::Leaf { keys, values } => {
                    return match self.find_key(keys, key) {
                        Some(idx) => values[idx].iter().any(|v| !deleted.contains(v)),
                        None => false,
                    };
                }
                Node::Split { pivot, .. } => {
                    debug_assert!(
                        !self.key_at_or_above(key, pivot),
                        "leaf chain consulted for a key past its split pivot"
                    );
                    cur = node.next.load(Ordering::Relaxed, guard);
                }
                Node::Merge { pivot, sibling } => {
                    if self.key_at_or_above(key, pivot) {
                        cur = self.mapping.get(*sibling, guard);
                    } else {
                        cur = node.next.load(Ordering::Relaxed, guard);
                    }
                }
                _ => return false,
            }
        }
        false
    }

    /// Counts `(live values under key, copies of value among them)` in a
    /// leaf chain.
    fn count_pair<'g>(
        &self,
        key: &K,
        value: &V,
        head: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard,
    ) -> (usize, usize) {
        let mut total = 0;
        let mut matching = 0;
        let mut deleted: HashSet<V> = HashSet::new();
        let mut cur = head;

        while !cur.is_null() {
            let node = unsafe { cur.deref() };
            match &node.node {
                Node::Record { op, key: k, value: v } => {
                    if (self.key_equal)(k, key) {
                        match op {
                            RecordOp::Insert => {
                                if !deleted.contains(v) {
                                    total += 1;
                                    if v == value {
                                        matching += 1;
                                    }
                                }
                            }
                            RecordOp::Delete => {
                                deleted.insert(v.clone());
                            }
                        }
                    }
                    cur = node.next.load(Ordering::Relaxed, guard);
                }
                Node::Leaf { keys, values } => {
                    if let Some(idx) = self.find_key(keys, key) {
                        for v in &values[idx] {
                            if deleted.contains(v) {
                                continue;
                            }
                            total += 1;
                            if v == value {
                                matching += 1;
                            }
                        }
                    }
                    break;
                }
                Node::Split { pivot, .. } => {
                    debug_assert!(
                        !self.key_at_or_above(key, pivot),
                        "leaf chain consulted for a key past its split pivot"
                    );
                    cur = node.next.load(Ordering::Relaxed, guard);
                }
                Node::Merge { pivot, sibling } => {
                    if self.key_at_or_above(key, pivot) {
                        cur = self.mapping.get(*sibling, guard);
                    } else {
                        cur = node.next.load(Ordering::Relaxed, guard);
                    }
                }
                _ => break,
            }
        }
        (total, matching)
    }

    /// Splits the leaf covering `key` if it is over-full, then walks upward
    /// splitting any ancestor the propagation leaves over-full. Each level
    /// is an atomic two-step: a split delta on the child, then an index
    /// entry on the parent (or a fresh root).
    fn split(&self, key: &K, guard: &Guard) {
        let mut path = self.search(key, guard);
        let Some(mut pid) = path.pop() else {
            return;
        };
        // Levels already finished; a re-descent pops this many frames plus
        // the leaf frame to land on the current level's parent.
        let mut handled = 0usize;

        loop {
            let head = self.mapping.get(pid, guard);
            if head.is_null() {
                return;
            }
            let node = unsafe { head.deref() };
            if !self.over_full(node) {
                if node.delta_len > self.max_chain_len {
                    self.consolidate(pid, guard);
                }
                return;
            }

            let built = if node.is_leaf {
                self.build_leaf_sibling(head, guard)
            } else {
                self.build_inner_sibling(head, guard)
            };
            let Some((pivot, sibling_high, sibling)) = built else {
                return;
            };
            let sibling_pid = self
                .mapping
                .add(sibling, guard)
                .expect("mapping table exhausted");

            let mut delta = Owned::new(TreeNode::new_split(pivot.clone(), sibling_pid, node));
            delta.next.store(head, Ordering::Relaxed);
            if self.mapping.set(pid, head, delta, guard).is_err() {
                trace!(pid, "cas failed; discarding unpublished split sibling");
                self.retire_page(sibling_pid, guard);
                continue;
            }
            debug!(
                pid,
                sibling = sibling_pid,
                pivot = ?pivot,
                leaf = node.is_leaf,
                "split delta installed"
            );

            self.consolidate(pid, guard);

            // Parent side: advertise the new sibling one level up.
            let parent_pid = loop {
                if path.is_empty() {
                    if self.create_root(pid, sibling_pid, &pivot, guard) {
                        return;
                    }
                    // Lost the root race; the tree grew above us and the
                    // sibling belongs in whatever parent covers the key now.
                }
                let Some((parent_pid, parent_ptr)) =
                    self.locate_parent(key, &mut path, handled, guard)
                else {
                    continue;
                };
                let parent = unsafe { parent_ptr.deref() };

                let mut entry = Owned::new(TreeNode::new_index_entry(
                    pivot.clone(),
                    sibling_high.clone(),
                    sibling_pid,
                    parent,
                ));
                entry.next.store(parent_ptr, Ordering::Relaxed);
                if self
                    .mapping
                    .set(parent_pid, parent_ptr, entry, guard)
                    .is_ok()
                {
                    debug!(
                        parent = parent_pid,
                        child = sibling_pid,
                        "index entry installed"
                    );
                    break parent_pid;
                }
                trace!(parent = parent_pid, "cas failed; retrying index entry");
            };

            path.pop();
            handled += 1;
            pid = parent_pid;
            // Loop to check whether the parent itself is now over-full.
        }
    }

    /// Resolves the parent frame for the level `handled` levels above the
    /// leaf, re-descending from the root whenever the remembered frame no
    /// longer covers `key`. Returns `None` (with the path cleared) when the
    /// level being completed has become the top of the tree.
    fn locate_parent<'g>(
        &self,
        key: &K,
        path: &mut Vec<PageId>,
        handled: usize,
        guard: &'g Guard,
    ) -> Option<(PageId, Shared<'g, TreeNode<K, V>>)> {
        loop {
            if let Some(&candidate) = path.last() {
                let ptr = self.mapping.get(candidate, guard);
                if !ptr.is_null() && self.key_in_node(key, unsafe { ptr.deref() }) {
                    return Some((candidate, ptr));
                }
                trace!(parent = candidate, "stale parent frame; re-descending");
            }

            let fresh = self.search(key, guard);
            if fresh.is_empty() {
                continue;
            }
            if fresh.len() <= handled + 1 {
                path.clear();
                return None;
            }
            *path = fresh;
            let keep = path.len() - (handled + 1);
            path.truncate(keep);
        }
    }

    /// Installs a fresh two-child root above a split of the old root.
    /// Returns `false` when another thread already replaced the root.
    fn create_root(&self, old_root: PageId, sibling: PageId, pivot: &K, guard: &Guard) -> bool {
        let root_node =
            TreeNode::new_inner(None, None, vec![pivot.clone()], vec![old_root, sibling]);
        let new_root = self
            .mapping
            .add(Owned::new(root_node), guard)
            .expect("mapping table exhausted");

        if self
            .root
            .compare_exchange(old_root, new_root, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(root = new_root, "root split; tree grew one level");
            true
        } else {
            trace!("cas failed; another thread grew the root");
            self.retire_page(new_root, guard);
            false
        }
    }

    /// Builds the right half of an over-full leaf as a fresh base node.
    /// Returns the pivot, the sibling's high key and the sibling itself.
    fn build_leaf_sibling<'g>(
        &self,
        head: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard,
    ) -> Option<(K, Option<K>, Owned<TreeNode<K, V>>)> {
        let node = unsafe { head.deref() };
        let (keys, values) = self.leaf_projection(head, guard);
        debug_assert_eq!(keys.len(), node.slot_use);
        if keys.len() < 2 {
            return None;
        }

        let mid = keys.len() / 2;
        debug_assert!(keys.len() - mid >= self.limits.leaf_min);
        let pivot = keys[mid].clone();
        let sibling = TreeNode::new_leaf(
            Some(pivot.clone()),
            node.high_key.clone(),
            node.next_leaf,
            keys[mid..].to_vec(),
            values[mid..].to_vec(),
        );
        Some((pivot, node.high_key.clone(), Owned::new(sibling)))
    }

    /// Builds the right half of an over-full inner node. The pivot
    /// separator moves up to the parent; the sibling keeps the separators
    /// above it together with the children they bound, so its leftmost
    /// child is always a real page.
    fn build_inner_sibling<'g>(
        &self,
        head: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard,
    ) -> Option<(K, Option<K>, Owned<TreeNode<K, V>>)> {
        let node = unsafe { head.deref() };
        let (keys, children) = self.inner_projection(head, guard);
        debug_assert_eq!(keys.len(), node.slot_use);
        if keys.len() < 2 {
            return None;
        }

        let mid = keys.len() / 2;
        let pivot = keys[mid].clone();
        let sibling = TreeNode::new_inner(
            Some(pivot.clone()),
            node.high_key.clone(),
            keys[mid + 1..].to_vec(),
            children[mid + 1..].to_vec(),
        );
        Some((pivot, node.high_key.clone(), Owned::new(sibling)))
    }

    /// Folds the chain at `pid` into a fresh base node once it grows past
    /// the configured length, retiring the superseded chain. Returns the
    /// current head, or `None` when the caller must re-run its preflight:
    /// the page vanished, or its projection is over-full (a split was
    /// missed).
    fn consolidate<'g>(&self, pid: PageId, guard: &'g Guard) -> Option<Shared<'g, TreeNode<K, V>>> {
        let mut head = self.mapping.get(pid, guard);

        loop {
            if head.is_null() {
                return None;
            }
            let node = unsafe { head.deref() };
            if self.over_full(node) {
                return None;
            }
            if node.delta_len <= self.max_chain_len {
                return Some(head);
            }

            let fresh = if node.is_leaf {
                let (keys, values) = self.leaf_projection(head, guard);
                assert!(
                    keys.len() <= self.limits.leaf_max,
                    "leaf projection overflows its node"
                );
                Owned::new(TreeNode::new_leaf(
                    node.low_key.clone(),
                    node.high_key.clone(),
                    node.next_leaf,
                    keys,
                    values,
                ))
            } else {
                let (keys, children) = self.inner_projection(head, guard);
                assert!(
                    keys.len() <= self.limits.inner_max,
                    "inner projection overflows its node"
                );
                Owned::new(TreeNode::new_inner(
                    node.low_key.clone(),
                    node.high_key.clone(),
                    keys,
                    children,
                ))
            };

            match self.mapping.set(pid, head, fresh, guard) {
                Ok(new_head) => {
                    debug!(pid, "chain consolidated into a fresh base");
                    unsafe { self.stage_chain(head, guard) };
                    return Some(new_head);
                }
                Err(_) => {
                    trace!(pid, "cas failed; consolidation lost to another writer");
                    head = self.mapping.get(pid, guard);
                }
            }
        }
    }

    /// Materializes the logical contents of a leaf chain: base first, then
    /// each delta from oldest to newest.
    fn leaf_projection<'g>(
        &self,
        head: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard,
    ) -> (Vec<K>, Vec<Vec<V>>) {
        let mut chain = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            chain.push(cur);
            cur = unsafe { cur.deref() }.next.load(Ordering::Relaxed, guard);
        }

        let base = chain.pop().expect("empty delta chain");
        debug_assert!(!unsafe { base.deref() }.is_delta());
        let (mut keys, mut values) = match &unsafe { base.deref() }.node {
            Node::Leaf { keys, values } => (keys.clone(), values.clone()),
            _ => unreachable!("leaf chain does not end in a leaf base"),
        };

        while let Some(delta) = chain.pop() {
            let delta = unsafe { delta.deref() };
            match &delta.node {
                Node::Record {
                    op: RecordOp::Insert,
                    key,
                    value,
                } => {
                    let idx = self.lower_bound(&keys, key);
                    if idx < keys.len() && (self.key_equal)(&keys[idx], key) {
                        values[idx].push(value.clone());
                    } else {
                        keys.insert(idx, key.clone());
                        values.insert(idx, vec![value.clone()]);
                    }
                    debug_assert_eq!(keys.len(), delta.slot_use);
                }
                Node::Record {
                    op: RecordOp::Delete,
                    key,
                    value,
                } => {
                    if let Some(idx) = self.find_key(&keys, key) {
                        values[idx].retain(|v| v != value);
                        if values[idx].is_empty() {
                            keys.remove(idx);
                            values.remove(idx);
                        }
                    }
                    debug_assert_eq!(keys.len(), delta.slot_use);
                }
                Node::Split { pivot, .. } => {
                    let cut = self.lower_bound(&keys, pivot);
                    keys.truncate(cut);
                    values.truncate(cut);
                }
                // Merges are staged but never initiated; nothing to fold.
                Node::Merge { .. } | Node::Remove => {}
                _ => unreachable!("index delta on a leaf chain"),
            }
        }

        (keys, values)
    }

    /// Materializes the separators and children of an inner chain.
    fn inner_projection<'g>(
        &self,
        head: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard,
    ) -> (Vec<K>, Vec<PageId>) {
        let mut chain = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            chain.push(cur);
            cur = unsafe { cur.deref() }.next.load(Ordering::Relaxed, guard);
        }

        let base = chain.pop().expect("empty delta chain");
        let (mut keys, mut children) = match &unsafe { base.deref() }.node {
            Node::Inner { keys, children } => (keys.clone(), children.clone()),
            _ => unreachable!("inner chain does not end in an inner base"),
        };

        while let Some(delta) = chain.pop() {
            let delta = unsafe { delta.deref() };
            match &delta.node {
                Node::IndexEntry { pivot, child, .. } => {
                    let idx = self.upper_bound(&keys, pivot);
                    keys.insert(idx, pivot.clone());
                    children.insert(idx + 1, *child);
                    debug_assert_eq!(keys.len(), delta.slot_use);
                }
                Node::DeleteIndexTerm { pivot, .. } => {
                    if let Some(idx) = self.find_key(&keys, pivot) {
                        keys.remove(idx);
                        children.remove(idx + 1);
                    }
                }
                Node::Split { pivot, .. } => {
                    let cut = self.lower_bound(&keys, pivot);
                    keys.truncate(cut);
                    children.truncate(cut + 1);
                }
                Node::Merge { .. } | Node::Remove => {}
                _ => unreachable!("leaf delta on an inner chain"),
            }
        }

        (keys, children)
    }

    /// Hands a superseded chain to the reclamation epoch. Readers may still
    /// be inside it; the nodes are freed once every guard pinned in this
    /// epoch has dropped.
    unsafe fn stage_chain<'g>(&self, mut node: Shared<'g, TreeNode<K, V>>, guard: &'g Guard) {
        while !node.is_null() {
            let next = node.deref().next.load(Ordering::Relaxed, guard);
            guard.defer_destroy(node);
            node = next;
        }
    }

    /// Unmaps and stages a page nothing else can reach any more (an
    /// unpublished split sibling or a lost replacement root).
    fn retire_page(&self, pid: PageId, guard: &Guard) {
        let head = self.mapping.get(pid, guard);
        self.mapping.remove(pid, guard);
        if !head.is_null() {
            unsafe { self.stage_chain(head, guard) };
        }
    }

    #[inline]
    fn over_full(&self, node: &TreeNode<K, V>) -> bool {
        if node.is_leaf {
            node.slot_use >= self.limits.leaf_max
        } else {
            node.slot_use >= self.limits.inner_max
        }
    }

    /// `low_key <= key < high_key`, with missing bounds read as ∓infinity.
    fn key_in_node(&self, key: &K, node: &TreeNode<K, V>) -> bool {
        let above_low = match &node.low_key {
            None => true,
            Some(low) => !(self.key_less)(key, low),
        };
        above_low && self.below_bound(key, &node.high_key)
    }

    #[inline]
    fn below_bound(&self, key: &K, bound: &Option<K>) -> bool {
        match bound {
            None => true,
            Some(b) => (self.key_less)(key, b),
        }
    }

    #[inline]
    fn key_at_or_above(&self, key: &K, pivot: &K) -> bool {
        !(self.key_less)(key, pivot)
    }

    /// First slot whose key is not less than `key`.
    fn lower_bound(&self, keys: &[K], key: &K) -> usize {
        keys.partition_point(|k| (self.key_less)(k, key))
    }

    /// First slot whose key is strictly greater than `key`.
    fn upper_bound(&self, keys: &[K], key: &K) -> usize {
        keys.partition_point(|k| !(self.key_less)(key, k))
    }

    fn find_key(&self, keys: &[K], key: &K) -> Option<usize> {
        let idx = self.lower_bound(keys, key);
        (idx < keys.len() && (self.key_equal)(&keys[idx], key)).then_some(idx)
    }
}

/// Convenience front for key types with a total order.
pub struct BwTree<K, V>(BwTreeImpl<K, V>)
where
    K: 'static + Clone + Ord + fmt::Debug,
    V: 'static + Clone + Eq + Hash + fmt::Debug;

impl<K, V> BwTree<K, V>
where
    K: 'static + Clone + Ord + fmt::Debug,
    V: 'static + Clone + Eq + Hash + fmt::Debug,
{
    /// An empty tree with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default()).expect("default configuration is valid")
    }

    pub fn with_config(config: Config) -> Result<Self, ConfigError> {
        let inner = BwTreeImpl::with_comparators(
            config,
            Box::new(|a: &K, b: &K| a < b),
            Box::new(|a: &K, b: &K| a == b),
        )?;
        Ok(Self(inner))
    }
}

impl<K, V> Default for BwTree<K, V>
where
    K: 'static + Clone + Ord + fmt::Debug,
    V: 'static + Clone + Eq + Hash + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Deref for BwTree<K, V>
where
    K: 'static + Clone + Ord + fmt::Debug,
    V: 'static + Clone + Eq + Hash + fmt::Debug,
{
    type Target = BwTreeImpl<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
