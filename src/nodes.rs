use crate::{PageId, NULL_PID};

use crossbeam::epoch::Atomic;

/// Whether a record delta adds or retracts one `(key, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordOp {
    Insert,
    Delete,
}

/// Payload of one link in a delta chain.
///
/// A chain is a singly-linked list of immutable nodes whose tail is a base
/// page (`Leaf` or `Inner`) and whose head sits in the mapping table. Every
/// other variant is a delta describing one logical change relative to the
/// rest of the chain below it.
pub(crate) enum Node<K, V> {
    /// Base leaf page: ordered keys, one value multiset per key.
    Leaf { keys: Vec<K>, values: Vec<Vec<V>> },

    /// Base inner page: ordered separators and `keys.len() + 1` children.
    /// Child `i` covers `[keys[i - 1], keys[i])`.
    Inner { keys: Vec<K>, children: Vec<PageId> },

    /// Insert or delete of a single pair on a leaf chain.
    Record { op: RecordOp, key: K, value: V },

    /// First half of a split: everything at or above `pivot` now lives in
    /// `sibling`, and this page is logically truncated to `[low_key, pivot)`.
    Split { pivot: K, sibling: PageId },

    /// Second half of a split, prepended on the parent: `child` covers
    /// `[pivot, next_key)`, `None` meaning +inf.
    IndexEntry {
        pivot: K,
        next_key: Option<K>,
        child: PageId,
    },

    // The merge SMO is staged through the next three variants. No write path
    // emits them yet; read paths still interpret chains that carry them.
    /// Marks a page as merged away.
    #[allow(dead_code)]
    Remove,

    /// Transplants the contents of `sibling` into this page at `pivot`.
    #[allow(dead_code)]
    Merge { pivot: K, sibling: PageId },

    /// Inner-page side of a merge: retracts the separator installed for
    /// `child`.
    #[allow(dead_code)]
    DeleteIndexTerm {
        pivot: K,
        next_key: Option<K>,
        child: PageId,
    },
}

/// One link in a delta chain: the shared header plus the tagged payload.
///
/// `low_key` is inclusive and `high_key` exclusive; `None` stands for -inf
/// and +inf respectively. `slot_use` is the logical entry count visible at
/// this point in the chain and `delta_len` the number of deltas below this
/// node (zero for a base). Deltas copy the header of the head they were
/// prepended onto, so the chain head always carries the page's current
/// bounds and sibling link.
pub(crate) struct TreeNode<K, V> {
    pub(crate) pid: PageId,
    pub(crate) is_leaf: bool,
    pub(crate) delta_len: usize,
    pub(crate) slot_use: usize,
    pub(crate) low_key: Option<K>,
    pub(crate) high_key: Option<K>,
    /// Right sibling on the leaf chain; `NULL_PID` for inner pages and the
    /// rightmost leaf.
    pub(crate) next_leaf: PageId,
    pub(crate) node: Node<K, V>,
    /// Next (older) link in this chain. Assigned before the head is
    /// published and never mutated afterwards.
    pub(crate) next: Atomic<TreeNode<K, V>>,
}

impl<K, V> TreeNode<K, V>
where
    K: Clone,
{
    pub(crate) fn new_leaf(
        low_key: Option<K>,
        high_key: Option<K>,
        next_leaf: PageId,
        keys: Vec<K>,
        values: Vec<Vec<V>>,
    ) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        Self {
            pid: NULL_PID,
            is_leaf: true,
            delta_len: 0,
            slot_use: keys.len(),
            low_key,
            high_key,
            next_leaf,
            node: Node::Leaf { keys, values },
            next: Atomic::null(),
        }
    }

    pub(crate) fn new_inner(
        low_key: Option<K>,
        high_key: Option<K>,
        keys: Vec<K>,
        children: Vec<PageId>,
    ) -> Self {
        debug_assert_eq!(children.len(), keys.len() + 1);
        Self {
            pid: NULL_PID,
            is_leaf: false,
            delta_len: 0,
            slot_use: keys.len(),
            low_key,
            high_key,
            next_leaf: NULL_PID,
            node: Node::Inner { keys, children },
            next: Atomic::null(),
        }
    }

    /// Record delta prepended onto `head`. The caller decides `slot_use`
    /// (inserting an unseen key adds one, deleting the last value of a key
    /// removes one).
    pub(crate) fn new_record(
        op: RecordOp,
        key: K,
        value: V,
        slot_use: usize,
        head: &TreeNode<K, V>,
    ) -> Self {
        Self {
            pid: head.pid,
            is_leaf: head.is_leaf,
            delta_len: head.delta_len + 1,
            slot_use,
            low_key: head.low_key.clone(),
            high_key: head.high_key.clone(),
            next_leaf: head.next_leaf,
            node: Node::Record { op, key, value },
            next: Atomic::null(),
        }
    }

    /// Split delta prepended onto `head`: truncates the page to
    /// `[low_key, pivot)` and, on a leaf, relinks the sibling chain through
    /// the new page.
    pub(crate) fn new_split(pivot: K, sibling: PageId, head: &TreeNode<K, V>) -> Self {
        Self {
            pid: head.pid,
            is_leaf: head.is_leaf,
            delta_len: head.delta_len + 1,
            slot_use: head.slot_use / 2,
            low_key: head.low_key.clone(),
            high_key: Some(pivot.clone()),
            next_leaf: if head.is_leaf { sibling } else { NULL_PID },
            node: Node::Split { pivot, sibling },
            next: Atomic::null(),
        }
    }

    /// Index-entry delta prepended onto the parent `head`, advertising the
    /// new child produced by a split.
    pub(crate) fn new_index_entry(
        pivot: K,
        next_key: Option<K>,
        child: PageId,
        head: &TreeNode<K, V>,
    ) -> Self {
        Self {
            pid: head.pid,
            is_leaf: head.is_leaf,
            delta_len: head.delta_len + 1,
            slot_use: head.slot_use + 1,
            low_key: head.low_key.clone(),
            high_key: head.high_key.clone(),
            next_leaf: head.next_leaf,
            node: Node::IndexEntry {
                pivot,
                next_key,
                child,
            },
            next: Atomic::null(),
        }
    }

    #[inline]
    pub(crate) fn is_delta(&self) -> bool {
        !matches!(self.node, Node::Leaf { .. } | Node::Inner { .. })
    }
}
