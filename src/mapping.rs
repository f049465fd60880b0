use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use tracing::trace;

use crate::nodes::TreeNode;
use crate::{PageId, NULL_PID};

/// Second-tier block of the mapping table. Immutable once published;
/// individual slots within it mutate only through CAS.
struct Block<K, V> {
    slots: Box<[Atomic<TreeNode<K, V>>]>,
}

impl<K, V> Block<K, V> {
    fn new(len: usize) -> Self {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, Atomic::null);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

/// Two-tier indirection table from page id to chain head.
///
/// Tier one is a fixed array of lazily materialized tier-two blocks, each
/// holding `2^tier_bits` slots. A slot is the exclusive synchronization
/// point of its page: every observed transition is a single CAS, and the
/// table promises no ordering across different slots.
pub(crate) struct MappingTable<K, V> {
    tier1: Box<[Atomic<Block<K, V>>]>,
    next_pid: AtomicU64,
    tier_bits: u32,
}

impl<K, V> MappingTable<K, V> {
    pub(crate) fn new(tier_bits: u32) -> Self {
        let len = 1usize << tier_bits;
        let mut tier1 = Vec::with_capacity(len);
        tier1.resize_with(len, Atomic::null);
        Self {
            tier1: tier1.into_boxed_slice(),
            next_pid: AtomicU64::new(0),
            tier_bits,
        }
    }

    #[inline]
    fn tier1_index(&self, pid: PageId) -> usize {
        (pid >> self.tier_bits) as usize
    }

    #[inline]
    fn tier2_index(&self, pid: PageId) -> usize {
        (pid & ((1 << self.tier_bits) - 1)) as usize
    }

    /// Total number of slots the two tiers can address.
    pub(crate) fn capacity(&self) -> u64 {
        1u64 << (2 * self.tier_bits)
    }

    fn slot<'g>(&self, pid: PageId, guard: &'g Guard) -> Option<&'g Atomic<TreeNode<K, V>>> {
        let block = self.tier1[self.tier1_index(pid)].load(Ordering::Acquire, guard);
        if block.is_null() {
            return None;
        }
        Some(&unsafe { block.deref() }.slots[self.tier2_index(pid)])
    }

    /// Current chain head of `pid`, or null when the page is unmapped.
    pub(crate) fn get<'g>(&self, pid: PageId, guard: &'g Guard) -> Shared<'g, TreeNode<K, V>> {
        if pid == NULL_PID || pid >= self.capacity() {
            return Shared::null();
        }
        match self.slot(pid, guard) {
            Some(slot) => slot.load(Ordering::Acquire, guard),
            None => Shared::null(),
        }
    }

    /// Allocates the next page id, materializing the covering tier-two
    /// block if needed, and installs `node` there. The minted id is stamped
    /// into the node before it becomes visible. Returns `None` when the
    /// table is out of slots.
    pub(crate) fn add(&self, mut node: Owned<TreeNode<K, V>>, guard: &Guard) -> Option<PageId> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid >= self.capacity() {
            return None;
        }

        let t1 = self.tier1_index(pid);
        if self.tier1[t1].load(Ordering::Acquire, guard).is_null() {
            let block = Owned::new(Block::new(1 << self.tier_bits));
            // A lost race drops our block; the winner's is equivalent.
            if self.tier1[t1]
                .compare_exchange(
                    Shared::null(),
                    block,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_err()
            {
                trace!(tier1 = t1, "lost block materialization race");
            }
        }

        node.pid = pid;
        let slot = self.slot(pid, guard).expect("tier-two block just materialized");
        match slot.compare_exchange(
            Shared::null(),
            node,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => Some(pid),
            // The id was freshly minted, so its slot must have been empty.
            Err(_) => unreachable!("fresh pid {pid} already occupied"),
        }
    }

    /// CAS of the slot for `pid` from `expected` to `desired`. On success
    /// the installed node carries `pid`; on failure ownership of `desired`
    /// is handed back.
    pub(crate) fn set<'g>(
        &self,
        pid: PageId,
        expected: Shared<'_, TreeNode<K, V>>,
        mut desired: Owned<TreeNode<K, V>>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, TreeNode<K, V>>, Owned<TreeNode<K, V>>> {
        desired.pid = pid;
        let Some(slot) = self.slot(pid, guard) else {
            return Err(desired);
        };
        slot.compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire, guard)
            .map_err(|e| e.new)
    }

    /// Unmaps `pid`. Only legal for a caller holding exclusive claim on the
    /// slot, e.g. after retiring a page no reader can reach any more.
    pub(crate) fn remove(&self, pid: PageId, guard: &Guard) {
        if let Some(slot) = self.slot(pid, guard) {
            slot.store(Shared::null(), Ordering::Release);
        }
    }
}

impl<K, V> Drop for MappingTable<K, V> {
    fn drop(&mut self) {
        // Exclusive access: free every chain still owned by a slot, then the
        // blocks themselves. Chains already staged for reclamation were
        // unlinked from their slots beforehand and are not reachable here.
        unsafe {
            let guard = epoch::unprotected();
            for tier1 in self.tier1.iter() {
                let block = tier1.load(Ordering::Relaxed, guard);
                if block.is_null() {
                    continue;
                }
                for slot in block.deref().slots.iter() {
                    let mut node = slot.load(Ordering::Relaxed, guard);
                    while !node.is_null() {
                        let next = node.deref().next.load(Ordering::Relaxed, guard);
                        drop(node.into_owned());
                        node = next;
                    }
                }
                drop(block.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::TreeNode;

    fn leaf(keys: Vec<u64>) -> Owned<TreeNode<u64, u64>> {
        let values = keys.iter().map(|&k| vec![k]).collect();
        Owned::new(TreeNode::new_leaf(None, None, NULL_PID, keys, values))
    }

    #[test]
    fn add_allocates_dense_pids_and_stamps_them() {
        let table: MappingTable<u64, u64> = MappingTable::new(4);
        let guard = &epoch::pin();

        for expected in 0..10u64 {
            let pid = table.add(leaf(vec![expected]), guard).unwrap();
            assert_eq!(pid, expected);
            let head = table.get(pid, guard);
            assert_eq!(unsafe { head.deref() }.pid, pid);
        }
    }

    #[test]
    fn add_spans_tier_two_blocks() {
        // tier_bits = 2 gives 4-slot blocks; 10 pages need 3 blocks.
        let table: MappingTable<u64, u64> = MappingTable::new(2);
        let guard = &epoch::pin();

        for i in 0..10u64 {
            table.add(leaf(vec![i]), guard).unwrap();
        }
        for i in 0..10u64 {
            let head = table.get(i, guard);
            assert!(!head.is_null());
            match &unsafe { head.deref() }.node {
                crate::nodes::Node::Leaf { keys, .. } => assert_eq!(keys, &vec![i]),
                _ => panic!("expected a leaf base"),
            }
        }
        assert!(table.get(10, guard).is_null());
    }

    #[test]
    fn add_reports_exhaustion() {
        let table: MappingTable<u64, u64> = MappingTable::new(1);
        let guard = &epoch::pin();

        for _ in 0..4 {
            assert!(table.add(leaf(vec![1]), guard).is_some());
        }
        assert!(table.add(leaf(vec![1]), guard).is_none());
    }

    #[test]
    fn set_is_a_single_winner_cas() {
        let table: MappingTable<u64, u64> = MappingTable::new(4);
        let guard = &epoch::pin();

        let pid = table.add(leaf(vec![1]), guard).unwrap();
        let head = table.get(pid, guard);

        let won = table.set(pid, head, leaf(vec![2]), guard);
        assert!(won.is_ok());

        // Second swap against the stale head must fail and hand the node back.
        let lost = table.set(pid, head, leaf(vec![3]), guard);
        assert!(lost.is_err());
        unsafe { table.stage_for_test(head, guard) };
    }

    #[test]
    fn remove_unmaps_the_slot() {
        let table: MappingTable<u64, u64> = MappingTable::new(4);
        let guard = &epoch::pin();

        let pid = table.add(leaf(vec![1]), guard).unwrap();
        let head = table.get(pid, guard);
        assert!(!head.is_null());

        table.remove(pid, guard);
        assert!(table.get(pid, guard).is_null());
        unsafe { table.stage_for_test(head, guard) };
    }

    #[test]
    fn get_rejects_the_null_sentinel() {
        let table: MappingTable<u64, u64> = MappingTable::new(4);
        let guard = &epoch::pin();
        assert!(table.get(NULL_PID, guard).is_null());
    }

    impl MappingTable<u64, u64> {
        /// Hands a chain displaced during a test to the reclamation epoch so
        /// the table's `Drop` does not double-free it.
        unsafe fn stage_for_test<'g>(
            &self,
            mut node: Shared<'g, TreeNode<u64, u64>>,
            guard: &'g Guard,
        ) {
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                guard.defer_destroy(node);
                node = next;
            }
        }
    }
}
