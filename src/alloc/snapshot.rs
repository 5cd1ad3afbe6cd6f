//! Free-list freezing for snapshot readers.
//!
//! A [`Snapshot`] pins the allocator's free lists as they stood at the
//! moment it was taken: any block that was already free at that point is not
//! handed back out by `alloc` until every snapshot that could see it has
//! been released. Snapshots form a FIFO; releasing one doesn't immediately
//! unpin anything by itself — `advance` (called from `flush`) walks the
//! queue from the front and drops boundaries in prefix order, so a snapshot
//! in the middle of the queue still protects everything behind it until the
//! ones ahead of it are gone too.

use std::collections::VecDeque;

use super::NUM_CLASSES;

/// Opaque handle returned by [`crate::alloc::BlockAllocator::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotId(pub(crate) u64);

struct Entry {
    id: SnapshotId,
    /// The free-list head for each class at the moment this snapshot was taken.
    boundary: [u64; NUM_CLASSES],
    released: bool,
}

#[derive(Default)]
pub struct SnapshotQueue {
    next_id: u64,
    entries: VecDeque<Entry>,
}

impl SnapshotQueue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: VecDeque::new(),
        }
    }

    pub fn take(&mut self, boundary: [u64; NUM_CLASSES]) -> SnapshotId {
        let id = SnapshotId(self.next_id);
        self.next_id += 1;
        self.entries.push_back(Entry {
            id,
            boundary,
            released: false,
        });
        id
    }

    pub fn release(&mut self, id: SnapshotId) {
        for e in self.entries.iter_mut() {
            if e.id == id {
                e.released = true;
                return;
            }
        }
    }

    /// Drop released snapshots from the front of the queue, in order, until
    /// a live one is found (or the queue empties).
    pub fn advance(&mut self) {
        while matches!(self.entries.front(), Some(e) if e.released) {
            self.entries.pop_front();
        }
    }

    /// Is the current free-list head for `class` pinned by some outstanding
    /// snapshot? If so, `alloc` must not pop it and should fall back to
    /// extending the file instead.
    pub fn is_pinned(&self, class: usize, head: u64) -> bool {
        if head == 0 {
            return false;
        }
        self.entries.iter().any(|e| e.boundary[class] == head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_head_blocks_reuse_until_released_and_advanced() {
        let mut q = SnapshotQueue::new();
        let mut boundary = [0u64; NUM_CLASSES];
        boundary[3] = 100;
        let id = q.take(boundary);
        assert!(q.is_pinned(3, 100));
        q.release(id);
        // Still pinned until advance() runs the prefix reclaim.
        assert!(q.is_pinned(3, 100));
        q.advance();
        assert!(!q.is_pinned(3, 100));
    }

    #[test]
    fn fifo_prefix_order_protects_middle_entries() {
        let mut q = SnapshotQueue::new();
        let mut b1 = [0u64; NUM_CLASSES];
        b1[0] = 10;
        let id1 = q.take(b1);
        let mut b2 = [0u64; NUM_CLASSES];
        b2[0] = 20;
        let _id2 = q.take(b2);
        // Release only the second; the first (older) is still at the front
        // of the FIFO and unreleased, so advance() must not drop anything.
        q.release(_id2);
        q.advance();
        assert!(q.is_pinned(0, 20));
        q.release(id1);
        q.advance();
        assert!(!q.is_pinned(0, 10));
        assert!(!q.is_pinned(0, 20));
    }
}
