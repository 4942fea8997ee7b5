//! Zero-copy completion bookkeeping (§4.7.4).
//!
//! The kernel reports `MSG_ZEROCOPY` completions as an inclusive 32-bit counter range
//! `[from32, thru32]` that wraps at `2^32`. Submissions are tracked with a 64-bit
//! logical counter that never wraps (within the lifetime of a session), so completions
//! first have to be lifted into logical space before they can be matched against the
//! operations a group is waiting on. This module keeps that arithmetic — grounded on
//! the completion-range handling exercised in `ntcq_zerocopy.t.cpp` — separate and
//! independently testable, the way the original keeps the range math apart from the
//! queue's group bookkeeping.

use std::collections::{BTreeSet, VecDeque};

/// A half-open range of logical (64-bit, non-wrapping) zero-copy operation sequence
/// numbers: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroCopyRange {
    pub start: u64,
    pub end: u64,
}

impl ZeroCopyRange {
    pub fn new(start: u64, end: u64) -> ZeroCopyRange {
        assert!(start <= end, "zero-copy range must be non-decreasing");
        ZeroCopyRange { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value < self.end
    }

    pub fn intersects(&self, other: ZeroCopyRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: ZeroCopyRange) -> Option<ZeroCopyRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(ZeroCopyRange::new(start, end))
        } else {
            None
        }
    }

    /// `self` minus `other`, as zero, one, or two disjoint remaining ranges.
    pub fn difference(&self, other: ZeroCopyRange) -> Vec<ZeroCopyRange> {
        match self.intersect(other) {
            None => vec![*self],
            Some(overlap) => {
                let mut out = Vec::with_capacity(2);
                if self.start < overlap.start {
                    out.push(ZeroCopyRange::new(self.start, overlap.start));
                }
                if overlap.end < self.end {
                    out.push(ZeroCopyRange::new(overlap.end, self.end));
                }
                out
            }
        }
    }
}

/// Lifts a kernel-reported inclusive `[from32, thru32]` range into logical space,
/// given the logical sequence number of the next operation that has *not yet* been
/// submitted (`next_logical`) as an anchor for resolving wraparound.
///
/// The kernel counter wraps at `2^32`; `next_logical` tells us which 4-billion-wide
/// "epoch" the 32-bit range most plausibly falls in; it is always resolved to the
/// epoch ending at or before `next_logical`, since completions can only reference
/// operations already submitted.
pub fn lift_to_logical(from32: u32, thru32: u32, next_logical: u64) -> ZeroCopyRange {
    const SPAN: u64 = 1u64 << 32;

    let epoch_of = |next: u64| -> u64 { next / SPAN };

    let candidate_epoch = epoch_of(next_logical);
    let start_guess = candidate_epoch * SPAN + from32 as u64;

    // If that guess lands after `next_logical`, the range actually belongs to the
    // previous epoch (the counter wrapped since the range was submitted).
    let epoch = if start_guess > next_logical && candidate_epoch > 0 {
        candidate_epoch - 1
    } else {
        candidate_epoch
    };

    let start = epoch * SPAN + from32 as u64;
    let end = if thru32 >= from32 {
        epoch * SPAN + thru32 as u64 + 1
    } else {
        // thru32 < from32: the inclusive range itself wrapped within the report.
        (epoch + 1) * SPAN + thru32 as u64 + 1
    };

    ZeroCopyRange::new(start, end)
}

/// One outstanding send group: a contiguous block of logical operation numbers whose
/// completion callback fires only once every operation in `[start, end)` has been
/// reported complete.
pub struct ZeroCopyGroup {
    pub range: ZeroCopyRange,
    outstanding: BTreeSet<u64>,
}

impl ZeroCopyGroup {
    pub fn new(range: ZeroCopyRange) -> ZeroCopyGroup {
        ZeroCopyGroup {
            range,
            outstanding: (range.start..range.end).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Marks the portion of `completed` that falls within this group as done. Returns
    /// `true` if this call completed the group.
    fn apply(&mut self, completed: ZeroCopyRange) -> bool {
        if let Some(overlap) = self.range.intersect(completed) {
            for op in overlap.start..overlap.end {
                self.outstanding.remove(&op);
            }
        }
        self.is_complete()
    }
}

/// Tracks all outstanding zero-copy groups for one socket session and matches kernel
/// completion reports against them, firing each group's callback exactly once.
pub struct ZeroCopyQueue {
    next_logical: u64,
    groups: VecDeque<(ZeroCopyGroup, Box<dyn FnOnce() + Send>)>,
}

impl ZeroCopyQueue {
    pub fn new() -> ZeroCopyQueue {
        ZeroCopyQueue {
            next_logical: 0,
            groups: VecDeque::new(),
        }
    }

    /// Registers a new group spanning `op_count` operations starting at the next free
    /// logical sequence number, running `on_complete` once every operation in the
    /// group has been reported done.
    pub fn submit(&mut self, op_count: u64, on_complete: impl FnOnce() + Send + 'static) -> ZeroCopyRange {
        let start = self.next_logical;
        let end = start + op_count;
        self.next_logical = end;

        let range = ZeroCopyRange::new(start, end);
        self.groups.push_back((ZeroCopyGroup::new(range), Box::new(on_complete)));
        range
    }

    /// Applies a raw kernel completion report, firing and removing any group it fully
    /// completes. A report whose logical range extends beyond any pending operation
    /// (past `next_logical`) indicates driver misbehavior; the out-of-range portion is
    /// logged and dropped rather than treated as fatal, per the decision recorded for
    /// this out-of-range case.
    pub fn complete(&mut self, from32: u32, thru32: u32) {
        let reported = lift_to_logical(from32, thru32, self.next_logical);

        let in_range = if reported.end > self.next_logical {
            warn!(
                "zero-copy completion [{}, {}) exceeds submitted operations (next={}), dropping tail",
                reported.start, reported.end, self.next_logical
            );
            match reported.intersect(ZeroCopyRange::new(0, self.next_logical)) {
                Some(clipped) => clipped,
                None => return,
            }
        } else {
            reported
        };

        let mut completed_indices = Vec::new();
        for (idx, (group, _)) in self.groups.iter_mut().enumerate() {
            if group.range.intersects(in_range) && group.apply(in_range) {
                completed_indices.push(idx);
            }
        }

        // Remove back-to-front so earlier indices stay valid.
        for idx in completed_indices.into_iter().rev() {
            let (_, callback) = self.groups.remove(idx).unwrap();
            callback();
        }
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

impl Default for ZeroCopyQueue {
    fn default() -> ZeroCopyQueue {
        ZeroCopyQueue::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn range_intersect_and_difference() {
        let a = ZeroCopyRange::new(0, 10);
        let b = ZeroCopyRange::new(5, 15);
        assert_eq!(a.intersect(b), Some(ZeroCopyRange::new(5, 10)));

        let diff = a.difference(b);
        assert_eq!(diff, vec![ZeroCopyRange::new(0, 5)]);

        let c = ZeroCopyRange::new(3, 6);
        let diff = a.difference(c);
        assert_eq!(diff, vec![ZeroCopyRange::new(0, 3), ZeroCopyRange::new(6, 10)]);
    }

    #[test]
    fn lift_handles_32_bit_wraparound() {
        // next_logical just past the wrap boundary; completion [UINT32_MAX-1, 1]
        // spans logical [2^32-2, 2^32+2).
        let next_logical = (1u64 << 32) + 5;
        let range = lift_to_logical(u32::MAX - 1, 1, next_logical);
        assert_eq!(range, ZeroCopyRange::new((1u64 << 32) - 2, (1u64 << 32) + 2));
    }

    #[test]
    fn group_fires_only_after_all_operations_complete() {
        let mut queue = ZeroCopyQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let range = queue.submit(3, move || { f.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(range, ZeroCopyRange::new(0, 3));

        queue.complete(0, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        queue.complete(1, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        queue.complete(2, 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_groups(), 0);
    }

    #[test]
    fn split_completions_resolve_groups_out_of_order() {
        // Mirrors the "zero-copy split completion" scenario: three groups of 7
        // operations each (ops 0-20), completions delivered out of order.
        let mut queue = ZeroCopyQueue::new();
        let done = Arc::new(std::sync::Mutex::new(Vec::new()));

        for g in 0..3u64 {
            let done = done.clone();
            queue.submit(7, move || done.lock().unwrap().push(g));
        }

        queue.complete(2, 4);
        queue.complete(9, 12);
        queue.complete(16, 18);
        queue.complete(5, 8);
        assert!(done.lock().unwrap().is_empty());

        queue.complete(12, 15);
        assert_eq!(*done.lock().unwrap(), vec![1u64]);

        queue.complete(19, 20);
        assert_eq!(*done.lock().unwrap(), vec![1u64, 2]);

        queue.complete(0, 1);
        assert_eq!(*done.lock().unwrap(), vec![1u64, 2, 0]);
    }
}
