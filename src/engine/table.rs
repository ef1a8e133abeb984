//! The per-job segment table: the single source of truth for segment byte
//! ranges, shared under one mutex by the worker tasks and the Adaptive
//! Controller (spec §4.3 "writer discipline" / §4.4 "all segmentation
//! mutations go through the same write-position mutex as the Engine").

use std::collections::VecDeque;
use std::sync::Arc;

use crate::job::Segment;
use crate::speed::SpeedTracker;

pub type SegmentId = u64;

pub struct TrackedSegment {
    pub id: SegmentId,
    pub segment: Segment,
    pub speed: Arc<SpeedTracker>,
    /// Set once a worker is no longer assigned to this segment, either
    /// because it finished or because the Adaptive Controller retired it
    /// (straggler removal). A retired, incomplete segment's leftover bytes
    /// have already been queued onto a neighbor's `pending` by the time
    /// this is set.
    pub retired: bool,
    /// Additional `(offset, length)` byte ranges queued for the same
    /// worker to fetch once its active `segment` range completes — how a
    /// straggler's leftover bytes are handed to a neighbor (spec §4.4)
    /// without corrupting the neighbor's own `offset/length/written`
    /// prefix invariant. A fresh range always starts at `written = 0`.
    pub pending: VecDeque<(u64, u64)>,
}

pub struct SegmentTable {
    next_id: SegmentId,
    pub segments: Vec<TrackedSegment>,
}

impl SegmentTable {
    pub fn new(segments: Vec<Segment>) -> Self {
        let mut next_id = 0;
        let tracked = segments
            .into_iter()
            .map(|segment| {
                let id = next_id;
                next_id += 1;
                TrackedSegment {
                    id,
                    segment,
                    speed: Arc::new(SpeedTracker::new()),
                    retired: false,
                    pending: VecDeque::new(),
                }
            })
            .collect();
        Self {
            next_id,
            segments: tracked,
        }
    }

    pub fn get(&self, id: SegmentId) -> Option<&TrackedSegment> {
        self.segments.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SegmentId) -> Option<&mut TrackedSegment> {
        self.segments.iter_mut().find(|s| s.id == id)
    }

    pub fn active_ids(&self) -> Vec<SegmentId> {
        self.segments
            .iter()
            .filter(|s| !s.retired)
            .map(|s| s.id)
            .collect()
    }

    pub fn total_written(&self) -> u64 {
        self.segments.iter().map(|s| s.segment.written).sum()
    }

    pub fn total_length(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.segment.length + s.pending.iter().map(|(_, len)| len).sum::<u64>())
            .sum()
    }

    pub fn all_complete(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.segment.is_complete() && s.pending.is_empty())
    }

    /// Claims the next queued range for `id`, if any, resetting its active
    /// `segment` to that range with `written = 0`. Called by a worker once
    /// it finishes its current range, so a straggler's leftover bytes
    /// (queued via [`Self::reassign_straggler`]) get fetched by the same
    /// worker rather than spawning a new one. Returns whether a range was
    /// claimed.
    pub fn advance_to_pending(&mut self, id: SegmentId) -> bool {
        let Some(s) = self.get_mut(id) else {
            return false;
        };
        let Some((offset, length)) = s.pending.pop_front() else {
            return false;
        };
        s.segment.offset = offset;
        s.segment.length = length;
        s.segment.written = 0;
        true
    }

    /// Collapses the whole table down to one segment covering
    /// `[0, total_bytes)`, owned by `keep_id`, retiring every other segment
    /// (spec §4.3 step 2: a 200 response to a range GET means the
    /// segmentation itself is invalid, so one worker must take over the
    /// entire resource and the rest must stop writing). Other segments'
    /// `length`/`written` are zeroed so they no longer contribute to
    /// `total_length`/`total_written` — `keep_id`'s range now covers the
    /// bytes they would have fetched.
    pub fn collapse_to_single(&mut self, keep_id: SegmentId, total_bytes: u64) {
        for s in self.segments.iter_mut() {
            s.pending.clear();
            if s.id == keep_id {
                s.segment.offset = 0;
                s.segment.length = total_bytes;
                s.segment.written = 0;
                s.retired = false;
            } else {
                s.segment.length = 0;
                s.segment.written = 0;
                s.retired = true;
            }
        }
    }

    pub fn snapshot_segments(&self) -> Vec<Segment> {
        self.segments.iter().map(|s| s.segment).collect()
    }

    /// Straggler removal (spec §4.4): freezes the straggler at its current
    /// `written` count (it is done contributing further bytes) and queues
    /// its unwritten remainder as a follow-up range for the neighbor's
    /// worker to fetch once its own active range completes. `neighbor_id`
    /// need not be physically adjacent — the leftover range is fetched
    /// on its own, not glued onto the neighbor's `offset/length`, so
    /// shifting the neighbor's boundaries (and corrupting its
    /// `written`-is-a-prefix invariant) is never necessary.
    pub fn reassign_straggler(&mut self, straggler_id: SegmentId, neighbor_id: SegmentId) {
        let (leftover_offset, leftover_len, written) = match self.get(straggler_id) {
            Some(s) => (s.segment.offset + s.segment.written, s.segment.remaining(), s.segment.written),
            None => return,
        };

        if leftover_len > 0 {
            if let Some(neighbor) = self.get_mut(neighbor_id) {
                neighbor.pending.push_back((leftover_offset, leftover_len));
            }
        }

        if let Some(s) = self.get_mut(straggler_id) {
            s.segment.length = written;
            s.retired = true;
        }
    }

    /// Scale-up (spec §4.4): splits the largest remaining segment in half,
    /// returning the new half's id and range, or `None` if no segment has
    /// at least `2 * min_segment_bytes` remaining.
    pub fn split_largest(&mut self, min_segment_bytes: u64) -> Option<(SegmentId, Segment)> {
        let candidate_id = self
            .segments
            .iter()
            .filter(|s| !s.retired)
            .max_by_key(|s| s.segment.remaining())
            .map(|s| s.id)?;

        let (remaining, offset, length) = {
            let s = self.get(candidate_id)?;
            (s.segment.remaining(), s.segment.offset, s.segment.length)
        };
        if remaining < min_segment_bytes * 2 {
            return None;
        }

        let split_len = remaining / 2;
        let old_end = offset + length;
        let new_offset = old_end - split_len;

        if let Some(s) = self.get_mut(candidate_id) {
            s.segment.length -= split_len;
        }

        let new_id = self.next_id;
        self.next_id += 1;
        let new_segment = Segment::new(new_offset, split_len);
        self.segments.push(TrackedSegment {
            id: new_id,
            segment: new_segment,
            speed: Arc::new(SpeedTracker::new()),
            retired: false,
            pending: VecDeque::new(),
        });
        Some((new_id, new_segment))
    }

    /// Largest-remaining candidate for the Controller's decision function,
    /// without mutating anything.
    pub fn largest_remaining(&self) -> Option<(SegmentId, u64)> {
        self.segments
            .iter()
            .filter(|s| !s.retired)
            .map(|s| (s.id, s.segment.remaining()))
            .max_by_key(|(_, remaining)| *remaining)
    }

    /// Physically-adjacent neighbor of `id` among non-retired segments,
    /// preferring the next segment (prepend is cheaper: no redundant
    /// re-fetch) over the previous one.
    pub fn adjacent_neighbor(&self, id: SegmentId) -> Option<SegmentId> {
        let target = self.get(id)?;
        let start = target.segment.offset;
        let end = target.segment.offset + target.segment.length;

        if let Some(next) = self
            .segments
            .iter()
            .find(|s| !s.retired && s.id != id && s.segment.offset == end)
        {
            return Some(next.id);
        }
        self.segments
            .iter()
            .find(|s| !s.retired && s.id != id && s.segment.offset + s.segment.length == start)
            .map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(ranges: &[(u64, u64)]) -> SegmentTable {
        SegmentTable::new(ranges.iter().map(|&(o, l)| Segment::new(o, l)).collect())
    }

    #[test]
    fn reassign_queues_leftover_onto_next_neighbor_without_touching_its_range() {
        let mut table = table_of(&[(0, 100), (100, 100)]);
        table.get_mut(0).unwrap().segment.written = 80;
        table.reassign_straggler(0, 1);

        let straggler = table.get(0).unwrap();
        assert!(straggler.retired);
        assert_eq!(straggler.segment.length, 80);

        // Neighbor's own active range is untouched (no in-flight GET is
        // invalidated); the hole is queued as a follow-up range instead.
        let neighbor = table.get(1).unwrap();
        assert_eq!(neighbor.segment.offset, 100);
        assert_eq!(neighbor.segment.length, 100);
        assert_eq!(neighbor.pending.front(), Some(&(80, 20)));
        assert_eq!(table.total_length(), 200);
    }

    #[test]
    fn reassign_queues_leftover_onto_previous_neighbor_when_no_next() {
        let mut table = table_of(&[(0, 100), (100, 100)]);
        table.get_mut(1).unwrap().segment.written = 30;
        table.reassign_straggler(1, 0);

        let straggler = table.get(1).unwrap();
        assert!(straggler.retired);
        assert_eq!(straggler.segment.length, 30);

        let neighbor = table.get(0).unwrap();
        assert_eq!(neighbor.segment.offset, 0);
        assert_eq!(neighbor.segment.length, 100);
        assert_eq!(neighbor.pending.front(), Some(&(130, 70)));
        assert_eq!(table.total_length(), 200);
    }

    #[test]
    fn fully_written_straggler_leaves_neighbor_untouched() {
        let mut table = table_of(&[(0, 100), (100, 100)]);
        table.get_mut(0).unwrap().segment.written = 100;
        table.reassign_straggler(0, 1);
        let neighbor = table.get(1).unwrap();
        assert_eq!(neighbor.segment.offset, 100);
        assert_eq!(neighbor.segment.length, 100);
        assert!(neighbor.pending.is_empty());
    }

    #[test]
    fn advance_to_pending_claims_queued_range_with_fresh_written() {
        let mut table = table_of(&[(0, 100), (100, 100)]);
        table.get_mut(0).unwrap().segment.written = 80;
        table.reassign_straggler(0, 1);

        assert!(table.advance_to_pending(1));
        let neighbor = table.get(1).unwrap();
        assert_eq!(neighbor.segment.offset, 80);
        assert_eq!(neighbor.segment.length, 20);
        assert_eq!(neighbor.segment.written, 0);
        assert!(neighbor.pending.is_empty());

        // No more pending ranges left.
        assert!(!table.advance_to_pending(1));
    }

    #[test]
    fn collapse_to_single_retires_others_and_keeps_total_length_consistent() {
        let mut table = table_of(&[(0, 1_000_000), (1_000_000, 1_000_000), (2_000_000, 1_000_000)]);
        table.get_mut(0).unwrap().segment.written = 400_000;
        table.get_mut(1).unwrap().segment.written = 100_000;

        table.collapse_to_single(1, 3_000_000);

        assert_eq!(table.active_ids(), vec![1]);
        let kept = table.get(1).unwrap();
        assert_eq!(kept.segment.offset, 0);
        assert_eq!(kept.segment.length, 3_000_000);
        assert_eq!(kept.segment.written, 0);
        assert!(!kept.retired);

        for id in [0, 2] {
            let s = table.get(id).unwrap();
            assert!(s.retired);
            assert_eq!(s.segment.length, 0);
            assert_eq!(s.segment.written, 0);
        }
        assert_eq!(table.total_length(), 3_000_000);
        assert_eq!(table.total_written(), 0);
    }

    #[test]
    fn split_largest_creates_two_segments_at_least_min_each() {
        let mut table = table_of(&[(0, 4_000_000)]);
        let (new_id, new_segment) = table.split_largest(1 << 20).expect("should split");
        assert_eq!(new_id, 1);
        assert_eq!(new_segment.length, 2_000_000);
        let original = table.get(0).unwrap();
        assert_eq!(original.segment.length, 2_000_000);
        assert_eq!(table.total_length(), 4_000_000);
    }

    #[test]
    fn split_refuses_below_floor() {
        let mut table = table_of(&[(0, (1 << 20) * 2 - 1)]);
        assert!(table.split_largest(1 << 20).is_none());
    }

    #[test]
    fn split_preserves_written_prefix() {
        let mut table = table_of(&[(0, 4_000_000)]);
        table.get_mut(0).unwrap().segment.written = 1_000_000;
        let (_, new_segment) = table.split_largest(1 << 20).expect("should split");
        let original = table.get(0).unwrap();
        assert!(original.segment.written <= original.segment.length);
        assert_eq!(original.segment.length, 2_000_000);
        assert_eq!(new_segment.offset, original.segment.offset + original.segment.length);
    }

    #[test]
    fn adjacent_neighbor_prefers_next() {
        let table = table_of(&[(0, 100), (100, 100), (200, 100)]);
        assert_eq!(table.adjacent_neighbor(1), Some(2));
        assert_eq!(table.adjacent_neighbor(2), None);
    }

    #[test]
    fn adjacent_neighbor_falls_back_to_previous() {
        let table = table_of(&[(0, 100), (100, 100)]);
        assert_eq!(table.adjacent_neighbor(1), Some(0));
    }
}
