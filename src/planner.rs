//! Segment Planner (spec §4.2): a pure function from (total bytes, worker
//! count, range support, optional sidecar) to an ordered segment list.
//!
//! Grounded on the teacher crate's `download::partmap::PartMap::new`
//! (equal-chunking over `[0, total)` with the remainder absorbed by the
//! last segment).

use crate::job::Segment;
use crate::sidecar::SidecarRecord;

/// Plans (or replans, on resume) the byte ranges for one Job.
///
/// - `total_bytes = None` (unknown length) or `supports_ranges = false`
///   always yields exactly one segment.
/// - With a matching sidecar, the stored segmentation is returned
///   unchanged — re-partitioning across restarts would invalidate
///   `written` offsets.
pub fn plan(
    total_bytes: Option<u64>,
    requested_workers: u32,
    supports_ranges: bool,
    sidecar: Option<&SidecarRecord>,
) -> Vec<Segment> {
    if let Some(record) = sidecar {
        return record.segments.iter().copied().map(Segment::from).collect();
    }

    if !supports_ranges || total_bytes.is_none() || total_bytes == Some(0) {
        return vec![Segment::new(0, total_bytes.unwrap_or(0))];
    }

    let total = total_bytes.unwrap();
    let workers = requested_workers.max(1) as u64;
    if workers == 1 {
        return vec![Segment::new(0, total)];
    }

    let base = total / workers;
    let mut segments = Vec::with_capacity(workers as usize);
    let mut offset = 0u64;
    for i in 0..workers {
        let length = if i == workers - 1 {
            total - offset
        } else {
            base
        };
        segments.push(Segment::new(offset, length));
        offset += length;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::SidecarSegment;

    #[test]
    fn no_range_support_yields_single_segment() {
        let segs = plan(Some(1_048_576), 8, false, None);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], Segment::new(0, 1_048_576));
    }

    #[test]
    fn unknown_total_yields_single_segment() {
        let segs = plan(None, 8, true, None);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], Segment::new(0, 0));
    }

    #[test]
    fn zero_length_yields_single_segment() {
        let segs = plan(Some(0), 8, true, None);
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn partitions_evenly_with_remainder_on_last() {
        let segs = plan(Some(4_000_000), 4, true, None);
        assert_eq!(segs.len(), 4);
        for seg in &segs[..3] {
            assert_eq!(seg.length, 1_000_000);
        }
        assert_eq!(segs[3].length, 1_000_000);
        // contiguous, non-overlapping, covering [0, total)
        let mut cursor = 0u64;
        for seg in &segs {
            assert_eq!(seg.offset, cursor);
            cursor += seg.length;
        }
        assert_eq!(cursor, 4_000_000);
    }

    #[test]
    fn uneven_total_absorbs_remainder_in_last_segment() {
        let segs = plan(Some(10), 3, true, None);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].length, 3);
        assert_eq!(segs[1].length, 3);
        assert_eq!(segs[2].length, 4);
        let total: u64 = segs.iter().map(|s| s.length).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn sidecar_segmentation_is_returned_unchanged_regardless_of_requested_workers() {
        let record = SidecarRecord {
            url: "https://example.com/f".into(),
            total_bytes: 100,
            content_type: String::new(),
            last_update: 0.0,
            segments: vec![
                SidecarSegment { offset: 0, length: 60, written: 30 },
                SidecarSegment { offset: 60, length: 40, written: 0 },
            ],
        };
        // Ask for 8 workers this time; sidecar still wins.
        let segs = plan(Some(100), 8, true, Some(&record));
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].written, 30);
        assert_eq!(segs[0].length, 60);
        assert_eq!(segs[1].length, 40);
    }

    #[test]
    fn single_worker_request_yields_single_segment() {
        let segs = plan(Some(100), 1, true, None);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], Segment::new(0, 100));
    }
}
