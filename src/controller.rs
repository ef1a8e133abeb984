//! Adaptive Controller (spec §4.4): observes per-worker throughput and an
//! optional server rate hint, and decides whether to remove a straggling
//! worker (merging its remaining range into a neighbor) or add one
//! (splitting the largest remaining segment).
//!
//! The decision logic is kept as a pure function (`decide`) over a snapshot
//! of worker stats, generalizing the teacher crate's
//! `scheduler::Scheduler::on_segment_complete` (interval-gated,
//! recent-throughput-averaging, single `target_parallelism` knob) into the
//! spec's relative-to-median / relative-to-hint comparisons and
//! merge/split segment actions. Keeping it pure (no I/O, no locks) makes the
//! spec's empirical thresholds exhaustively unit-testable.

use std::collections::HashMap;

use crate::config::ControllerConfig;

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub remaining_bytes: u64,
    pub throughput_bps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControllerAction {
    None,
    /// Remove the slowest worker; its segment's remaining bytes are handed
    /// off to `merge_into` (the id of an adjacent segment), or dropped back
    /// to a single-worker state if no neighbor exists.
    RemoveStraggler {
        straggler_id: WorkerId,
        merge_into: Option<WorkerId>,
    },
    /// Split the largest remaining segment in half and spawn a new worker
    /// for the new half.
    SplitLargest { segment_id: WorkerId },
}

/// Per-job state carried across ticks: how many consecutive ticks each
/// worker has spent below the straggler threshold, and the previous tick's
/// median throughput (for the plateau comparison).
#[derive(Debug, Default)]
pub struct ControllerState {
    pub below_threshold_ticks: HashMap<WorkerId, u8>,
    pub previous_median_bps: Option<f64>,
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// One controller tick (spec §4.4). `active_count` and `requested_workers`
/// bound the decision to `[1, requested_workers]`; `merge_neighbor` picks
/// the adjacent segment a removed straggler's bytes fold into (the caller
/// supplies adjacency since the controller has no segment-ordering
/// knowledge of its own); `largest_remaining` picks the split candidate.
#[allow(clippy::too_many_arguments)]
pub fn decide(
    workers: &[WorkerSnapshot],
    active_count: usize,
    requested_workers: u32,
    server_hint_bps: Option<f64>,
    cfg: &ControllerConfig,
    state: &mut ControllerState,
    merge_neighbor: impl Fn(WorkerId) -> Option<WorkerId>,
    largest_remaining: impl Fn() -> Option<(WorkerId, u64)>,
) -> ControllerAction {
    if workers.is_empty() {
        return ControllerAction::None;
    }

    let mut throughputs: Vec<f64> = workers.iter().map(|w| w.throughput_bps).collect();
    let median_bps = median(&mut throughputs);

    // Straggler detection: below `straggler_fraction` of median for two
    // consecutive ticks.
    let mut straggler: Option<WorkerId> = None;
    let mut seen: std::collections::HashSet<WorkerId> = std::collections::HashSet::new();
    for worker in workers {
        seen.insert(worker.id);
        let threshold = median_bps * cfg.straggler_fraction;
        let is_slow = median_bps > 0.0 && worker.throughput_bps < threshold;
        let count = state.below_threshold_ticks.entry(worker.id).or_insert(0);
        if is_slow {
            *count = count.saturating_add(1);
        } else {
            *count = 0;
        }
        if *count >= 2 && straggler.is_none() && active_count > 1 {
            straggler = Some(worker.id);
        }
    }
    // Drop bookkeeping for workers no longer present (merged/completed).
    state.below_threshold_ticks.retain(|id, _| seen.contains(id));

    if let Some(straggler_id) = straggler {
        let merge_into = merge_neighbor(straggler_id);
        state.previous_median_bps = Some(median_bps);
        return ControllerAction::RemoveStraggler {
            straggler_id,
            merge_into,
        };
    }

    // Scale-up: median exceeds 0.9x the server hint, or throughput has
    // plateaued within 5% of the previous tick, while under the requested
    // worker count.
    let hint_exceeded = server_hint_bps
        .map(|hint| median_bps > cfg.hint_fraction * hint)
        .unwrap_or(false);
    let plateaued = state
        .previous_median_bps
        .map(|prev| prev > 0.0 && (median_bps - prev).abs() <= prev * cfg.plateau_fraction)
        .unwrap_or(false);

    state.previous_median_bps = Some(median_bps);

    if (hint_exceeded || plateaued) && active_count < requested_workers as usize {
        if let Some((segment_id, remaining)) = largest_remaining() {
            if remaining >= cfg.min_segment_bytes * 2 {
                return ControllerAction::SplitLargest { segment_id };
            }
        }
    }

    ControllerAction::None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ControllerConfig {
        ControllerConfig::default()
    }

    #[test]
    fn no_action_with_uniform_throughput_and_no_hint() {
        let workers = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 10_000_000, throughput_bps: 1_000_000.0 },
            WorkerSnapshot { id: 2, remaining_bytes: 10_000_000, throughput_bps: 1_000_000.0 },
        ];
        let mut state = ControllerState::default();
        let action = decide(
            &workers, 2, 4, None, &cfg(), &mut state,
            |_| None, || None,
        );
        assert_eq!(action, ControllerAction::None);
    }

    #[test]
    fn straggler_requires_two_consecutive_ticks() {
        let mut state = ControllerState::default();
        let slow_worker = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 10_000_000, throughput_bps: 10_000.0 },
            WorkerSnapshot { id: 2, remaining_bytes: 10_000_000, throughput_bps: 1_000_000.0 },
            WorkerSnapshot { id: 3, remaining_bytes: 10_000_000, throughput_bps: 1_000_000.0 },
        ];
        // First tick below threshold: not yet removed.
        let action = decide(&slow_worker, 3, 4, None, &cfg(), &mut state, |_| Some(2), || None);
        assert_eq!(action, ControllerAction::None);
        assert_eq!(state.below_threshold_ticks.get(&1), Some(&1));

        // Second consecutive tick below threshold: removed.
        let action = decide(&slow_worker, 3, 4, None, &cfg(), &mut state, |_| Some(2), || None);
        assert_eq!(
            action,
            ControllerAction::RemoveStraggler { straggler_id: 1, merge_into: Some(2) }
        );
    }

    #[test]
    fn straggler_recovering_resets_count() {
        let mut state = ControllerState::default();
        let slow = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 1, throughput_bps: 10_000.0 },
            WorkerSnapshot { id: 2, remaining_bytes: 1, throughput_bps: 1_000_000.0 },
        ];
        decide(&slow, 2, 4, None, &cfg(), &mut state, |_| Some(2), || None);
        assert_eq!(state.below_threshold_ticks.get(&1), Some(&1));

        let recovered = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 1, throughput_bps: 900_000.0 },
            WorkerSnapshot { id: 2, remaining_bytes: 1, throughput_bps: 1_000_000.0 },
        ];
        decide(&recovered, 2, 4, None, &cfg(), &mut state, |_| Some(2), || None);
        assert_eq!(state.below_threshold_ticks.get(&1), Some(&0));
    }

    #[test]
    fn never_removes_the_only_worker() {
        let mut state = ControllerState::default();
        let solo = vec![WorkerSnapshot { id: 1, remaining_bytes: 1, throughput_bps: 0.0 }];
        decide(&solo, 1, 4, None, &cfg(), &mut state, |_| None, || None);
        let action = decide(&solo, 1, 4, None, &cfg(), &mut state, |_| None, || None);
        assert_eq!(action, ControllerAction::None);
    }

    #[test]
    fn scales_up_when_hint_exceeded() {
        let mut state = ControllerState::default();
        let workers = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 10_000_000, throughput_bps: 2_000_000.0 },
            WorkerSnapshot { id: 2, remaining_bytes: 20_000_000, throughput_bps: 2_000_000.0 },
        ];
        let action = decide(
            &workers, 2, 4, Some(2_000_000.0), &cfg(), &mut state,
            |_| None, || Some((2, 20_000_000)),
        );
        assert_eq!(action, ControllerAction::SplitLargest { segment_id: 2 });
    }

    #[test]
    fn does_not_scale_up_past_requested_workers() {
        let mut state = ControllerState::default();
        let workers = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 10_000_000, throughput_bps: 2_000_000.0 },
            WorkerSnapshot { id: 2, remaining_bytes: 20_000_000, throughput_bps: 2_000_000.0 },
        ];
        // active_count == requested_workers: no further scale-up.
        let action = decide(
            &workers, 2, 2, Some(2_000_000.0), &cfg(), &mut state,
            |_| None, || Some((2, 20_000_000)),
        );
        assert_eq!(action, ControllerAction::None);
    }

    #[test]
    fn does_not_split_below_min_segment_floor() {
        let mut state = ControllerState::default();
        let workers = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 1_000_000, throughput_bps: 2_000_000.0 },
        ];
        let action = decide(
            &workers, 1, 4, Some(2_000_000.0), &cfg(), &mut state,
            |_| None, || Some((1, 1 << 20)), // exactly the floor, needs 2x
        );
        assert_eq!(action, ControllerAction::None);
    }

    #[test]
    fn scales_up_on_plateau_within_five_percent() {
        let mut state = ControllerState {
            below_threshold_ticks: HashMap::new(),
            previous_median_bps: Some(1_000_000.0),
        };
        let workers = vec![
            WorkerSnapshot { id: 1, remaining_bytes: 10_000_000, throughput_bps: 1_020_000.0 },
            WorkerSnapshot { id: 2, remaining_bytes: 20_000_000, throughput_bps: 1_020_000.0 },
        ];
        let action = decide(
            &workers, 2, 4, None, &cfg(), &mut state,
            |_| None, || Some((2, 20_000_000)),
        );
        assert_eq!(action, ControllerAction::SplitLargest { segment_id: 2 });
    }

    #[test]
    fn empty_worker_set_is_a_no_op() {
        let mut state = ControllerState::default();
        let action = decide(&[], 0, 4, None, &cfg(), &mut state, |_| None, || None);
        assert_eq!(action, ControllerAction::None);
    }
}
