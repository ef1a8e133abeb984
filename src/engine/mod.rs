//! Transfer Engine (spec §4.3): drives one Job from probe through a
//! completed, paused, cancelled, or failed part file. Owns the segment
//! table, the worker pool, the optional Adaptive Controller tick, and the
//! throttled sidecar/progress reporting for that one job.
//!
//! Grounded on the teacher crate's `download::manager::DownloadManager::
//! download_segments` run loop (probe -> prepare file -> load/create part
//! map -> spawn segment tasks via `JoinSet` -> drain completions ->
//! finalize), restructured around the spec's resumable sidecar, adaptive
//! controller, and pause/cancel control surface.

pub mod control;
pub mod table;
pub mod worker;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
use nix::errno::Errno;
#[cfg(target_os = "linux")]
use nix::fcntl::{fallocate, FallocateFlags};
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

use crate::config::ControllerConfig;
use crate::controller::{self, ControllerAction, ControllerState, WorkerSnapshot};
use crate::error::CoreError;
use crate::http_probe;
use crate::job::Segment;
use crate::planner;
use crate::sidecar::{self, SidecarRecord, SidecarStore};

pub use control::{ControlState, EngineControl};
pub use table::{SegmentId, SegmentTable};
pub use worker::{run_segment, WorkerHandle, WorkerOutcome};

const PROGRESS_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    Progress {
        received_bytes: u64,
        total_bytes: Option<u64>,
        speed_bps: f64,
        active_workers: u32,
    },
}

#[derive(Debug)]
pub enum EngineOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed(CoreError),
}

pub struct TransferEngine {
    client: Client,
    url: Url,
    part_path: PathBuf,
    final_path: PathBuf,
    sidecar_path: PathBuf,
    requested_workers: u32,
    adaptive: bool,
    controller_cfg: ControllerConfig,
}

impl TransferEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        url: Url,
        part_path: PathBuf,
        final_path: PathBuf,
        sidecar_path: PathBuf,
        requested_workers: u32,
        adaptive: bool,
        controller_cfg: ControllerConfig,
    ) -> (Self, Arc<EngineControl>) {
        let (control, _rx) = EngineControl::new();
        (
            Self {
                client,
                url,
                part_path,
                final_path,
                sidecar_path,
                requested_workers,
                adaptive,
                controller_cfg,
            },
            control,
        )
    }

    pub async fn run(
        self,
        control: Arc<EngineControl>,
        updates: mpsc::UnboundedSender<EngineUpdate>,
    ) -> EngineOutcome {
        match self.run_inner(&control, &updates).await {
            Ok(outcome) => outcome,
            Err(err) => EngineOutcome::Failed(err),
        }
    }

    async fn run_inner(
        &self,
        control: &Arc<EngineControl>,
        updates: &mpsc::UnboundedSender<EngineUpdate>,
    ) -> Result<EngineOutcome, CoreError> {
        let probe = http_probe::probe(&self.client, &self.url).await?;
        control.set_supports_ranges(probe.accepts_ranges);

        let sidecar_store = Arc::new(SidecarStore::new(self.sidecar_path.clone()));
        let sidecar = sidecar::load_if_matching(&sidecar_store, self.url.as_str(), &self.part_path).await;

        let total_bytes = probe.total_bytes;
        let content_type = probe.content_type.clone();
        let server_hint_bps = parse_rate_hint(&self.url);
        let segments = planner::plan(
            total_bytes,
            self.requested_workers,
            probe.accepts_ranges,
            sidecar.as_ref(),
        );

        ensure_parent_dir(&self.part_path)?;
        let file = Arc::new(prepare_part_file(
            &self.part_path,
            total_bytes.unwrap_or(0),
            sidecar.is_some(),
        )?);

        let table = Arc::new(Mutex::new(SegmentTable::new(segments)));

        let worker_handle = Arc::new(WorkerHandle {
            client: self.client.clone(),
            url: self.url.clone(),
            file: file.clone(),
            table: table.clone(),
            control: control.clone(),
        });

        let mut join_set: JoinSet<(SegmentId, Result<WorkerOutcome, CoreError>)> = JoinSet::new();
        for id in table.lock().await.active_ids() {
            spawn_worker(&mut join_set, worker_handle.clone(), id);
        }

        let mut controller_state = ControllerState::default();
        let mut controller_tick = interval(self.controller_cfg.tick_interval);
        controller_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut progress_tick = interval(PROGRESS_TICK);
        progress_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            if join_set.is_empty() {
                let all_complete = table.lock().await.all_complete();
                if all_complete {
                    break None;
                }
                // No active workers left but segments remain: every worker
                // exited via Retired/Cancelled without finishing its range.
                if control.is_cancelled() {
                    break Some(EngineOutcome::Cancelled);
                }
                if control.is_pausing() {
                    break Some(EngineOutcome::Paused);
                }
                break Some(EngineOutcome::Failed(CoreError::Incomplete {
                    received: table.lock().await.total_written(),
                    total: table.lock().await.total_length(),
                }));
            }

            tokio::select! {
                Some(res) = join_set.join_next() => {
                    match res {
                        Ok((_id, Ok(WorkerOutcome::Completed))) | Ok((_id, Ok(WorkerOutcome::Retired))) => {}
                        Ok((_id, Ok(WorkerOutcome::Cancelled))) => {
                            if control.is_cancelled() {
                                break Some(EngineOutcome::Cancelled);
                            }
                            if control.is_pausing() {
                                break Some(EngineOutcome::Paused);
                            }
                        }
                        Ok((id, Err(err))) => {
                            warn!(segment = id, error = %err, "segment permanently failed");
                            break Some(EngineOutcome::Failed(err));
                        }
                        Err(join_err) => {
                            break Some(EngineOutcome::Failed(CoreError::LocalIo(format!(
                                "segment task panicked: {join_err}"
                            ))));
                        }
                    }
                }
                _ = controller_tick.tick(), if self.adaptive => {
                    self.run_controller_tick(&table, &mut controller_state, server_hint_bps, &worker_handle, &mut join_set).await;
                }
                _ = progress_tick.tick() => {
                    self.report_progress(&table, total_bytes, updates).await;
                    self.write_sidecar_throttled(&table, &sidecar_store, total_bytes, &content_type).await;
                }
            }

            if control.is_cancelled() {
                break Some(EngineOutcome::Cancelled);
            }
        };

        // Drain any stragglers so the part file and table settle before we
        // decide the final outcome.
        while let Some(res) = join_set.join_next().await {
            if let Ok((id, Err(err))) = res {
                debug!(segment = id, error = %err, "late segment failure after engine decision");
            }
        }

        let final_outcome = match outcome {
            Some(outcome) => outcome,
            None => EngineOutcome::Completed,
        };

        self.finalize(&table, &sidecar_store, total_bytes, &content_type, &final_outcome)
            .await?;

        Ok(final_outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_controller_tick(
        &self,
        table: &Arc<Mutex<SegmentTable>>,
        state: &mut ControllerState,
        server_hint_bps: Option<f64>,
        worker_handle: &Arc<WorkerHandle>,
        join_set: &mut JoinSet<(SegmentId, Result<WorkerOutcome, CoreError>)>,
    ) {
        let snapshots: Vec<WorkerSnapshot> = {
            let guard = table.lock().await;
            let mut out = Vec::new();
            for id in guard.active_ids() {
                if let Some(tracked) = guard.get(id) {
                    out.push(WorkerSnapshot {
                        id,
                        remaining_bytes: tracked.segment.remaining(),
                        throughput_bps: tracked.speed.speed_bps().await,
                    });
                }
            }
            out
        };
        if snapshots.is_empty() {
            return;
        }
        let active_count = snapshots.len();

        let action = {
            let guard = table.lock().await;
            controller::decide(
                &snapshots,
                active_count,
                self.requested_workers,
                server_hint_bps,
                &self.controller_cfg,
                state,
                |id| guard.adjacent_neighbor(id),
                || guard.largest_remaining(),
            )
        };

        match action {
            ControllerAction::None => {}
            ControllerAction::RemoveStraggler { straggler_id, merge_into } => {
                info!(straggler = straggler_id, neighbor = ?merge_into, "retiring straggler worker");
                let mut guard = table.lock().await;
                if let Some(neighbor) = merge_into {
                    guard.reassign_straggler(straggler_id, neighbor);
                } else if let Some(tracked) = guard.get_mut(straggler_id) {
                    // No neighbor to fold into; freeze it in place and let
                    // the remaining workers carry the rest.
                    tracked.segment.length = tracked.segment.written;
                    tracked.retired = true;
                }
            }
            ControllerAction::SplitLargest { segment_id } => {
                let new_segment = {
                    let mut guard = table.lock().await;
                    guard.split_largest(self.controller_cfg.min_segment_bytes)
                };
                if let Some((new_id, segment)) = new_segment {
                    info!(parent = segment_id, new_id, bytes = segment.length, "scaling up: splitting largest segment");
                    spawn_worker(join_set, worker_handle.clone(), new_id);
                }
            }
        }
    }

    async fn report_progress(
        &self,
        table: &Arc<Mutex<SegmentTable>>,
        total_bytes: Option<u64>,
        updates: &mpsc::UnboundedSender<EngineUpdate>,
    ) {
        let guard = table.lock().await;
        let received_bytes = guard.total_written();
        let active_workers = guard.active_ids().len() as u32;
        let mut speed_bps = 0.0;
        for id in guard.active_ids() {
            if let Some(tracked) = guard.get(id) {
                speed_bps += tracked.speed.speed_bps().await;
            }
        }
        let _ = updates.send(EngineUpdate::Progress {
            received_bytes,
            total_bytes,
            speed_bps,
            active_workers,
        });
    }

    async fn write_sidecar_throttled(
        &self,
        table: &Arc<Mutex<SegmentTable>>,
        store: &SidecarStore,
        total_bytes: Option<u64>,
        content_type: &str,
    ) {
        let segments = table.lock().await.snapshot_segments();
        let record = SidecarRecord::new(
            self.url.as_str(),
            total_bytes.unwrap_or(0),
            content_type,
            &segments,
        );
        store.write_throttled(&record).await;
    }

    async fn finalize(
        &self,
        table: &Arc<Mutex<SegmentTable>>,
        store: &SidecarStore,
        total_bytes: Option<u64>,
        content_type: &str,
        outcome: &EngineOutcome,
    ) -> Result<(), CoreError> {
        let segments = table.lock().await.snapshot_segments();
        let record = SidecarRecord::new(self.url.as_str(), total_bytes.unwrap_or(0), content_type, &segments);
        // Spec §4.1: forced write precedes every terminal status report.
        store.write_forced(&record).await.map_err(CoreError::from)?;

        match outcome {
            EngineOutcome::Completed => {
                rename_with_retry(&self.part_path, &self.final_path).await?;
                store.delete().await;
            }
            EngineOutcome::Cancelled => {
                store.delete().await;
                let _ = tokio::fs::remove_file(&self.part_path).await;
            }
            EngineOutcome::Paused | EngineOutcome::Failed(_) => {
                // Sidecar and part file remain on disk for a future resume.
            }
        }
        Ok(())
    }
}

fn spawn_worker(
    join_set: &mut JoinSet<(SegmentId, Result<WorkerOutcome, CoreError>)>,
    handle: Arc<WorkerHandle>,
    segment_id: SegmentId,
) {
    join_set.spawn(async move {
        let outcome = run_segment(&handle, segment_id).await;
        (segment_id, outcome)
    });
}

/// Renames the finished part file into place, retrying once on transient
/// failure (e.g. a concurrent antivirus scan holding the handle open).
async fn rename_with_retry(from: &Path, to: &Path) -> Result<(), CoreError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(first_err) => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tokio::fs::rename(from, to).await.map_err(|_| CoreError::from(first_err))
        }
    }
}

/// Spec §4.4: a `rate=<bytes_per_sec>` query parameter on the source URL is
/// treated as the server's per-connection rate hint.
fn parse_rate_hint(url: &Url) -> Option<f64> {
    url.query_pairs()
        .find(|(key, _)| key == "rate")
        .and_then(|(_, value)| value.parse::<f64>().ok())
        .filter(|v| *v > 0.0)
}

fn ensure_parent_dir(path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn prepare_part_file(path: &Path, size: u64, resuming: bool) -> Result<File, CoreError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(path)?;

    if !resuming || file.metadata()?.len() < size {
        preallocate(&file, size)?;
    }
    Ok(file)
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, size: u64) -> Result<(), CoreError> {
    if size > 0 {
        if let Err(err) = fallocate(file.as_raw_fd(), FallocateFlags::FALLOC_FL_KEEP_SIZE, 0, size as i64) {
            if err != Errno::ENOTSUP && err != Errno::EINVAL {
                return Err(CoreError::LocalIo(format!("fallocate failed: {err}")));
            }
        }
    }
    file.set_len(size)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, size: u64) -> Result<(), CoreError> {
    file.set_len(size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prepare_part_file_allocates_requested_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.part");
        let file = prepare_part_file(&path, 4096, false).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);
    }

    #[test]
    fn rate_hint_parses_query_parameter() {
        let url = Url::parse("https://example.com/f?rate=500000").unwrap();
        assert_eq!(parse_rate_hint(&url), Some(500_000.0));
    }

    #[test]
    fn rate_hint_absent_without_query_parameter() {
        let url = Url::parse("https://example.com/f").unwrap();
        assert_eq!(parse_rate_hint(&url), None);
    }

    #[test]
    fn prepare_part_file_skips_reallocation_when_resuming_with_enough_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.part");
        {
            let file = prepare_part_file(&path, 4096, false).unwrap();
            drop(file);
        }
        let file = prepare_part_file(&path, 2048, true).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);
    }
}
