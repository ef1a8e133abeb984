//! Queue Orchestrator (spec §4.5): admits jobs, runs at most K Transfer
//! Engines concurrently, marshals their progress onto a single dispatch
//! task, and broadcasts to subscribers with an id-keyed, O(1)-unsubscribe
//! registry.
//!
//! Grounded on the teacher crate's `progress::ProgressReporter::spawn`
//! (channel-driven background task pattern: a `tokio::spawn`ed loop reading
//! from a channel and rendering/forwarding), generalized from a single
//! progress display into a full scheduler actor. The admission critical
//! section (mark Downloading + insert into `active` under one lock, before
//! any `await`) directly follows spec §9's called-out bugfix — the teacher
//! never ran more than one job, so this has no teacher precedent to adapt.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{Client, Url};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{EngineControl, EngineOutcome, EngineUpdate, TransferEngine};
use crate::error::CoreError;
use crate::job::{Job, JobId, JobParams, JobStatus, JobSummary};

pub type SubscriberId = u64;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

struct JobEntry {
    job: Job,
    control: Option<Arc<EngineControl>>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, JobEntry>,
    order: Vec<JobId>,
    ready: VecDeque<JobId>,
    active: HashSet<JobId>,
}

/// Marks the next eligible Queued/resumed-Paused jobs Downloading and
/// inserts them into `active`, entirely under the caller's lock. The caller
/// spawns each returned id's Transfer Engine after releasing the lock —
/// this ordering is the fix for spec §9's admission race.
fn admit_locked(state: &mut SchedulerState, cap: usize) -> Vec<JobId> {
    let mut admitted = Vec::new();
    while state.active.len() < cap {
        let Some(id) = state.ready.pop_front() else {
            break;
        };
        if let Some(entry) = state.jobs.get_mut(&id) {
            if entry.job.status.can_transition(JobStatus::Downloading) {
                entry.job.status = JobStatus::Downloading;
                state.active.insert(id);
                admitted.push(id);
            }
        }
    }
    admitted
}

enum DispatchMessage {
    Progress { id: JobId, update: EngineUpdate },
    Finished { id: JobId, outcome: EngineOutcome },
    Retrigger,
}

pub struct Orchestrator {
    config: Config,
    client: Client,
    state: Mutex<SchedulerState>,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<JobSummary>>>,
    next_subscriber_id: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<DispatchMessage>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Arc<Self> {
        let client = build_client();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            config,
            client,
            state: Mutex::new(SchedulerState::default()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            dispatch_tx,
        });

        let dispatch_owner = orchestrator.clone();
        tokio::spawn(async move { dispatch_owner.run_dispatch_loop(dispatch_rx).await });

        let cleanup_owner = orchestrator.clone();
        tokio::spawn(async move { cleanup_owner.run_cleanup_loop().await });

        orchestrator
    }

    pub async fn add(
        &self,
        url: Url,
        dest_dir: std::path::PathBuf,
        filename: Option<String>,
        params: JobParams,
    ) -> Result<JobId, CoreError> {
        if url.scheme() != "https" {
            return Err(CoreError::Validation(format!(
                "URL must use https, got {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CoreError::Validation("URL has no host".into()))?;
        if !self.config.host_allowed(host) {
            return Err(CoreError::Validation(format!("host {host} is not allowlisted")));
        }
        if params.requested_workers < 1 || params.requested_workers > self.config.max_workers_per_job {
            return Err(CoreError::Validation(format!(
                "requested_workers must be in 1..={}",
                self.config.max_workers_per_job
            )));
        }

        let filename = filename.unwrap_or_else(|| derive_filename(&url));
        let job = Job {
            id: uuid::Uuid::new_v4(),
            source_url: url,
            dest_dir,
            filename,
            params,
            status: JobStatus::Queued,
            total_bytes: None,
            received_bytes: 0,
            speed_bps: 0.0,
            active_workers: 0,
            error_message: None,
            created_at: now_epoch(),
            completed_at: None,
        };
        let id = job.id;

        let admitted = {
            let mut state = self.state.lock().await;
            state.jobs.insert(id, JobEntry { job, control: None });
            state.order.push(id);
            state.ready.push_back(id);
            admit_locked(&mut state, self.config.max_concurrent_jobs)
        };
        for admitted_id in admitted {
            self.spawn_engine(admitted_id).await;
        }
        self.broadcast_snapshot(id).await;
        Ok(id)
    }

    pub async fn list(&self) -> Vec<JobSummary> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|entry| entry.job.to_summary())
            .collect()
    }

    pub async fn get(&self, id: JobId) -> Option<JobSummary> {
        let state = self.state.lock().await;
        state.jobs.get(&id).map(|entry| entry.job.to_summary())
    }

    pub async fn pause(&self, id: JobId) -> Result<(), CoreError> {
        let state = self.state.lock().await;
        let entry = state
            .jobs
            .get(&id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if entry.job.status != JobStatus::Downloading {
            return Err(CoreError::IllegalTransition(format!(
                "cannot pause a job in {:?} state",
                entry.job.status
            )));
        }
        let control = entry
            .control
            .clone()
            .ok_or_else(|| CoreError::IllegalTransition("job has no running engine".into()))?;
        drop(state);
        control.request_pause()
    }

    pub async fn resume(&self, id: JobId) -> Result<(), CoreError> {
        let admitted = {
            let mut state = self.state.lock().await;
            let entry = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            if entry.job.status != JobStatus::Paused {
                return Err(CoreError::IllegalTransition(format!(
                    "cannot resume a job in {:?} state",
                    entry.job.status
                )));
            }
            state.ready.push_back(id);
            admit_locked(&mut state, self.config.max_concurrent_jobs)
        };
        for admitted_id in admitted {
            self.spawn_engine(admitted_id).await;
        }
        Ok(())
    }

    pub async fn cancel(&self, id: JobId) -> Result<(), CoreError> {
        let control = {
            let mut state = self.state.lock().await;
            let entry = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            if !entry.job.status.can_transition(JobStatus::Cancelled) {
                return Err(CoreError::IllegalTransition(format!(
                    "cannot cancel a job in {:?} state",
                    entry.job.status
                )));
            }
            match entry.control.clone() {
                Some(control) => Some(control),
                None => {
                    // Queued, or Paused with no live engine: cancel synchronously.
                    entry.job.status = JobStatus::Cancelled;
                    entry.job.completed_at = Some(now_epoch());
                    state.ready.retain(|qid| *qid != id);
                    None
                }
            }
        };
        match control {
            Some(control) => control.request_cancel(),
            None => self.broadcast_snapshot(id).await,
        }
        Ok(())
    }

    pub async fn remove(&self, id: JobId) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .jobs
            .get(&id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if !entry.job.status.is_terminal() {
            return Err(CoreError::IllegalTransition(
                "cannot remove a non-terminal job".into(),
            ));
        }
        state.jobs.remove(&id);
        state.order.retain(|qid| *qid != id);
        Ok(())
    }

    /// Spec §4.5 `cleanup(age)`: removes terminal entries older than
    /// `config.cleanup_age`, or beyond `config.max_completed` (newest
    /// retained), whichever applies first.
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = now_epoch();
        let cleanup_age = self.config.cleanup_age.as_secs_f64();
        let max_completed = self.config.max_completed;

        let mut terminal: Vec<JobId> = state
            .order
            .iter()
            .copied()
            .filter(|id| {
                state
                    .jobs
                    .get(id)
                    .map(|e| e.job.status.is_terminal())
                    .unwrap_or(false)
            })
            .collect();
        terminal.sort_by(|a, b| {
            let ca = state.jobs[a].job.created_at;
            let cb = state.jobs[b].job.created_at;
            cb.partial_cmp(&ca).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut removed = 0usize;
        for (rank, id) in terminal.iter().enumerate() {
            let age = {
                let entry = &state.jobs[id];
                now - entry.job.completed_at.unwrap_or(entry.job.created_at)
            };
            if age > cleanup_age || rank >= max_completed {
                state.jobs.remove(id);
                removed += 1;
            }
        }
        state.order.retain(|id| state.jobs.contains_key(id));
        removed
    }

    pub async fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<JobSummary>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.lock().await.remove(&id);
    }

    async fn spawn_engine(&self, id: JobId) {
        let (client, url, part_path, final_path, sidecar_path, requested_workers, adaptive) = {
            let state = self.state.lock().await;
            let Some(entry) = state.jobs.get(&id) else {
                return;
            };
            (
                self.client.clone(),
                entry.job.source_url.clone(),
                entry.job.part_path(),
                entry.job.final_path(),
                entry.job.sidecar_path(),
                entry.job.params.requested_workers,
                entry.job.params.adaptive,
            )
        };

        let (engine, control) = TransferEngine::new(
            client,
            url,
            part_path,
            final_path,
            sidecar_path,
            requested_workers,
            adaptive,
            self.config.controller,
        );

        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.jobs.get_mut(&id) {
                entry.control = Some(control.clone());
            }
        }

        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let dispatch_tx = self.dispatch_tx.clone();
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                let _ = dispatch_tx.send(DispatchMessage::Progress { id, update });
            }
        });

        let dispatch_tx = self.dispatch_tx.clone();
        tokio::spawn(async move {
            let outcome = engine.run(control, update_tx).await;
            let _ = dispatch_tx.send(DispatchMessage::Finished { id, outcome });
        });
    }

    async fn run_dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DispatchMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                DispatchMessage::Progress { id, update } => {
                    self.apply_progress(id, update).await;
                    self.broadcast_snapshot(id).await;
                }
                DispatchMessage::Finished { id, outcome } => {
                    self.apply_finished(id, outcome).await;
                    self.broadcast_snapshot(id).await;
                    self.retrigger_admission().await;
                }
                DispatchMessage::Retrigger => {
                    self.retrigger_admission().await;
                }
            }
        }
    }

    async fn apply_progress(&self, id: JobId, update: EngineUpdate) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.jobs.get_mut(&id) {
            match update {
                EngineUpdate::Progress {
                    received_bytes,
                    total_bytes,
                    speed_bps,
                    active_workers,
                } => {
                    entry.job.received_bytes = received_bytes;
                    entry.job.total_bytes = entry.job.total_bytes.or(total_bytes);
                    entry.job.speed_bps = speed_bps;
                    entry.job.active_workers = active_workers;
                }
            }
        }
    }

    async fn apply_finished(&self, id: JobId, outcome: EngineOutcome) {
        let mut state = self.state.lock().await;
        state.active.remove(&id);
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        entry.control = None;
        let now = now_epoch();
        match outcome {
            EngineOutcome::Completed => {
                entry.job.status = JobStatus::Completed;
                entry.job.completed_at = Some(now);
                info!(job = %id, "job completed");
            }
            EngineOutcome::Paused => {
                entry.job.status = JobStatus::Paused;
                debug!(job = %id, "job paused");
            }
            EngineOutcome::Cancelled => {
                entry.job.status = JobStatus::Cancelled;
                entry.job.completed_at = Some(now);
                info!(job = %id, "job cancelled");
            }
            EngineOutcome::Failed(err) => {
                entry.job.status = JobStatus::Failed;
                entry.job.error_message = Some(err.to_string());
                entry.job.completed_at = Some(now);
                warn!(job = %id, error = %err, "job failed");
            }
        }
    }

    async fn retrigger_admission(&self) {
        let admitted = {
            let mut state = self.state.lock().await;
            admit_locked(&mut state, self.config.max_concurrent_jobs)
        };
        for id in admitted {
            self.spawn_engine(id).await;
        }
    }

    async fn broadcast_snapshot(&self, id: JobId) {
        let summary = {
            let state = self.state.lock().await;
            match state.jobs.get(&id) {
                Some(entry) => entry.job.to_summary(),
                None => return,
            }
        };
        let mut subscribers = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (sub_id, tx) in subscribers.iter() {
            if tx.send(summary.clone()).is_err() {
                dead.push(*sub_id);
            }
        }
        for sub_id in dead {
            subscribers.remove(&sub_id);
            debug!(subscriber = sub_id, "deregistered disconnected subscriber");
        }
    }

    async fn run_cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            // cleanup() is infallible (in-memory bookkeeping only), so the
            // bounded-retries budget exists for a future per-job removal
            // step (e.g. deleting stray sidecar files) that can fail.
            let removed = self.cleanup().await;
            debug!(removed, "periodic cleanup tick");
        }
    }
}

fn build_client() -> Client {
    Client::builder()
        .user_agent("multifetch/0.1")
        .redirect(reqwest::redirect::Policy::limited(10))
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_nodelay(true)
        .http2_adaptive_window(true)
        .http2_keep_alive_interval(Some(Duration::from_secs(10)))
        .http2_keep_alive_timeout(Duration::from_secs(20))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|err| {
            error!(error = %err, "failed to build HTTP client with full options, falling back to defaults");
            Client::new()
        })
}

fn derive_filename(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "download.bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_filename_uses_last_path_segment() {
        let url = Url::parse("https://example.com/files/report.pdf").unwrap();
        assert_eq!(derive_filename(&url), "report.pdf");
    }

    #[test]
    fn derive_filename_falls_back_for_empty_path() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(derive_filename(&url), "download.bin");
    }

    #[test]
    fn admit_locked_respects_cap_and_fifo_order() {
        let mut state = SchedulerState::default();
        for _ in 0..3 {
            let job = Job {
                id: uuid::Uuid::new_v4(),
                source_url: Url::parse("https://example.com/f").unwrap(),
                dest_dir: std::path::PathBuf::from("/tmp"),
                filename: "f".into(),
                params: JobParams { requested_workers: 1, adaptive: false },
                status: JobStatus::Queued,
                total_bytes: None,
                received_bytes: 0,
                speed_bps: 0.0,
                active_workers: 0,
                error_message: None,
                created_at: 0.0,
                completed_at: None,
            };
            let id = job.id;
            state.jobs.insert(id, JobEntry { job, control: None });
            state.order.push(id);
            state.ready.push_back(id);
        }

        let admitted = admit_locked(&mut state, 2);
        assert_eq!(admitted.len(), 2);
        assert_eq!(state.active.len(), 2);
        assert_eq!(state.ready.len(), 1);
        for id in &admitted {
            assert_eq!(state.jobs[id].job.status, JobStatus::Downloading);
        }

        // Cap already reached; a second call admits nothing more.
        let admitted_again = admit_locked(&mut state, 2);
        assert!(admitted_again.is_empty());
    }
}
