//! Data model (spec §3): `Job`, `Segment`, the `JobStatus` state machine
//! (spec §4.5), and `JobSummary`, the serializable external read-model.

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Spec §4.5 state machine. Returns whether `self -> next` is a legal
    /// transition.
    pub fn can_transition(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Cancelled)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Cancelled)
        )
    }
}

/// A contiguous byte range of one Job (spec §3). `written` never decreases
/// and never exceeds `length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub offset: u64,
    pub length: u64,
    pub written: u64,
}

impl Segment {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            written: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.written)
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.length
    }

    pub fn end_exclusive(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone)]
pub struct JobParams {
    pub requested_workers: u32,
    pub adaptive: bool,
}

/// The unit of work (spec §3). Internal mutation (segments, speed samples)
/// lives behind the Engine; the Orchestrator owns the rest and publishes a
/// `JobSummary` snapshot to subscribers.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub source_url: Url,
    pub dest_dir: std::path::PathBuf,
    pub filename: String,
    pub params: JobParams,
    pub status: JobStatus,
    pub total_bytes: Option<u64>,
    pub received_bytes: u64,
    pub speed_bps: f64,
    pub active_workers: u32,
    pub error_message: Option<String>,
    pub created_at: f64,
    pub completed_at: Option<f64>,
}

impl Job {
    pub fn final_path(&self) -> std::path::PathBuf {
        self.dest_dir.join(&self.filename)
    }

    pub fn part_path(&self) -> std::path::PathBuf {
        let mut name = self.filename.clone();
        name.push_str(".part");
        self.dest_dir.join(name)
    }

    pub fn sidecar_path(&self) -> std::path::PathBuf {
        let mut name = self.filename.clone();
        name.push_str(".part.json");
        self.dest_dir.join(name)
    }

    pub fn to_summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            url: self.source_url.to_string(),
            filename: self.filename.clone(),
            dest_path: self.final_path().to_string_lossy().into_owned(),
            status: self.status,
            total_bytes: self.total_bytes,
            received_bytes: self.received_bytes,
            speed_bps: self.speed_bps,
            connections: self.params.requested_workers,
            adaptive: self.params.adaptive,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// External read-model delivered to control-surface callers and subscribers
/// (spec §6). Deliberately independent of `Job` so internal synchronization
/// primitives never cross the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub url: String,
    pub filename: String,
    pub dest_path: String,
    pub status: JobStatus,
    pub total_bytes: Option<u64>,
    pub received_bytes: u64,
    pub speed_bps: f64,
    pub connections: u32,
    pub adaptive: bool,
    pub error_message: Option<String>,
    pub created_at: f64,
    pub completed_at: Option<f64>,
}
