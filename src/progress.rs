//! Terminal progress rendering for the CLI (spec §6): one bar per Job in
//! text mode, one JSON object per `JobSummary` update in JSON mode.
//!
//! Grounded on the teacher crate's `progress::ProgressReporter`: same
//! `indicatif`/`colored` text renderer and `serde`-based JSON event shape,
//! widened from a single download's byte counter into a per-job registry
//! keyed off the `JobSummary` snapshots the Orchestrator broadcasts.

use std::collections::HashMap;

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;

use multifetch::job::{JobId, JobStatus, JobSummary};

use crate::cli::ProgressMode;

pub struct ProgressReporter {
    mode: ProgressMode,
    multi: Option<MultiProgress>,
    bars: HashMap<JobId, ProgressBar>,
}

impl ProgressReporter {
    pub fn new(mode: ProgressMode) -> Self {
        let multi = matches!(mode, ProgressMode::Text).then(MultiProgress::new);
        Self {
            mode,
            multi,
            bars: HashMap::new(),
        }
    }

    pub fn handle(&mut self, summary: &JobSummary) {
        match self.mode {
            ProgressMode::Quiet => {}
            ProgressMode::Text => self.render_text(summary),
            ProgressMode::Json => render_json(summary),
        }
    }

    fn render_text(&mut self, summary: &JobSummary) {
        let Some(multi) = self.multi.as_ref() else {
            return;
        };
        let bar = self.bars.entry(summary.id).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(summary.total_bytes.unwrap_or(0)));
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            bar.set_prefix(summary.filename.clone());
            bar
        });

        if let Some(total) = summary.total_bytes {
            bar.set_length(total);
        }
        bar.set_position(summary.received_bytes);

        if summary.status.is_terminal() {
            match summary.status {
                JobStatus::Completed => bar.finish_with_message("done".green().to_string()),
                JobStatus::Cancelled => bar.finish_with_message("cancelled".yellow().to_string()),
                JobStatus::Failed => bar.finish_with_message(
                    format!("failed: {}", summary.error_message.as_deref().unwrap_or("unknown error")).red().to_string(),
                ),
                _ => unreachable!("is_terminal() implies one of the above"),
            }
        }
    }
}

fn render_json(summary: &JobSummary) {
    let event = JobEvent::from(summary);
    if let Ok(line) = serde_json::to_string(&event) {
        println!("{line}");
    }
}

#[derive(Serialize)]
struct JobEvent<'a> {
    event: &'static str,
    id: JobId,
    filename: &'a str,
    status: JobStatus,
    received_bytes: u64,
    total_bytes: Option<u64>,
    speed_bps: f64,
    error_message: Option<&'a str>,
}

impl<'a> From<&'a JobSummary> for JobEvent<'a> {
    fn from(summary: &'a JobSummary) -> Self {
        let event = match summary.status {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            _ => "progress",
        };
        JobEvent {
            event,
            id: summary.id,
            filename: &summary.filename,
            status: summary.status,
            received_bytes: summary.received_bytes,
            total_bytes: summary.total_bytes,
            speed_bps: summary.speed_bps,
            error_message: summary.error_message.as_deref(),
        }
    }
}
