//! Concurrent, resumable, segmented HTTP download engine: the `multifetch`
//! library exposes a `Config`-driven `Orchestrator` that runs a bounded
//! number of `engine::TransferEngine`s concurrently, each downloading one
//! `Job` over one or more byte-range connections with adaptive scale-up and
//! straggler removal.
//!
//! The CLI binary (`src/main.rs`) is a thin consumer of this crate; the
//! control surface documented for it lives on [`orchestrator::Orchestrator`].

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod http_probe;
pub mod job;
pub mod orchestrator;
pub mod planner;
pub mod sidecar;
pub mod speed;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use job::{Job, JobId, JobParams, JobStatus, JobSummary, Segment};
pub use orchestrator::{Orchestrator, SubscriberId};
