//! Per-segment worker protocol (spec §4.3): issues a byte-range GET for one
//! segment, writes the response body into the part file at its absolute
//! offset, and retries transient failures with exponential backoff honoring
//! `Retry-After`, yielding back to the Engine on pause/cancel/retirement.
//!
//! Grounded on the teacher crate's `download::manager::{download_segment_with_retry,
//! download_segment_once, write_all_at}`; the retry loop, status-code
//! acceptance (206, or 200 only when reading from the start), and positional
//! write all follow that shape. Pause/cancel checks, the single-worker
//! 200-OK downgrade, and mid-stream shrink handling (the Adaptive Controller
//! splitting this worker's own segment out from under it) are new.

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode, Url};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::warn;

use crate::engine::control::EngineControl;
use crate::engine::table::{SegmentId, SegmentTable};
use crate::error::CoreError;
use crate::http_probe::parse_retry_after;

const MAX_RETRIES: u32 = 6;
const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(3_200);
const WRITE_CHUNK: usize = 1 << 20;

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], position: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, position)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut position: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, position)?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write segment data",
            ));
        }
        buf = &buf[written..];
        position += written as u64;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    /// Retired by the Adaptive Controller or shrunk out from under this
    /// worker; not an error.
    Retired,
    Cancelled,
}

struct SegmentError {
    core: CoreError,
    retry_after: Option<Duration>,
}

impl From<CoreError> for SegmentError {
    fn from(core: CoreError) -> Self {
        Self {
            core,
            retry_after: None,
        }
    }
}

impl From<reqwest::Error> for SegmentError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::from(err).into()
    }
}

fn is_retryable(err: &CoreError) -> bool {
    matches!(err, CoreError::Transient(_))
}

fn exponential_backoff(attempt: u32) -> Duration {
    let scaled = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(5));
    scaled.min(MAX_BACKOFF)
}

pub struct WorkerHandle {
    pub client: Client,
    pub url: Url,
    pub file: Arc<File>,
    pub table: Arc<Mutex<SegmentTable>>,
    pub control: Arc<EngineControl>,
}

/// Drives one segment to completion (or a non-error stop condition). The
/// caller spawns this per active segment id and re-spawns it for any new id
/// the Adaptive Controller creates via a split.
///
/// Completing the segment's active range doesn't necessarily mean the
/// worker is done: a straggler reassignment (spec §4.4) may have queued a
/// follow-up range onto this same id's `pending` list. The loop claims and
/// fetches those in turn before reporting `Completed`, which is how a
/// straggler's leftover bytes get fetched without ever touching this
/// worker's own in-flight request.
pub async fn run_segment(
    handle: &WorkerHandle,
    segment_id: SegmentId,
) -> Result<WorkerOutcome, CoreError> {
    let mut attempt = 0u32;
    loop {
        if handle.control.is_cancelled() {
            return Ok(WorkerOutcome::Cancelled);
        }
        if handle.control.is_pausing() {
            return Ok(WorkerOutcome::Cancelled);
        }

        match attempt_segment(handle, segment_id).await {
            Ok(WorkerOutcome::Completed) => {
                let claimed = handle.table.lock().await.advance_to_pending(segment_id);
                if claimed {
                    attempt = 0;
                    continue;
                }
                return Ok(WorkerOutcome::Completed);
            }
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < MAX_RETRIES && is_retryable(&err.core) => {
                attempt += 1;
                let backoff = err.retry_after.unwrap_or_else(|| exponential_backoff(attempt));
                warn!(
                    segment = segment_id,
                    attempt,
                    error = %err.core,
                    delay_ms = backoff.as_millis(),
                    "segment attempt failed, retrying"
                );
                sleep(backoff).await;
            }
            Err(err) => return Err(err.core),
        }
    }
}

/// Current `(position, end_exclusive)` for a segment, or `None` if it has
/// been retired since the caller last checked.
async fn segment_range(table: &Mutex<SegmentTable>, segment_id: SegmentId) -> Option<(u64, u64)> {
    let table = table.lock().await;
    let tracked = table.get(segment_id)?;
    if tracked.retired {
        return None;
    }
    let position = tracked.segment.offset + tracked.segment.written;
    Some((position, tracked.segment.end_exclusive()))
}

async fn attempt_segment(
    handle: &WorkerHandle,
    segment_id: SegmentId,
) -> Result<WorkerOutcome, SegmentError> {
    let (position, end_exclusive) = match segment_range(&handle.table, segment_id).await {
        Some(range) => range,
        None => return Ok(WorkerOutcome::Retired),
    };
    if position >= end_exclusive {
        return Ok(WorkerOutcome::Completed);
    }

    let range_header = format!("bytes={}-{}", position, end_exclusive - 1);
    let response = handle
        .client
        .get(handle.url.clone())
        .header(header::RANGE, range_header)
        .send()
        .await?;
    let status = response.status();

    let mut write_position = position;

    if status != StatusCode::PARTIAL_CONTENT {
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(header::RETRY_AFTER))
                .map(Duration::from_secs);
            let core = if status.is_server_error()
                || status.as_u16() == 408
                || status.as_u16() == 429
            {
                CoreError::Transient(format!("segment GET returned {status}"))
            } else {
                CoreError::PermanentServer(format!("segment GET returned {status}"))
            };
            return Err(SegmentError { core, retry_after });
        }

        // Spec §4.3 step 2: the server ignored our Range header and sent a
        // full 200 response instead of 206. That response body starts at
        // byte 0 of the resource, not at `position`. If any other worker is
        // still active, the whole segmentation plan is invalid: collapse
        // the table to this one worker owning `[0, total_bytes)` and let
        // the rest retire on their next chunk/range check.
        let needs_collapse = position != 0 || {
            let table = handle.table.lock().await;
            table.active_ids().len() > 1
        };
        if needs_collapse {
            let total_bytes = handle.table.lock().await.total_length();
            handle.table.lock().await.collapse_to_single(segment_id, total_bytes);
            warn!(
                segment = segment_id,
                "server returned 200 instead of 206 for a range request; collapsing to a single worker"
            );
        }
        write_position = 0;
    }

    let mut buffer: Vec<u8> = Vec::with_capacity(WRITE_CHUNK);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if handle.control.is_cancelled() || handle.control.is_pausing() {
            return Ok(WorkerOutcome::Cancelled);
        }

        let chunk = chunk?;
        let mut chunk = chunk.as_ref();

        // The Adaptive Controller may have shrunk this segment (split off
        // its tail for another worker) since the request started. Clip the
        // write to whatever range is still ours and stop reading further.
        let current_end = match segment_range(&handle.table, segment_id).await {
            Some((_, end)) => end,
            None => return Ok(WorkerOutcome::Retired),
        };
        let allowed = current_end.saturating_sub(write_position) as usize;
        if allowed == 0 {
            return Ok(WorkerOutcome::Completed);
        }
        if chunk.len() > allowed {
            chunk = &chunk[..allowed];
        }

        buffer.extend_from_slice(chunk);
        if buffer.len() >= WRITE_CHUNK {
            flush_buffer(handle, segment_id, &mut buffer, &mut write_position).await?;
        }

        if write_position >= current_end {
            flush_buffer(handle, segment_id, &mut buffer, &mut write_position).await?;
            return Ok(WorkerOutcome::Completed);
        }
    }

    flush_buffer(handle, segment_id, &mut buffer, &mut write_position).await?;

    let final_end = match segment_range(&handle.table, segment_id).await {
        Some((_, end)) => end,
        None => return Ok(WorkerOutcome::Retired),
    };
    if write_position < final_end {
        return Err(SegmentError {
            core: CoreError::Incomplete {
                received: write_position,
                total: final_end,
            },
            retry_after: None,
        });
    }
    Ok(WorkerOutcome::Completed)
}

async fn flush_buffer(
    handle: &WorkerHandle,
    segment_id: SegmentId,
    buffer: &mut Vec<u8>,
    write_position: &mut u64,
) -> Result<(), SegmentError> {
    if buffer.is_empty() {
        return Ok(());
    }
    let file = handle.file.clone();
    let bytes = std::mem::take(buffer);
    let position = *write_position;
    let written_len = bytes.len() as u64;
    tokio::task::spawn_blocking(move || write_all_at(&file, &bytes, position))
        .await
        .map_err(|e| SegmentError {
            core: CoreError::LocalIo(format!("write task panicked: {e}")),
            retry_after: None,
        })?
        .map_err(CoreError::from)?;

    *write_position += written_len;

    let mut table = handle.table.lock().await;
    if let Some(tracked) = table.get_mut(segment_id) {
        tracked.segment.written += written_len;
        let speed = tracked.speed.clone();
        drop(table);
        speed.record(written_len).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(exponential_backoff(0), Duration::from_millis(100));
        assert_eq!(exponential_backoff(1), Duration::from_millis(200));
        assert_eq!(exponential_backoff(2), Duration::from_millis(400));
        assert_eq!(exponential_backoff(10), MAX_BACKOFF);
    }

    #[test]
    fn retryable_classifies_transient_only() {
        assert!(is_retryable(&CoreError::Transient("x".into())));
        assert!(!is_retryable(&CoreError::PermanentServer("x".into())));
        assert!(!is_retryable(&CoreError::Cancelled));
    }
}
