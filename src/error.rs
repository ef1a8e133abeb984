//! Library-wide error taxonomy (spec §7). Internal seams return `CoreError`
//! so a future HTTP adapter can branch on the kind without re-deriving it
//! from error message text; the CLI binary still collapses everything into
//! `anyhow` at its own edge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid URL: {0}")]
    Validation(String),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("permanent server error: {0}")]
    PermanentServer(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("local I/O error: {0}")]
    LocalIo(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Download incomplete: {received}/{total} bytes received. Resume data saved.")]
    Incomplete { received: u64, total: u64 },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("illegal state transition: {0}")]
    IllegalTransition(String),

    #[error("sidecar error: {0}")]
    Sidecar(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        if err.kind() == ErrorKind::PermissionDenied {
            return CoreError::PermissionDenied(err.to_string());
        }
        // `io::ErrorKind` has no stable disk-full variant; sniff the raw OS
        // error code instead (ENOSPC on Unix).
        if err.raw_os_error() == Some(libc_enospc()) {
            return CoreError::DiskFull(err.to_string());
        }
        CoreError::LocalIo(err.to_string())
    }
}

#[cfg(unix)]
fn libc_enospc() -> i32 {
    28 // ENOSPC on Linux/BSD/macOS
}

#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    -1
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return CoreError::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
                return CoreError::Transient(format!("{status}: {err}"));
            }
            return CoreError::PermanentServer(format!("{status}: {err}"));
        }
        CoreError::Transient(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
