//! Cooperative pause/cancel signaling shared between the Engine's run loop
//! and its worker tasks (spec §4.3/§5): two independent flags, polled by
//! workers before each chunk read/write and before each retry sleep.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Pausing,
    Cancelling,
}

pub struct EngineControl {
    cancel: AtomicBool,
    pause: AtomicBool,
    supports_ranges: AtomicBool,
    tx: watch::Sender<ControlState>,
}

impl EngineControl {
    pub fn new() -> (std::sync::Arc<Self>, watch::Receiver<ControlState>) {
        let (tx, rx) = watch::channel(ControlState::Running);
        (
            std::sync::Arc::new(Self {
                cancel: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                supports_ranges: AtomicBool::new(false),
                tx,
            }),
            rx,
        )
    }

    pub fn set_supports_ranges(&self, value: bool) {
        self.supports_ranges.store(value, Ordering::SeqCst);
    }

    pub fn supports_ranges(&self) -> bool {
        self.supports_ranges.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.tx.send(ControlState::Cancelling);
    }

    /// Spec §4.3: pause is allowed only when the server supports ranges.
    pub fn request_pause(&self) -> Result<(), CoreError> {
        if !self.supports_ranges() {
            return Err(CoreError::IllegalTransition(
                "pause is not supported: server does not accept range requests".into(),
            ));
        }
        self.pause.store(true, Ordering::SeqCst);
        let _ = self.tx.send(ControlState::Pausing);
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_pausing(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}
