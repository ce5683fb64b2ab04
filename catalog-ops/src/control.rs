//! Cooperative control signals for running operations
//!
//! Pause and cancel requests are never delivered mid-item. A worker reads
//! the current signal at page and item boundaries, and again after every
//! connector call returns.

use tokio::sync::watch;

/// What a worker should do at its next boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Sending half, held by the supervisor.
#[derive(Debug)]
pub struct ControlHandle {
    tx: watch::Sender<ControlSignal>,
}

/// Receiving half, held by the worker.
#[derive(Debug, Clone)]
pub struct ControlReceiver {
    rx: watch::Receiver<ControlSignal>,
}

/// A fresh control pair starting at `Run`.
pub fn control_channel() -> (ControlHandle, ControlReceiver) {
    let (tx, rx) = watch::channel(ControlSignal::Run);
    (ControlHandle { tx }, ControlReceiver { rx })
}

impl ControlHandle {
    /// Request a pause. A pending cancel is not downgraded.
    ///
    /// Returns whether a pause is now pending.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Run {
                *signal = ControlSignal::Pause;
                true
            } else {
                false
            }
        });
        self.current() == ControlSignal::Pause
    }

    pub fn cancel(&self) {
        self.tx.send_replace(ControlSignal::Cancel);
    }

    pub fn current(&self) -> ControlSignal {
        *self.tx.borrow()
    }
}

impl ControlReceiver {
    pub fn current(&self) -> ControlSignal {
        *self.rx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.current() == ControlSignal::Cancel
    }
}
