//! Terminal shutdown flag.

use tokio::sync::watch;
use tracing::info;

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator typed something on standard input.
    OperatorInput,
    /// External stop (Ctrl+C).
    Interrupted,
    /// The broker connection is gone for good.
    TransportLost,
    /// The run loop finished on its own.
    Exiting,
}

/// One-way `false -> true` flag shared by every activity.
///
/// Cloning is cheap; every clone observes the same flag. Setting it more than
/// once has the same effect as setting it once.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<Option<StopReason>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Set the flag. Returns `true` only for the call that actually set it.
    pub fn trigger(&self, reason: StopReason) -> bool {
        let first = self.tx.send_if_modified(|state| {
            if state.is_some() {
                false
            } else {
                *state = Some(reason);
                true
            }
        });
        if first {
            info!(reason = ?reason, "Shutdown requested");
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The reason recorded by the first `trigger`.
    pub fn reason(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }

    /// Resolve once the flag is set (immediately if it already is).
    pub async fn triggered(&self) -> StopReason {
        let mut rx = self.tx.subscribe();
        let state = rx.wait_for(|state| state.is_some()).await.map(|state| *state);
        match state {
            Ok(reason) => reason.unwrap_or(StopReason::Exiting),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => StopReason::Exiting,
        }
    }
}
