//! Throughput counters shared by the delivery callback and the run loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Received/sent tallies plus the sticky egress-discard flag.
///
/// Updates use relaxed ordering; a message counted at a tick boundary may land
/// in either report.
#[derive(Debug, Default)]
pub struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    discard_detected: AtomicBool,
}

/// Counts taken by one reporting tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub received: u64,
    pub sent: u64,
    pub discard_detected: bool,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discard_detected.store(true, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Read and zero every counter, clearing the discard flag.
    ///
    /// `sent` is swapped before `received`: a send is always counted after its
    /// receive, so the sample never reports more sent than received.
    pub fn take(&self) -> Sample {
        let sent = self.sent.swap(0, Ordering::AcqRel);
        let received = self.received.swap(0, Ordering::AcqRel);
        let discard_detected = self.discard_detected.swap(false, Ordering::AcqRel);
        Sample {
            received,
            sent,
            discard_detected,
        }
    }
}
