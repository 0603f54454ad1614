//! Single in-flight slot for drop-on-busy backpressure

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// Busy flag guarding one execution context. There is no queue behind it:
/// work offered while the slot is taken is dropped by the caller.
#[derive(Debug, Default)]
pub struct InFlightSlot {
    busy: CachePadded<AtomicBool>,
}

impl InFlightSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot. Returns `None` while another permit is alive.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotPermit {
                slot: Arc::clone(self),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Clears the slot when dropped.
#[derive(Debug)]
pub struct SlotPermit {
    slot: Arc<InFlightSlot>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Statistics
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub delivered: AtomicU64,
    pub completed: AtomicU64,
    pub dropped_busy: AtomicU64,
    pub dropped_no_processor: AtomicU64,
    pub failed: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
            dropped_no_processor: self.dropped_no_processor.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Counters of a dispatcher or offload queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames (or tasks) offered
    pub submitted: u64,
    /// Handed to the execution context
    pub delivered: u64,
    /// Invocations that ran to completion, failed or not
    pub completed: u64,
    pub dropped_busy: u64,
    pub dropped_no_processor: u64,
    /// Invocations that returned an error or panicked
    pub failed: u64,
}

impl PipelineStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_busy + self.dropped_no_processor
    }
}
