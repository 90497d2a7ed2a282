//! Drop-if-busy admission for a single expensive job.
//!
//! A [`SingleFlight`] hands out at most one [`FlightPermit`] at a time. Callers
//! that fail to acquire a permit are expected to drop their request instead of
//! queueing it; the slot counts those refusals. The permit can travel with the
//! job's result so the slot stays occupied until the result has been consumed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Slot {
    busy: AtomicBool,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    slot: Arc<Slot>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot if it is free. A refusal increments the dropped counter.
    pub fn try_acquire(&self) -> Option<FlightPermit> {
        match self
            .slot
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(FlightPermit {
                slot: self.slot.clone(),
            }),
            Err(_) => {
                self.slot.dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.busy.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_dropped(&self) {
        self.slot.dropped.store(0, Ordering::Relaxed);
    }
}

/// Occupies the slot of a [`SingleFlight`] until dropped.
#[derive(Debug)]
pub struct FlightPermit {
    slot: Arc<Slot>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}
