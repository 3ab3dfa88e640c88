//! Hand-off of one measurement from the frame thread to the optimizer.
//!
//! The optimizer arms the [`Rendezvous`], which opens the accumulation gate
//! and starts a new measurement generation, and then blocks in
//! [`Rendezvous::wait`]. The pipeline sees the gate, builds a batch on its own
//! thread without holding any lock, and calls [`Rendezvous::deliver`] with the
//! generation the batch started in. Only a batch started after the latest arm
//! completes the wait; delivering disarms the rendezvous.
//!
//! Image processing can keep the gate open while nothing is armed so the
//! display follows the beam between runs. Batches finished that way never
//! reach a waiter.
//!
//! There is no timeout on the wait. During teardown
//! [`Rendezvous::force_release`] hands the waiter a null ellipse and keeps
//! doing so for every later wait until [`Rendezvous::reset`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use shared::image_proc::DetectedEllipse;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    ellipse: Option<DetectedEllipse>,
    released: bool,
}

#[derive(Debug, Default)]
pub struct Rendezvous {
    armed: AtomicBool,
    processing: AtomicBool,
    generation: AtomicU64,
    slot: Mutex<Slot>,
    delivered: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the pipeline should add incoming frames to its batch.
    pub fn is_accumulating(&self) -> bool {
        self.is_armed() || self.is_processing()
    }

    /// Whether an optimizer is waiting for the next measurement.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Whether a measurement armed in `generation` is still pending.
    pub fn is_armed_for(&self, generation: u64) -> bool {
        self.is_armed() && self.generation() == generation
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Keep the gate open between measurements.
    pub fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::SeqCst);
    }

    /// Bumped by every [`Rendezvous::arm`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Drop any stale result and open the gate for a new measurement.
    pub fn arm(&self) {
        let mut slot = self.slot();
        slot.ellipse = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Close the gate for measurements; idle processing is unaffected.
    pub fn disarm(&self) {
        let _slot = self.slot();
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Stash a measurement started in `generation` and wake the waiter.
    ///
    /// Returns false, dropping the ellipse, when nothing is armed or a newer
    /// arm has superseded that generation.
    pub fn deliver(&self, generation: u64, ellipse: DetectedEllipse) -> bool {
        let mut slot = self.slot();
        if !self.is_armed_for(generation) {
            debug!(generation, "Measurement not requested, dropped");
            return false;
        }
        slot.ellipse = Some(ellipse);
        self.armed.store(false, Ordering::SeqCst);
        self.delivered.notify_all();
        debug!(generation, "Measurement delivered");
        true
    }

    /// Block until the next measurement or a forced release.
    pub fn wait(&self) -> DetectedEllipse {
        let mut slot = self.slot();
        while slot.ellipse.is_none() && !slot.released {
            slot = self
                .delivered
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        take_result(&mut slot)
    }

    /// Like [`Rendezvous::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DetectedEllipse> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        while slot.ellipse.is_none() && !slot.released {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .delivered
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(take_result(&mut slot))
    }

    /// Unblock any waiter with a null ellipse and close the gate.
    pub fn force_release(&self) {
        self.set_processing(false);
        let mut slot = self.slot();
        self.armed.store(false, Ordering::SeqCst);
        slot.released = true;
        self.delivered.notify_all();
        debug!("Rendezvous force-released");
    }

    pub fn is_released(&self) -> bool {
        self.slot().released
    }

    /// Clear a forced release so the rendezvous can serve a new run.
    pub fn reset(&self) {
        let mut slot = self.slot();
        slot.released = false;
        slot.ellipse = None;
    }
}

fn take_result(slot: &mut Slot) -> DetectedEllipse {
    if slot.released {
        DetectedEllipse::null()
    } else {
        slot.ellipse.take().unwrap_or_else(DetectedEllipse::null)
    }
}

/// Cooperative stop request shared between a run and whoever may end it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
