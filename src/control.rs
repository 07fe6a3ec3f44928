//! Shared Training Controls
//!
//! Explicit shared state between the control surface and the training worker,
//! replacing ad-hoc global scalars. Each field has a single writer: the control
//! side writes the stop flag and the desired run parameters, the worker only
//! reads them. The worker re-polls only at epoch boundaries, which bounds the
//! staleness of any control change to at most one epoch.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Live-adjustable run parameters plus the cooperative stop flag.
///
/// Clone is cheap; all clones share the same underlying state.
#[derive(Clone)]
pub struct SharedControl {
    inner: Arc<ControlState>,
}

struct ControlState {
    stop: AtomicBool,
    batch_size: AtomicUsize,
    target_epochs: AtomicUsize,
    steps_per_epoch: AtomicUsize,
}

impl SharedControl {
    /// Create the shared control block with the run's starting parameters.
    pub fn new(batch_size: usize, target_epochs: usize, steps_per_epoch: usize) -> Self {
        Self {
            inner: Arc::new(ControlState {
                stop: AtomicBool::new(false),
                batch_size: AtomicUsize::new(batch_size),
                target_epochs: AtomicUsize::new(target_epochs),
                steps_per_epoch: AtomicUsize::new(steps_per_epoch),
            }),
        }
    }

    /// Request a cooperative stop. The worker exits at the next epoch boundary;
    /// the in-flight epoch always completes.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    /// True once a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    /// Change the batch size. Takes effect at the next epoch boundary.
    pub fn set_batch_size(&self, batch_size: usize) {
        if batch_size > 0 {
            self.inner.batch_size.store(batch_size, Ordering::Release);
        }
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size.load(Ordering::Acquire)
    }

    /// Change the total epoch target. Only increases are honored by the worker.
    pub fn set_target_epochs(&self, epochs: usize) {
        if epochs > 0 {
            self.inner.target_epochs.store(epochs, Ordering::Release);
        }
    }

    pub fn target_epochs(&self) -> usize {
        self.inner.target_epochs.load(Ordering::Acquire)
    }

    /// Change the number of training steps per epoch, effective next epoch.
    pub fn set_steps_per_epoch(&self, steps: usize) {
        if steps > 0 {
            self.inner.steps_per_epoch.store(steps, Ordering::Release);
        }
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.inner.steps_per_epoch.load(Ordering::Acquire)
    }
}
