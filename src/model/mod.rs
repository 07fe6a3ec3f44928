//! Model boundary for perceptual distillation.
//!
//! The interesting machinery of this crate (augmentation, adaptive learning
//! rate control, the training loop) treats both networks through narrow trait
//! seams: the frozen reference network is an opaque feature oracle, and the
//! trainee is anything that can run an optimizer step against feature targets.
//!
//! - `conv`: direct conv2d forward/backward primitives
//! - `net`: the small trainee network with an Adam optimizer
//! - `teacher`: a frozen projection network satisfying the oracle contract

pub mod conv;
pub mod net;
pub mod teacher;

use ndarray::Array4;

use crate::utils::Result;

/// The frozen reference network whose intermediate features are the training
/// target.
///
/// Contract: accepts an RGB batch `[N, 3, H, W]` with values in `[0, 1]` at
/// arbitrary resolution (divisible by the downsampling factor) and returns a
/// feature map `[N, C, H/4, W/4]` with a fixed channel count `C`.
pub trait TeacherNetwork: Send + Sync {
    /// Run the frozen forward pass and return the tapped feature map.
    fn features(&self, images: &Array4<f32>) -> Result<Array4<f32>>;

    /// Channel count of the tapped feature map.
    fn feature_channels(&self) -> usize;
}

/// The small network being optimized to mimic the teacher's features.
///
/// Implementations own their optimizer; the training loop and the learning
/// rate controller only see these operations.
pub trait TraineeModel: Send {
    /// Edge length of the square input patches this model trains on.
    fn patch_size(&self) -> usize;

    /// Current optimizer learning rate.
    fn learning_rate(&self) -> f64;

    /// Overwrite the optimizer learning rate.
    fn set_learning_rate(&mut self, lr: f64);

    /// True once the optimizer state has been allocated.
    fn optimizer_ready(&self) -> bool;

    /// Guarantee the optimizer exists, forcing a zero-gradient step on dummy
    /// data if it has not been initialized yet.
    fn ensure_optimizer(&mut self) -> Result<()>;

    /// One optimizer step on a batch: forward, MSE loss against the feature
    /// targets, backward, parameter update. Returns the batch loss.
    fn train_on_batch(&mut self, inputs: &Array4<f32>, targets: &Array4<f32>) -> Result<f64>;

    /// Number of trainable parameters.
    fn parameter_count(&self) -> usize;

    /// Serialize architecture and weights for a full checkpoint.
    fn snapshot(&self) -> Result<serde_json::Value>;

    /// Restore architecture and weights from [`TraineeModel::snapshot`] output.
    /// Fails when the snapshot is corrupt or was taken from an incompatible
    /// architecture; optimizer state is never restored.
    fn restore(&mut self, snapshot: &serde_json::Value) -> Result<()>;

    /// Serialize weights only, the degraded fallback when a full snapshot
    /// cannot be written.
    fn weights_snapshot(&self) -> Result<serde_json::Value>;
}
