//! Perceptual Distill
//!
//! Trains a small convolutional network to reproduce the intermediate feature
//! activations of a large frozen reference network, so the small network can
//! later stand in for expensive perceptual-loss computation.
//!
//! The crate is organized around the training control loop rather than the
//! model itself:
//!
//! - [`dataset`]: image discovery plus a live augmentation pipeline producing
//!   (patch, teacher feature) pairs
//! - [`training`]: the adaptive learning rate controller, the resumable
//!   epoch loop and its reporting observers
//! - [`checkpoint`]: collision-free snapshot persistence and resume discovery
//! - [`control`] / [`status`]: the shared-state and message-queue seams
//!   between the training worker and a control thread
//! - [`model`]: trait boundaries for the frozen teacher and the trainee,
//!   with a reference ndarray implementation of both

pub mod checkpoint;
pub mod control;
pub mod dataset;
pub mod model;
pub mod status;
pub mod training;
pub mod utils;

pub use checkpoint::CheckpointStore;
pub use control::SharedControl;
pub use status::{status_channel, StatusReceiver, StatusSender};
pub use training::{Trainer, TrainerConfig, TrainingReport};
pub use utils::{Error, Result};

/// Channel count of the reference network's tapped feature map.
pub const FEATURE_CHANNELS: usize = 256;

/// Spatial downsampling between trainee input and feature output.
pub const DOWNSAMPLE_FACTOR: usize = 4;

/// Default edge length of square training patches.
pub const DEFAULT_PATCH_SIZE: usize = 256;

/// Default batch size for a fresh run.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Default total epoch target.
pub const DEFAULT_EPOCHS: usize = 100;

/// Default optimizer steps per epoch.
pub const DEFAULT_STEPS_PER_EPOCH: usize = 25;
