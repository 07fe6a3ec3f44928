//! Training loop, adaptive learning rate control and reporting observers.

pub mod observers;
pub mod orchestrator;
pub mod scheduler;

pub use observers::{ChartTracker, EpochObserver, ModelStatsObserver, ProgressObserver};
pub use orchestrator::{Trainer, TrainerConfig, TrainingReport};
pub use scheduler::{AdaptiveLrController, LrAction, LrControllerConfig};
