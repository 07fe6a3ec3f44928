//! Dataset loading and live augmentation.
//!
//! - `loader`: flat-folder image discovery and decoding
//! - `augmentation`: patch extraction, mixup, geometric and color transforms
//! - `pipeline`: the endless restartable (patch, feature) sample stream

pub mod augmentation;
pub mod loader;
pub mod pipeline;

pub use augmentation::Augmentor;
pub use loader::ImageFolder;
pub use pipeline::{SampleOutcome, SampleStream, TrainingSample};
