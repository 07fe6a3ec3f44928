//! A frozen stand-in for the reference network.
//!
//! The real system taps an intermediate layer of a large pretrained network.
//! That network is an external collaborator here; this module provides a
//! deterministic frozen oracle with the same output contract (fixed channel
//! count at 1/4 the input resolution) so the trainer is usable end to end.

use ndarray::{Array1, Array4};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::model::conv::{conv2d, relu};
use crate::model::TeacherNetwork;
use crate::utils::{Error, Result};
use crate::DOWNSAMPLE_FACTOR;

/// Frozen random-projection feature extractor.
///
/// A single 4x4 stride-4 convolution followed by ReLU: each output pixel is a
/// fixed projection of one 4x4 input block, giving exactly 1/4 spatial
/// resolution. Weights are seeded and never change.
pub struct ProjectionTeacher {
    weight: Array4<f32>,
    bias: Array1<f32>,
    channels: usize,
}

impl ProjectionTeacher {
    /// Build a frozen teacher with `channels` output channels.
    pub fn new(channels: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let k = DOWNSAMPLE_FACTOR;
        let fan_in = 3 * k * k;
        let normal = Normal::new(0.0, (2.0 / fan_in as f64).sqrt()).expect("valid distribution");
        let weight = Array4::from_shape_fn((channels, 3, k, k), |_| normal.sample(&mut rng) as f32);

        Self {
            weight,
            bias: Array1::zeros(channels),
            channels,
        }
    }

    /// Teacher with the standard channel count.
    pub fn standard(seed: u64) -> Self {
        Self::new(crate::FEATURE_CHANNELS, seed)
    }
}

impl TeacherNetwork for ProjectionTeacher {
    fn features(&self, images: &Array4<f32>) -> Result<Array4<f32>> {
        let (_, c, h, w) = images.dim();
        if c != 3 {
            return Err(Error::Model(format!("teacher expects RGB input, got {} channels", c)));
        }
        if h % DOWNSAMPLE_FACTOR != 0 || w % DOWNSAMPLE_FACTOR != 0 {
            return Err(Error::Model(format!(
                "teacher input {}x{} is not divisible by the downsampling factor",
                h, w
            )));
        }

        let out = conv2d(&images.view(), &self.weight, &self.bias, DOWNSAMPLE_FACTOR, 0);
        Ok(relu(&out))
    }

    fn feature_channels(&self) -> usize {
        self.channels
    }
}
