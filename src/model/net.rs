//! The trainee network: a small two-stage convolutional net that maps an RGB
//! patch to a feature map at 1/4 spatial resolution, optimized with Adam to
//! match the teacher oracle's output.

use ndarray::{Array1, Array4};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::conv::{conv2d, conv2d_backward, conv_out_len, relu, relu_backward};
use crate::model::TraineeModel;
use crate::utils::{Error, Result};
use crate::DOWNSAMPLE_FACTOR;

/// Architecture parameters for [`FastPerceptualNet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Edge length of the square input patches (must be divisible by 4).
    pub patch_size: usize,
    /// Channel count of the intermediate stage.
    pub hidden_channels: usize,
    /// Channel count of the output feature map; must match the teacher.
    pub feature_channels: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            patch_size: crate::DEFAULT_PATCH_SIZE,
            hidden_channels: 32,
            feature_channels: crate::FEATURE_CHANNELS,
        }
    }
}

/// Adam hyperparameters, matching the original optimizer setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub amsgrad: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            amsgrad: true,
        }
    }
}

/// First and second moment buffers for one parameter tensor.
#[derive(Debug, Clone)]
struct AdamBuffer {
    m: Vec<f64>,
    v: Vec<f64>,
    v_max: Vec<f64>,
}

impl AdamBuffer {
    fn zeros(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
            v_max: vec![0.0; len],
        }
    }
}

/// Optimizer state, allocated on first use and never checkpointed.
#[derive(Debug, Clone)]
struct AdamState {
    step: u64,
    conv1_weight: AdamBuffer,
    conv1_bias: AdamBuffer,
    conv2_weight: AdamBuffer,
    conv2_bias: AdamBuffer,
}

/// Serialized form of the full model (architecture + weights).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetSnapshot {
    config: NetConfig,
    conv1_weight: Array4<f32>,
    conv1_bias: Array1<f32>,
    conv2_weight: Array4<f32>,
    conv2_bias: Array1<f32>,
}

/// Weights without architecture, the degraded save fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WeightsSnapshot {
    conv1_weight: Array4<f32>,
    conv1_bias: Array1<f32>,
    conv2_weight: Array4<f32>,
    conv2_bias: Array1<f32>,
}

const KERNEL: usize = 3;
const STRIDE: usize = 2;
const PADDING: usize = 1;

/// Small convolutional network approximating the teacher's tapped features.
///
/// Two stride-2 convolutions take `[N, 3, S, S]` to
/// `[N, feature_channels, S/4, S/4]`, matching the teacher's downsampling.
pub struct FastPerceptualNet {
    config: NetConfig,
    adam_config: AdamConfig,
    learning_rate: f64,
    conv1_weight: Array4<f32>,
    conv1_bias: Array1<f32>,
    conv2_weight: Array4<f32>,
    conv2_bias: Array1<f32>,
    adam: Option<AdamState>,
}

impl FastPerceptualNet {
    /// Create a new network with He-initialized weights.
    pub fn new(config: NetConfig, initial_lr: f64, seed: u64) -> Result<Self> {
        if config.patch_size % DOWNSAMPLE_FACTOR != 0 || config.patch_size == 0 {
            return Err(Error::Config(format!(
                "patch size must be a positive multiple of 4, got {}",
                config.patch_size
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let conv1_weight = he_init(
            (config.hidden_channels, 3, KERNEL, KERNEL),
            3 * KERNEL * KERNEL,
            &mut rng,
        );
        let conv2_weight = he_init(
            (config.feature_channels, config.hidden_channels, KERNEL, KERNEL),
            config.hidden_channels * KERNEL * KERNEL,
            &mut rng,
        );

        Ok(Self {
            conv1_bias: Array1::zeros(config.hidden_channels),
            conv2_bias: Array1::zeros(config.feature_channels),
            conv1_weight,
            conv2_weight,
            config,
            adam_config: AdamConfig::default(),
            learning_rate: initial_lr,
            adam: None,
        })
    }

    /// Forward pass only, for callers using the net as a perceptual-loss
    /// stand-in after training.
    pub fn forward(&self, inputs: &Array4<f32>) -> Array4<f32> {
        let z1 = conv2d(&inputs.view(), &self.conv1_weight, &self.conv1_bias, STRIDE, PADDING);
        let a1 = relu(&z1);
        conv2d(&a1.view(), &self.conv2_weight, &self.conv2_bias, STRIDE, PADDING)
    }

    /// Architecture parameters.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    fn validate_batch(&self, inputs: &Array4<f32>, targets: &Array4<f32>) -> Result<()> {
        let (n, c, h, w) = inputs.dim();
        let (tn, tc, th, tw) = targets.dim();

        if c != 3 {
            return Err(Error::Model(format!("expected 3 input channels, got {}", c)));
        }
        if n != tn {
            return Err(Error::Model(format!(
                "input batch {} does not match target batch {}",
                n, tn
            )));
        }
        if tc != self.config.feature_channels {
            return Err(Error::Model(format!(
                "expected {} target channels, got {}",
                self.config.feature_channels, tc
            )));
        }
        // The input:target spatial ratio is always exactly 4:1.
        let expected_h = conv_out_len(conv_out_len(h, KERNEL, STRIDE, PADDING), KERNEL, STRIDE, PADDING);
        let expected_w = conv_out_len(conv_out_len(w, KERNEL, STRIDE, PADDING), KERNEL, STRIDE, PADDING);
        if th != expected_h
            || tw != expected_w
            || h % DOWNSAMPLE_FACTOR != 0
            || w % DOWNSAMPLE_FACTOR != 0
        {
            return Err(Error::Model(format!(
                "target {}x{} does not match 1/4 of input {}x{}",
                th, tw, h, w
            )));
        }
        Ok(())
    }

    fn adam_step(
        &mut self,
        grad_w1: &Array4<f32>,
        grad_b1: &Array1<f32>,
        grad_w2: &Array4<f32>,
        grad_b2: &Array1<f32>,
    ) {
        let lr = self.learning_rate;
        let cfg = self.adam_config.clone();
        let state = self.adam.as_mut().expect("optimizer state allocated");

        state.step += 1;
        let t = state.step as i32;
        let bias_correction = (1.0 - cfg.beta2.powi(t)).sqrt() / (1.0 - cfg.beta1.powi(t));
        let step_size = lr * bias_correction;

        apply_adam(
            self.conv1_weight.as_slice_mut().expect("contiguous"),
            grad_w1.as_slice().expect("contiguous"),
            &mut state.conv1_weight,
            &cfg,
            step_size,
        );
        apply_adam(
            self.conv1_bias.as_slice_mut().expect("contiguous"),
            grad_b1.as_slice().expect("contiguous"),
            &mut state.conv1_bias,
            &cfg,
            step_size,
        );
        apply_adam(
            self.conv2_weight.as_slice_mut().expect("contiguous"),
            grad_w2.as_slice().expect("contiguous"),
            &mut state.conv2_weight,
            &cfg,
            step_size,
        );
        apply_adam(
            self.conv2_bias.as_slice_mut().expect("contiguous"),
            grad_b2.as_slice().expect("contiguous"),
            &mut state.conv2_bias,
            &cfg,
            step_size,
        );
    }
}

fn he_init(shape: (usize, usize, usize, usize), fan_in: usize, rng: &mut ChaCha8Rng) -> Array4<f32> {
    let std_dev = (2.0 / fan_in as f64).sqrt();
    let normal = Normal::new(0.0, std_dev).expect("valid normal distribution");
    Array4::from_shape_fn(shape, |_| normal.sample(rng) as f32)
}

fn apply_adam(
    params: &mut [f32],
    grads: &[f32],
    buffer: &mut AdamBuffer,
    cfg: &AdamConfig,
    step_size: f64,
) {
    for i in 0..params.len() {
        let g = grads[i] as f64;
        buffer.m[i] = cfg.beta1 * buffer.m[i] + (1.0 - cfg.beta1) * g;
        buffer.v[i] = cfg.beta2 * buffer.v[i] + (1.0 - cfg.beta2) * g * g;
        let v = if cfg.amsgrad {
            buffer.v_max[i] = buffer.v_max[i].max(buffer.v[i]);
            buffer.v_max[i]
        } else {
            buffer.v[i]
        };
        params[i] -= (step_size * buffer.m[i] / (v.sqrt() + cfg.epsilon)) as f32;
    }
}

impl TraineeModel for FastPerceptualNet {
    fn patch_size(&self) -> usize {
        self.config.patch_size
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn optimizer_ready(&self) -> bool {
        self.adam.is_some()
    }

    fn ensure_optimizer(&mut self) -> Result<()> {
        if self.adam.is_some() {
            return Ok(());
        }

        self.adam = Some(AdamState {
            step: 0,
            conv1_weight: AdamBuffer::zeros(self.conv1_weight.len()),
            conv1_bias: AdamBuffer::zeros(self.conv1_bias.len()),
            conv2_weight: AdamBuffer::zeros(self.conv2_weight.len()),
            conv2_bias: AdamBuffer::zeros(self.conv2_bias.len()),
        });

        // Zero-gradient step on dummy data: validates the forward shapes
        // without disturbing the weights.
        let s = self.config.patch_size;
        let dummy = Array4::<f32>::zeros((1, 3, s, s));
        let out = self.forward(&dummy);
        let (_, c, oh, ow) = out.dim();
        debug!(
            "Optimizer initialized; dummy forward produced [{}x{}x{}] features",
            c, oh, ow
        );
        let expected = s / DOWNSAMPLE_FACTOR;
        if c != self.config.feature_channels || oh != expected || ow != expected {
            return Err(Error::Model(format!(
                "dummy forward produced [{}x{}x{}], expected [{}x{}x{}]",
                c, oh, ow, self.config.feature_channels, expected, expected
            )));
        }
        Ok(())
    }

    fn train_on_batch(&mut self, inputs: &Array4<f32>, targets: &Array4<f32>) -> Result<f64> {
        self.validate_batch(inputs, targets)?;
        if self.adam.is_none() {
            self.ensure_optimizer()?;
        }

        // Forward.
        let z1 = conv2d(&inputs.view(), &self.conv1_weight, &self.conv1_bias, STRIDE, PADDING);
        let a1 = relu(&z1);
        let z2 = conv2d(&a1.view(), &self.conv2_weight, &self.conv2_bias, STRIDE, PADDING);

        // MSE loss against the teacher features.
        let diff = &z2 - targets;
        let count = diff.len() as f64;
        let loss = diff.iter().map(|d| (*d as f64) * (*d as f64)).sum::<f64>() / count;

        // Backward.
        let grad_z2 = diff.mapv(|d| 2.0 * d / count as f32);
        let (grad_a1, grad_w2, grad_b2) =
            conv2d_backward(&a1.view(), &self.conv2_weight, &grad_z2.view(), STRIDE, PADDING);
        let grad_z1 = relu_backward(&z1, &grad_a1);
        let (_, grad_w1, grad_b1) =
            conv2d_backward(&inputs.view(), &self.conv1_weight, &grad_z1.view(), STRIDE, PADDING);

        self.adam_step(&grad_w1, &grad_b1, &grad_w2, &grad_b2);

        if !loss.is_finite() {
            return Err(Error::Training(format!("non-finite loss: {}", loss)));
        }
        Ok(loss)
    }

    fn parameter_count(&self) -> usize {
        self.conv1_weight.len()
            + self.conv1_bias.len()
            + self.conv2_weight.len()
            + self.conv2_bias.len()
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        let snapshot = NetSnapshot {
            config: self.config.clone(),
            conv1_weight: self.conv1_weight.clone(),
            conv1_bias: self.conv1_bias.clone(),
            conv2_weight: self.conv2_weight.clone(),
            conv2_bias: self.conv2_bias.clone(),
        };
        Ok(serde_json::to_value(&snapshot)?)
    }

    fn restore(&mut self, snapshot: &serde_json::Value) -> Result<()> {
        let snapshot: NetSnapshot = serde_json::from_value(snapshot.clone())
            .map_err(|e| Error::Checkpoint(format!("unreadable snapshot: {}", e)))?;

        if snapshot.config != self.config {
            return Err(Error::Checkpoint(format!(
                "snapshot architecture {:?} does not match model {:?}",
                snapshot.config, self.config
            )));
        }

        self.conv1_weight = snapshot.conv1_weight;
        self.conv1_bias = snapshot.conv1_bias;
        self.conv2_weight = snapshot.conv2_weight;
        self.conv2_bias = snapshot.conv2_bias;
        // Optimizer state is never checkpointed; the caller re-initializes it
        // with a dummy step after restore.
        self.adam = None;
        Ok(())
    }

    fn weights_snapshot(&self) -> Result<serde_json::Value> {
        let snapshot = WeightsSnapshot {
            conv1_weight: self.conv1_weight.clone(),
            conv1_bias: self.conv1_bias.clone(),
            conv2_weight: self.conv2_weight.clone(),
            conv2_bias: self.conv2_bias.clone(),
        };
        Ok(serde_json::to_value(&snapshot)?)
    }
}
