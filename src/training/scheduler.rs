//! Adaptive Learning Rate Controller
//!
//! A stateful policy that observes the per-epoch training loss and adjusts
//! the learning rate through warmup, trend detection and tiered
//! reduction/recovery rules. All adjustments happen at epoch boundaries; a
//! cooldown counter suppresses further changes for a few epochs after any
//! adjustment so the optimizer can settle.

use tracing::info;

use crate::model::TraineeModel;
use crate::status::StatusSender;
use crate::utils::Result;

/// Called with the new learning rate after every write the controller makes.
pub type LrHook = Box<dyn Fn(f64) + Send>;

/// Tuning knobs for [`AdaptiveLrController`].
#[derive(Debug, Clone)]
pub struct LrControllerConfig {
    pub initial_lr: f64,
    pub min_lr: f64,
    /// Epochs without improvement before the flat reduction kicks in.
    pub patience: usize,
    pub reduction_factor: f64,
    /// Base factor for the spike reduction, scaled by the loss ratio.
    pub aggressive_reduction: f64,
    /// Multiplier applied when raising the rate after a strong improvement.
    pub recovery_factor: f64,
    pub warmup_epochs: usize,
    /// Epochs to suppress adjustments after a change.
    pub cooldown: usize,
    /// Normalized slope above which the trend rule fires.
    pub early_reaction_threshold: f64,
    /// Weight of the previous moving average when folding in a new loss.
    pub loss_memory_factor: f64,
    /// Number of recent epochs used for the trend fit.
    pub trend_detection_window: usize,
}

impl Default for LrControllerConfig {
    fn default() -> Self {
        Self {
            initial_lr: 0.001,
            min_lr: 1e-7,
            patience: 2,
            reduction_factor: 0.4,
            aggressive_reduction: 0.3,
            recovery_factor: 1.05,
            warmup_epochs: 2,
            cooldown: 1,
            early_reaction_threshold: 0.03,
            loss_memory_factor: 0.7,
            trend_detection_window: 3,
        }
    }
}

/// What the controller decided at an epoch boundary. Returned so callers and
/// tests can observe the policy as data instead of parsing log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrAction {
    /// Still in the warmup phase; no loss-based adjustment happens.
    Warmup,
    /// In cooldown; the counter was decremented and nothing else ran.
    CooldownSkip,
    /// Loss improved but not enough to warrant a raise.
    Improved,
    /// Loss improved strongly and the rate was raised.
    Raised,
    /// Upward loss trend detected; preemptive reduction.
    TrendReduction,
    /// Loss spiked versus the previous epoch; aggressive reduction.
    SpikeReduction,
    /// Loss rose mildly; interpolated reduction.
    MildReduction,
    /// Patience exhausted; flat reduction.
    PatienceReduction,
    /// Loss did not improve but no rule fired.
    NoChange,
}

/// Adaptive learning rate policy driven by per-epoch loss.
///
/// State is reset only when the controller is constructed. On
/// resume-from-checkpoint the caller builds a fresh controller, so the loss
/// history and best-loss restart empty even though the weights do not.
pub struct AdaptiveLrController {
    config: LrControllerConfig,
    current_lr: f64,
    best_loss: f64,
    wait: usize,
    cooldown_counter: usize,
    loss_history: Vec<f64>,
    lr_history: Vec<f64>,
    loss_moving_avg: Option<f64>,
    status: Option<StatusSender>,
    on_lr_change: Option<LrHook>,
}

impl AdaptiveLrController {
    pub fn new(config: LrControllerConfig) -> Self {
        let current_lr = config.initial_lr;
        Self {
            config,
            current_lr,
            best_loss: f64::INFINITY,
            wait: 0,
            cooldown_counter: 0,
            loss_history: Vec::new(),
            lr_history: Vec::new(),
            loss_moving_avg: None,
            status: None,
            on_lr_change: None,
        }
    }

    /// Publish human-readable decisions to a status queue.
    pub fn with_status(mut self, status: StatusSender) -> Self {
        self.status = Some(status);
        self
    }

    /// Register a hook fired with the new rate after every write.
    pub fn with_lr_hook(mut self, hook: LrHook) -> Self {
        self.on_lr_change = Some(hook);
        self
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    /// Exponential moving average of the observed losses, if any.
    pub fn smoothed_loss(&self) -> Option<f64> {
        self.loss_moving_avg
    }

    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    pub fn lr_history(&self) -> &[f64] {
        &self.lr_history
    }

    /// Prepare the model for training: make sure the optimizer is live and
    /// push the initial rate into it.
    pub fn on_train_begin(&mut self, model: &mut dyn TraineeModel) -> Result<()> {
        if !model.optimizer_ready() {
            self.say("Optimizer not initialized yet, running a warm-up step".to_string());
            model.ensure_optimizer()?;
        }
        self.write_lr(model, self.config.initial_lr);
        info!("Adaptive LR controller ready, initial LR {:.6}", self.current_lr);
        Ok(())
    }

    /// Apply the warmup curve (if still warming up) and record the rate the
    /// epoch will run with.
    pub fn on_epoch_begin(&mut self, epoch: usize, model: &mut dyn TraineeModel) {
        if epoch < self.config.warmup_epochs {
            let progress = (epoch + 1) as f64 / self.config.warmup_epochs as f64;
            // Smoothstep gives a gentler start than linear warmup.
            let warmup_factor = progress * progress * (3.0 - 2.0 * progress);
            let lr = self.config.initial_lr * warmup_factor;
            self.write_lr(model, lr);
            self.say(format!("Epoch {}: warmup phase, LR set to {:.6}", epoch + 1, lr));
        }
        self.lr_history.push(self.current_lr);
    }

    /// Observe the epoch's loss and apply at most one adjustment rule.
    pub fn on_epoch_end(&mut self, epoch: usize, loss: f64, model: &mut dyn TraineeModel) -> LrAction {
        self.loss_history.push(loss);
        self.loss_moving_avg = Some(match self.loss_moving_avg {
            None => loss,
            Some(avg) => {
                self.config.loss_memory_factor * avg
                    + (1.0 - self.config.loss_memory_factor) * loss
            }
        });

        if epoch < self.config.warmup_epochs {
            return LrAction::Warmup;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            return LrAction::CooldownSkip;
        }

        if loss < self.best_loss {
            let improvement = (self.best_loss - loss) / self.best_loss;
            self.best_loss = loss;
            self.wait = 0;

            // A strong improvement late in training suggests the rate can
            // afford to creep back up toward its initial value.
            if epoch > self.config.warmup_epochs + 5 && improvement > 0.1 {
                let new_lr = (self.current_lr * self.config.recovery_factor)
                    .min(self.config.initial_lr);
                if new_lr > self.current_lr {
                    self.say(format!(
                        "Significant improvement ({:.1}%), raising LR to {:.6}",
                        improvement * 100.0,
                        new_lr
                    ));
                    self.write_lr(model, new_lr);
                    return LrAction::Raised;
                }
            }
            return LrAction::Improved;
        }

        self.wait += 1;

        if let Some(action) = self.try_trend_rule(model) {
            return action;
        }

        if self.loss_history.len() >= 2 {
            let previous = self.loss_history[self.loss_history.len() - 2];
            let loss_ratio = loss / previous;

            if loss_ratio > 1.08 {
                let strength = (self.config.aggressive_reduction * loss_ratio).min(0.9);
                let new_lr = (self.current_lr * (1.0 - strength)).max(self.config.min_lr);
                self.say(format!(
                    "Loss spiked ({:.2}x), aggressively reducing LR to {:.6}",
                    loss_ratio, new_lr
                ));
                self.write_lr(model, new_lr);
                self.cooldown_counter = self.config.cooldown;
                self.wait = 0;
                return LrAction::SpikeReduction;
            }

            if loss_ratio > 1.03 {
                // Interpolate between reduction_factor and reduction_factor+0.1
                // across the 3%..8% band.
                let factor =
                    self.config.reduction_factor + ((loss_ratio - 1.03) / 0.05) * 0.1;
                let new_lr = (self.current_lr * factor).max(self.config.min_lr);
                self.say(format!(
                    "Small loss increase ({:.2}x), reducing LR to {:.6}",
                    loss_ratio, new_lr
                ));
                self.write_lr(model, new_lr);
                self.cooldown_counter = self.config.cooldown.saturating_sub(1).max(1);
                self.wait = 0;
                return LrAction::MildReduction;
            }
        }

        if self.wait >= self.config.patience {
            let new_lr = (self.current_lr * self.config.reduction_factor).max(self.config.min_lr);
            self.say(format!("Patience reached, reducing LR to {:.6}", new_lr));
            self.write_lr(model, new_lr);
            self.cooldown_counter = self.config.cooldown;
            self.wait = 0;
            return LrAction::PatienceReduction;
        }

        LrAction::NoChange
    }

    /// Fit a least-squares slope over the most recent window of losses and
    /// cut the rate preemptively if the normalized slope is clearly upward.
    fn try_trend_rule(&mut self, model: &mut dyn TraineeModel) -> Option<LrAction> {
        let window = self.config.trend_detection_window;
        if window < 3 || self.loss_history.len() < window {
            return None;
        }

        let recent = &self.loss_history[self.loss_history.len() - window..];
        let mean_x = (window - 1) as f64 / 2.0;
        let mean_y = recent.iter().sum::<f64>() / window as f64;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, &y) in recent.iter().enumerate() {
            let dx = i as f64 - mean_x;
            numerator += dx * (y - mean_y);
            denominator += dx * dx;
        }
        if denominator == 0.0 {
            return None;
        }

        let slope = numerator / denominator;
        if slope <= 0.0 {
            return None;
        }

        let trend_strength = slope / mean_y;
        if trend_strength <= self.config.early_reaction_threshold {
            return None;
        }

        let factor = (1.0 - trend_strength * 2.0).max(self.config.reduction_factor);
        let new_lr = (self.current_lr * factor).max(self.config.min_lr);
        self.say(format!(
            "Upward loss trend (strength {:.4}), preemptively reducing LR to {:.6}",
            trend_strength, new_lr
        ));
        self.write_lr(model, new_lr);
        self.cooldown_counter = self.config.cooldown.saturating_sub(1).max(1);
        self.wait = 0;
        Some(LrAction::TrendReduction)
    }

    fn write_lr(&mut self, model: &mut dyn TraineeModel, lr: f64) {
        let lr = lr.clamp(self.config.min_lr, self.config.initial_lr);
        self.current_lr = lr;
        model.set_learning_rate(lr);
        if let Some(hook) = &self.on_lr_change {
            hook(lr);
        }
    }

    fn say(&self, line: String) {
        info!("{}", line);
        if let Some(status) = &self.status {
            status.push(line);
        }
    }
}
