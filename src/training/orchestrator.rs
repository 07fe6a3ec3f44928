//! Training Orchestrator
//!
//! The epoch-granular training loop. It resumes from the newest checkpoint,
//! re-polls the shared controls at every epoch boundary, recovers from
//! per-epoch failures by skipping forward, and persists the model on
//! improvement and at exit.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::control::SharedControl;
use crate::dataset::{ImageFolder, SampleStream};
use crate::model::{TeacherNetwork, TraineeModel};
use crate::status::StatusSender;
use crate::training::observers::EpochObserver;
use crate::training::scheduler::{AdaptiveLrController, LrControllerConfig};
use crate::utils::{Error, Result};

/// Static parameters of one training run. The live-adjustable ones (batch
/// size, steps per epoch, epoch target, stop) come from [`SharedControl`].
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Edge length of the square training patches.
    pub patch_size: u32,
    pub seed: u64,
    pub scheduler: LrControllerConfig,
}

impl TrainerConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P, checkpoint_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            checkpoint_dir: checkpoint_dir.into(),
            patch_size: crate::DEFAULT_PATCH_SIZE as u32,
            seed: 42,
            scheduler: LrControllerConfig::default(),
        }
    }
}

/// What a finished (or stopped) run looked like.
#[derive(Debug, Serialize)]
pub struct TrainingReport {
    /// Epoch index the run started at (0 for a fresh run).
    pub start_epoch: usize,
    /// Epochs completed in total, including resumed ones.
    pub epochs_completed: usize,
    pub best_loss: f64,
    pub stopped_by_user: bool,
    /// Path of the final snapshot, if one could be written.
    pub final_model_path: Option<PathBuf>,
}

/// Drives the full distillation run: augmentation stream, optimizer steps,
/// adaptive learning rate, checkpointing and observer fan-out.
pub struct Trainer {
    config: TrainerConfig,
    teacher: Arc<dyn TeacherNetwork>,
    control: SharedControl,
    status: StatusSender,
    observers: Vec<Box<dyn EpochObserver>>,
    stream_rebuilds: u64,
    // Launch-time parameters, snapshotted so later control writes are
    // detected as changes at epoch boundaries.
    launch_batch_size: usize,
    launch_target_epochs: usize,
    launch_steps: usize,
}

impl Trainer {
    pub fn new(
        config: TrainerConfig,
        teacher: Arc<dyn TeacherNetwork>,
        control: SharedControl,
        status: StatusSender,
    ) -> Self {
        let launch_batch_size = control.batch_size();
        let launch_target_epochs = control.target_epochs();
        let launch_steps = control.steps_per_epoch();
        Self {
            config,
            teacher,
            control,
            status,
            observers: Vec::new(),
            stream_rebuilds: 0,
            launch_batch_size,
            launch_target_epochs,
            launch_steps,
        }
    }

    /// Attach a reporting observer. Observers run in registration order.
    pub fn add_observer(&mut self, observer: Box<dyn EpochObserver>) {
        self.observers.push(observer);
    }

    /// Run the training loop until the epoch target is reached or a stop is
    /// requested, then write the final snapshot.
    pub fn run(&mut self, model: &mut dyn TraineeModel) -> Result<TrainingReport> {
        let store = CheckpointStore::new(&self.config.checkpoint_dir)?;
        let folder = ImageFolder::scan(&self.config.data_dir)?;

        let start_epoch = self.resume_if_possible(&store, model);

        let mut scheduler = AdaptiveLrController::new(self.config.scheduler.clone())
            .with_status(self.status.clone());
        // A failed optimizer warm-up is logged, not fatal; the first real
        // batch initializes the optimizer anyway.
        if let Err(e) = scheduler.on_train_begin(model) {
            self.status
                .push(format!("Error initializing optimizer: {}", e));
            warn!("Optimizer warm-up failed: {}", e);
        }

        let mut stream = self.build_stream(&folder);
        let mut current_epoch = start_epoch;
        let mut best_loss = f64::INFINITY;
        let mut target_epochs = self.launch_target_epochs;
        let mut batch_size = self.launch_batch_size;
        let mut steps = self.launch_steps;

        self.status
            .push("Starting training loop with dynamic parameter support...".to_string());
        notify(&mut self.observers, &self.status, |o| {
            o.on_train_begin(target_epochs)
        });

        while current_epoch < target_epochs && !self.control.stop_requested() {
            // Epoch boundary: the only place live controls are re-read.
            let wanted = self.control.target_epochs();
            if wanted > target_epochs {
                self.status.push(format!(
                    "Total epochs increased from {} to {}",
                    target_epochs, wanted
                ));
                target_epochs = wanted;
            }
            let wanted = self.control.steps_per_epoch();
            if wanted != steps {
                self.status.push(format!(
                    "Steps per epoch changed from {} to {}",
                    steps, wanted
                ));
                steps = wanted;
            }
            let wanted = self.control.batch_size();
            if wanted != batch_size {
                self.status.push(format!(
                    "Batch size changed from {} to {}",
                    batch_size, wanted
                ));
                batch_size = wanted;
                stream = self.build_stream(&folder);
                self.status.push(format!(
                    "New batch size of {} applied for epoch {}",
                    batch_size,
                    current_epoch + 1
                ));
            }

            scheduler.on_epoch_begin(current_epoch, model);
            notify(&mut self.observers, &self.status, |o| {
                o.on_epoch_begin(current_epoch, target_epochs)
            });

            match self.run_epoch(model, &mut stream, steps, batch_size) {
                Ok(epoch_loss) => {
                    scheduler.on_epoch_end(current_epoch, epoch_loss, model);
                    notify(&mut self.observers, &self.status, |o| {
                        o.on_epoch_end(current_epoch, epoch_loss, &*model)
                    });
                    self.status.push(format!(
                        "Epoch {}/{} - Loss: {:.6}, LR: {:.6}",
                        current_epoch + 1,
                        target_epochs,
                        epoch_loss,
                        model.learning_rate()
                    ));

                    if epoch_loss < best_loss {
                        best_loss = epoch_loss;
                        match store.save(model, current_epoch + 1) {
                            Ok(path) => self
                                .status
                                .push(format!("Checkpoint saved: {:?}", path)),
                            Err(e) => self
                                .status
                                .push(format!("Error saving checkpoint: {}", e)),
                        }
                    }
                    current_epoch += 1;
                }
                Err(Error::AlreadyExists(msg)) => {
                    // Stale stream identity. Rebuild under a fresh unique id
                    // and move on.
                    self.status.push(format!(
                        "Recovering from naming conflict ({}), recreating sample stream",
                        msg
                    ));
                    stream = self.build_stream(&folder);
                    self.status
                        .push(format!("New stream {} created", stream.id()));
                    current_epoch += 1;
                }
                Err(e) => {
                    self.status.push(format!(
                        "Error during epoch {}: {}, will attempt to continue",
                        current_epoch + 1,
                        e
                    ));
                    warn!("Epoch {} failed: {}", current_epoch + 1, e);
                    current_epoch += 1;
                }
            }
        }

        let stopped_by_user = self.control.stop_requested();
        if stopped_by_user {
            self.status.push("Training stopped by user.".to_string());
        }

        notify(&mut self.observers, &self.status, |o| o.on_train_end());

        let final_model_path = self.save_final(&store, model, current_epoch);

        Ok(TrainingReport {
            start_epoch,
            epochs_completed: current_epoch,
            best_loss,
            stopped_by_user,
            final_model_path,
        })
    }

    /// Restore the newest checkpoint if one exists. A broken checkpoint falls
    /// back to a fresh start rather than aborting the run.
    fn resume_if_possible(&self, store: &CheckpointStore, model: &mut dyn TraineeModel) -> usize {
        match store.find_latest() {
            Ok(Some((path, epoch))) => {
                self.status.push(format!(
                    "Latest checkpoint found: {:?} (epoch {})",
                    path, epoch
                ));
                match store.load_into(&path, model) {
                    Ok(resumed) => {
                        self.status
                            .push(format!("Training will resume from epoch {}", resumed + 1));
                        // The optimizer is rebuilt from scratch; only the
                        // weights carry over.
                        if let Err(e) = model.ensure_optimizer() {
                            self.status
                                .push(format!("Error re-initializing optimizer: {}", e));
                        }
                        resumed
                    }
                    Err(e) => {
                        self.status.push(format!(
                            "Error loading checkpoint: {}, starting from scratch",
                            e
                        ));
                        0
                    }
                }
            }
            Ok(None) => {
                self.status
                    .push("No checkpoints found. Starting training from scratch.".to_string());
                0
            }
            Err(e) => {
                self.status.push(format!(
                    "Error scanning checkpoints: {}, starting from scratch",
                    e
                ));
                0
            }
        }
    }

    fn build_stream(&mut self, folder: &ImageFolder) -> SampleStream {
        let seed = self.config.seed.wrapping_add(self.stream_rebuilds);
        self.stream_rebuilds += 1;
        SampleStream::new(
            folder.clone(),
            self.config.patch_size,
            Arc::clone(&self.teacher),
            seed,
            self.status.clone(),
        )
    }

    /// One epoch of optimizer steps. Returns the mean batch loss.
    fn run_epoch(
        &mut self,
        model: &mut dyn TraineeModel,
        stream: &mut SampleStream,
        steps: usize,
        batch_size: usize,
    ) -> Result<f64> {
        let mut total_loss = 0.0;
        for step in 0..steps {
            let (inputs, targets) = stream.next_batch(batch_size)?;
            let loss = model.train_on_batch(&inputs, &targets)?;
            total_loss += loss;

            if step % 10 == 0 {
                self.status
                    .push(format!("Step {} - Loss: {:.6}", step, loss));
            }
        }
        Ok(total_loss / steps.max(1) as f64)
    }

    fn save_final(
        &self,
        store: &CheckpointStore,
        model: &dyn TraineeModel,
        epoch: usize,
    ) -> Option<PathBuf> {
        match store.save_final(model, epoch) {
            Ok(path) => {
                self.status
                    .push(format!("Model trained and saved to {:?}.", path));
                Some(path)
            }
            Err(e) => {
                self.status.push(format!("Error saving final model: {}", e));
                match store.save_weights_only(model) {
                    Ok(path) => {
                        self.status
                            .push("Model weights saved successfully.".to_string());
                        Some(path)
                    }
                    Err(e2) => {
                        self.status
                            .push(format!("Failed to save weights as well: {}", e2));
                        None
                    }
                }
            }
        }
    }
}

/// Fan out one hook to every observer, isolating failures so a broken
/// reporter never interrupts training.
fn notify(
    observers: &mut [Box<dyn EpochObserver>],
    status: &StatusSender,
    mut hook: impl FnMut(&mut dyn EpochObserver) -> Result<()>,
) {
    for observer in observers {
        if let Err(e) = hook(observer.as_mut()) {
            status.push(format!("Error in observer {}: {}", observer.name(), e));
            info!("Observer {} failed: {}", observer.name(), e);
        }
    }
}
