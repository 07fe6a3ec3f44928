//! Epoch Observers
//!
//! Side-channel reporting hooked into the training loop. Observers never
//! influence training; a failing observer is logged and skipped so one bad
//! reporter cannot take the run down.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::model::TraineeModel;
use crate::status::StatusSender;
use crate::utils::Result;

/// Receives notifications at run and epoch boundaries.
///
/// `total_epochs` is passed on every call because the target can be raised
/// while the run is in flight.
pub trait EpochObserver: Send {
    fn name(&self) -> &'static str;

    fn on_train_begin(&mut self, _total_epochs: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _epoch: usize, _total_epochs: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _epoch: usize, _loss: f64, _model: &dyn TraineeModel) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Publishes completion percentage and an ETA derived from the average epoch
/// duration so far.
pub struct ProgressObserver {
    status: StatusSender,
    epoch_times: Vec<Duration>,
    epoch_start: Instant,
}

impl ProgressObserver {
    pub fn new(status: StatusSender) -> Self {
        Self {
            status,
            epoch_times: Vec::new(),
            epoch_start: Instant::now(),
        }
    }

    fn eta(&self, remaining_epochs: usize) -> Option<Duration> {
        if self.epoch_times.is_empty() {
            return None;
        }
        let total: Duration = self.epoch_times.iter().sum();
        let avg = total / self.epoch_times.len() as u32;
        Some(avg * remaining_epochs as u32)
    }
}

impl EpochObserver for ProgressObserver {
    fn name(&self) -> &'static str {
        "progress"
    }

    fn on_epoch_begin(&mut self, epoch: usize, total_epochs: usize) -> Result<()> {
        self.epoch_start = Instant::now();
        let percent = epoch as f64 / total_epochs.max(1) as f64 * 100.0;
        match self.eta(total_epochs.saturating_sub(epoch)) {
            Some(eta) => self.status.push(format!(
                "Progress: {:.1}%, ETA {}",
                percent,
                format_duration(eta)
            )),
            None => self.status.push(format!("Progress: {:.1}%", percent)),
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, _epoch: usize, _loss: f64, _model: &dyn TraineeModel) -> Result<()> {
        self.epoch_times.push(self.epoch_start.elapsed());
        Ok(())
    }

    fn on_train_end(&mut self) -> Result<()> {
        self.status.push("Training finished!".to_string());
        Ok(())
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Dumps model statistics every tenth epoch.
pub struct ModelStatsObserver {
    status: StatusSender,
}

impl ModelStatsObserver {
    pub fn new(status: StatusSender) -> Self {
        Self { status }
    }
}

impl EpochObserver for ModelStatsObserver {
    fn name(&self) -> &'static str {
        "model-stats"
    }

    fn on_epoch_end(&mut self, epoch: usize, loss: f64, model: &dyn TraineeModel) -> Result<()> {
        if epoch % 10 == 0 {
            self.status.push(format!("Model metrics at epoch {}:", epoch));
            self.status
                .push(format!("  Trainable params: {}", model.parameter_count()));
            self.status.push(format!("  Current loss: {:.6}", loss));
        }
        Ok(())
    }
}

/// One point of the loss/learning-rate series.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub learning_rate: f64,
}

/// Accumulates the per-epoch series for later charting or export.
#[derive(Default)]
pub struct ChartTracker {
    records: Vec<EpochRecord>,
}

impl ChartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }
}

impl EpochObserver for ChartTracker {
    fn name(&self) -> &'static str {
        "chart-tracker"
    }

    fn on_epoch_end(&mut self, epoch: usize, loss: f64, model: &dyn TraineeModel) -> Result<()> {
        self.records.push(EpochRecord {
            epoch,
            loss,
            learning_rate: model.learning_rate(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::net::{FastPerceptualNet, NetConfig};
    use crate::status::status_channel;

    fn tiny_model() -> FastPerceptualNet {
        let config = NetConfig {
            patch_size: 8,
            hidden_channels: 2,
            feature_channels: 4,
        };
        FastPerceptualNet::new(config, 0.001, 5).unwrap()
    }

    #[test]
    fn test_progress_percent_and_finish_line() {
        let (tx, rx) = status_channel();
        let mut obs = ProgressObserver::new(tx);

        obs.on_epoch_begin(0, 4).unwrap();
        obs.on_train_end().unwrap();

        let lines = rx.drain();
        assert_eq!(lines[0], "Progress: 0.0%");
        assert_eq!(lines[1], "Training finished!");
    }

    #[test]
    fn test_progress_reports_eta_after_first_epoch() {
        let (tx, rx) = status_channel();
        let mut obs = ProgressObserver::new(tx);
        let model = tiny_model();

        obs.on_epoch_begin(0, 4).unwrap();
        obs.on_epoch_end(0, 1.0, &model).unwrap();
        obs.on_epoch_begin(1, 4).unwrap();

        let lines = rx.drain();
        assert!(lines[1].starts_with("Progress: 25.0%, ETA "));
    }

    #[test]
    fn test_stats_cadence_every_ten_epochs() {
        let (tx, rx) = status_channel();
        let mut obs = ModelStatsObserver::new(tx);
        let model = tiny_model();

        for epoch in 0..21 {
            obs.on_epoch_end(epoch, 0.5, &model).unwrap();
        }

        let lines = rx.drain();
        let headers: Vec<_> = lines
            .iter()
            .filter(|l| l.starts_with("Model metrics"))
            .collect();
        assert_eq!(headers.len(), 3); // epochs 0, 10, 20
        assert!(lines.iter().any(|l| l.contains("Trainable params")));
    }

    #[test]
    fn test_chart_tracker_records_series() {
        let mut tracker = ChartTracker::new();
        let model = tiny_model();

        tracker.on_epoch_end(0, 1.0, &model).unwrap();
        tracker.on_epoch_end(1, 0.8, &model).unwrap();

        let records = tracker.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].epoch, 1);
        assert!((records[1].loss - 0.8).abs() < 1e-12);
        assert!((records[0].learning_rate - 0.001).abs() < 1e-12);
    }
}
