//! Checkpoint Manager
//!
//! Discovers, restores and persists model snapshots keyed by epoch number.
//! File names embed a zero-padded epoch plus a timestamp/random suffix so a
//! save can never collide with an existing file; on resume the highest
//! embedded epoch wins regardless of suffix.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::TraineeModel;
use crate::utils::{Error, Result};

const EPOCH_PREFIX: &str = "fast_perceptual_epoch_";
const FINAL_PREFIX: &str = "fast_perceptual_final_";
const WEIGHTS_PREFIX: &str = "fast_perceptual_weights_";

/// On-disk snapshot payload.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    epoch: usize,
    created_at: String,
    model: serde_json::Value,
}

/// Snapshot persistence for one checkpoint directory.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Use `dir` for snapshots, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Checkpoint directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Find the snapshot with the highest embedded epoch number.
    ///
    /// Files that do not parse are ignored; ties between files carrying the
    /// same epoch are broken arbitrarily.
    pub fn find_latest(&self) -> Result<Option<(PathBuf, usize)>> {
        let mut best: Option<(PathBuf, usize)> = None;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(epoch) = parse_epoch_filename(name) {
                if best.as_ref().map_or(true, |(_, e)| epoch > *e) {
                    best = Some((path, epoch));
                }
            }
        }

        Ok(best)
    }

    /// Restore a snapshot into `model`. Returns the epoch the snapshot was
    /// taken at. Fails on unreadable files or architecture mismatch; the
    /// caller is expected to fall back to training from scratch.
    pub fn load_into(&self, path: &Path, model: &mut dyn TraineeModel) -> Result<usize> {
        let raw = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| Error::Checkpoint(format!("unreadable snapshot {:?}: {}", path, e)))?;
        model.restore(&snapshot.model)?;
        info!("Restored snapshot {:?} (epoch {})", path, snapshot.epoch);
        Ok(snapshot.epoch)
    }

    /// Persist a full snapshot for the given epoch under a collision-free
    /// name. Returns the written path.
    pub fn save(&self, model: &dyn TraineeModel, epoch: usize) -> Result<PathBuf> {
        let snapshot = Snapshot {
            epoch,
            created_at: Utc::now().to_rfc3339(),
            model: model.snapshot()?,
        };
        let path = self.unique_path(&format!("{}{:02}", EPOCH_PREFIX, epoch));
        self.write_snapshot(&path, &snapshot)?;
        info!("Checkpoint saved to {:?}", path);
        Ok(path)
    }

    /// Persist the final snapshot at run exit.
    pub fn save_final(&self, model: &dyn TraineeModel, epoch: usize) -> Result<PathBuf> {
        let snapshot = Snapshot {
            epoch,
            created_at: Utc::now().to_rfc3339(),
            model: model.snapshot()?,
        };
        let path = self.unique_path(FINAL_PREFIX.trim_end_matches('_'));
        self.write_snapshot(&path, &snapshot)?;
        info!("Final model saved to {:?}", path);
        Ok(path)
    }

    /// Degraded fallback: persist weights only.
    pub fn save_weights_only(&self, model: &dyn TraineeModel) -> Result<PathBuf> {
        let value = model.weights_snapshot()?;
        let path = self.unique_path(WEIGHTS_PREFIX.trim_end_matches('_'));
        let json = serde_json::to_string(&value)?;
        fs::write(&path, json)?;
        warn!("Full save failed earlier; weights-only snapshot written to {:?}", path);
        Ok(path)
    }

    fn write_snapshot(&self, path: &Path, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Build `{stem}_{unix_ts}_{8 random alnum}.json`, retrying the suffix on
    /// the (unlikely) chance of a collision.
    fn unique_path(&self, stem: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        loop {
            let suffix: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            let candidate = self
                .dir
                .join(format!("{}_{}_{}.json", stem, timestamp, suffix.to_lowercase()));
            if !candidate.exists() {
                return candidate;
            }
        }
    }
}

/// Extract the epoch number from an epoch-snapshot filename.
///
/// Expected shape: `fast_perceptual_epoch_{epoch}_{suffix...}.json`; files
/// without a suffix (`fast_perceptual_epoch_07.json`) parse too.
pub fn parse_epoch_filename(name: &str) -> Option<usize> {
    let rest = name.strip_prefix(EPOCH_PREFIX)?;
    let rest = rest.strip_suffix(".json")?;
    let digits = rest.split('_').next()?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::net::{FastPerceptualNet, NetConfig};
    use tempfile::TempDir;

    fn tiny_model() -> FastPerceptualNet {
        let config = NetConfig {
            patch_size: 8,
            hidden_channels: 2,
            feature_channels: 4,
        };
        FastPerceptualNet::new(config, 0.001, 11).unwrap()
    }

    #[test]
    fn test_parse_epoch_filename() {
        assert_eq!(
            parse_epoch_filename("fast_perceptual_epoch_07_1712345678_ab12cd34.json"),
            Some(7)
        );
        assert_eq!(parse_epoch_filename("fast_perceptual_epoch_123.json"), Some(123));
        assert_eq!(parse_epoch_filename("fast_perceptual_final_1712345678_x.json"), None);
        assert_eq!(parse_epoch_filename("unrelated.json"), None);
        assert_eq!(parse_epoch_filename("fast_perceptual_epoch_junk.json"), None);
    }

    #[test]
    fn test_find_latest_picks_highest_epoch() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let model = tiny_model();

        store.save(&model, 3).unwrap();
        store.save(&model, 7).unwrap();
        store.save(&model, 5).unwrap();

        let (path, epoch) = store.find_latest().unwrap().unwrap();
        assert_eq!(epoch, 7);
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("fast_perceptual_epoch_07"));
    }

    #[test]
    fn test_find_latest_empty_dir() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        assert!(store.find_latest().unwrap().is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let model = tiny_model();

        let path = store.save(&model, 4).unwrap();

        let mut restored = tiny_model();
        let epoch = store.load_into(&path, &mut restored).unwrap();
        assert_eq!(epoch, 4);
    }

    #[test]
    fn test_load_corrupt_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let path = dir.path().join("fast_perceptual_epoch_02_0_bad.json");
        fs::write(&path, "{ definitely not json").unwrap();

        let mut model = tiny_model();
        assert!(matches!(
            store.load_into(&path, &mut model),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_saves_never_collide() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let model = tiny_model();

        let a = store.save(&model, 1).unwrap();
        let b = store.save(&model, 1).unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn test_weights_only_fallback() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let model = tiny_model();

        let path = store.save_weights_only(&model).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("fast_perceptual_weights"));
        // Weights-only files are not picked up by resume.
        assert!(store.find_latest().unwrap().is_none());
    }
}
